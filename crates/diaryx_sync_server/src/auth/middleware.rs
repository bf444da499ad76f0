use axum::http::request::Parts;

use crate::config::Config;

/// Extract a bearer token from the `Authorization` header or a `token` query
/// parameter.
///
/// The query parameter fallback exists because the `/sync2` WebSocket upgrade
/// is issued by browser JavaScript, which cannot set arbitrary headers on a
/// handshake request.
pub fn extract_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
        .or_else(|| {
            parts
                .uri
                .query()
                .and_then(|q| url_query_param(q, "token"))
        })
}

/// Extract a named parameter from a raw (already-percent-undecoded) query
/// string. Good enough for the ASCII tokens this server issues; it does not
/// percent-decode, matching how `token`/`session` values are generated here.
pub fn url_query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// Resolve a bearer token against the server's coarse per-workspace token
/// table (see [`Config::workspace_for_token`]).
///
/// Returns the workspace id the token authorizes, or `None` if the token is
/// missing or unrecognized. There is no notion of a user, device, or session
/// beyond this: access control in this system is "did the caller present the
/// token for this workspace," nothing finer.
pub fn authorize_request(config: &Config, parts: &Parts) -> Option<String> {
    let token = extract_token(parts)?;
    config.workspace_for_token(&token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with_uri(uri: &str) -> Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    #[test]
    fn extracts_token_from_query_string() {
        let parts = parts_with_uri("/sync2?token=abc123&session=XYZ");
        assert_eq!(extract_token(&parts), Some("abc123".to_string()));
    }

    #[test]
    fn extracts_token_from_authorization_header() {
        let mut parts = parts_with_uri("/api/workspaces/ws1/snapshot");
        parts
            .headers
            .insert("Authorization", "Bearer secret-token".parse().unwrap());
        assert_eq!(extract_token(&parts), Some("secret-token".to_string()));
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let mut parts = parts_with_uri("/sync2?token=from-query");
        parts
            .headers
            .insert("Authorization", "Bearer from-header".parse().unwrap());
        assert_eq!(extract_token(&parts), Some("from-header".to_string()));
    }

    #[test]
    fn missing_token_is_none() {
        let parts = parts_with_uri("/sync2?session=XYZ");
        assert_eq!(extract_token(&parts), None);
    }

    #[test]
    fn authorize_request_resolves_workspace() {
        let mut tokens = std::collections::HashMap::new();
        tokens.insert("ws1".to_string(), "secret".to_string());
        let config = Config::for_test(tokens);

        let parts = parts_with_uri("/sync2?token=secret");
        assert_eq!(authorize_request(&config, &parts), Some("ws1".to_string()));

        let parts = parts_with_uri("/sync2?token=wrong");
        assert_eq!(authorize_request(&config, &parts), None);
    }
}
