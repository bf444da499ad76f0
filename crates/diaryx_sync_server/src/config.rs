use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0).
    pub host: String,
    /// Server port (default: 3030).
    pub port: u16,
    /// Path to the SQLite database holding the causal log for every
    /// workspace and body document (default: ./diaryx_sync.db).
    pub database_path: PathBuf,
    /// Directory where per-workspace attachment blobs and snapshot archives
    /// are kept (default: ./diaryx_data).
    pub workspace_data_dir: PathBuf,
    /// CORS allowed origins (comma-separated).
    pub cors_origins: Vec<String>,
    /// Coarse per-workspace bearer tokens: `workspace_id -> token`.
    ///
    /// Loaded from `WORKSPACE_TOKENS` as `id1:token1,id2:token2`. A request
    /// presenting no matching token for a workspace id is rejected with
    /// `AuthRejected` (see `diaryx_core::error`).
    pub workspace_tokens: std::collections::HashMap<String, String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path = PathBuf::from(
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./diaryx_sync.db".to_string()),
        );

        let workspace_data_dir = PathBuf::from(
            env::var("WORKSPACE_DATA_DIR").unwrap_or_else(|_| "./diaryx_data".to_string()),
        );

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5174,http://localhost:5175".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let workspace_tokens = env::var("WORKSPACE_TOKENS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| {
                let mut parts = pair.splitn(2, ':');
                let id = parts.next()?.trim();
                let token = parts.next()?.trim();
                if id.is_empty() || token.is_empty() {
                    None
                } else {
                    Some((id.to_string(), token.to_string()))
                }
            })
            .collect();

        Ok(Config {
            host,
            port,
            database_path,
            workspace_data_dir,
            cors_origins,
            workspace_tokens,
        })
    }

    /// Get the server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check whether `token` authorizes access to `workspace_id`.
    pub fn authorize(&self, workspace_id: &str, token: &str) -> bool {
        self.workspace_tokens
            .get(workspace_id)
            .is_some_and(|expected| expected == token)
    }

    /// Reverse-lookup: which workspace (if any) does `token` authorize.
    ///
    /// Tokens are assumed unique across workspaces; if two workspaces share a
    /// token, the first match in iteration order wins.
    pub fn workspace_for_token(&self, token: &str) -> Option<String> {
        self.workspace_tokens
            .iter()
            .find(|(_, t)| t.as_str() == token)
            .map(|(id, _)| id.clone())
    }

    #[cfg(test)]
    pub fn for_test(workspace_tokens: std::collections::HashMap<String, String>) -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 3030,
            database_path: PathBuf::from("test.db"),
            workspace_data_dir: PathBuf::from("test_data"),
            cors_origins: vec![],
            workspace_tokens,
        }
    }
}

/// Error parsing the server's environment-driven configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// `PORT` was set but not a valid `u16`.
    InvalidPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorize_matches_token() {
        let mut workspace_tokens = std::collections::HashMap::new();
        workspace_tokens.insert("ws1".to_string(), "secret".to_string());

        let config = Config {
            host: "0.0.0.0".to_string(),
            port: 3030,
            database_path: PathBuf::from("test.db"),
            workspace_data_dir: PathBuf::from("test_data"),
            cors_origins: vec![],
            workspace_tokens,
        };

        assert!(config.authorize("ws1", "secret"));
        assert!(!config.authorize("ws1", "wrong"));
        assert!(!config.authorize("ws2", "secret"));
    }

    #[test]
    fn test_workspace_for_token() {
        let mut workspace_tokens = std::collections::HashMap::new();
        workspace_tokens.insert("ws1".to_string(), "secret".to_string());
        let config = Config::for_test(workspace_tokens);

        assert_eq!(
            config.workspace_for_token("secret"),
            Some("ws1".to_string())
        );
        assert_eq!(config.workspace_for_token("nope"), None);
    }

    #[test]
    fn test_server_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_path: PathBuf::from("test.db"),
            workspace_data_dir: PathBuf::from("test_data"),
            cors_origins: vec![],
            workspace_tokens: std::collections::HashMap::new(),
        };
        assert_eq!(config.server_addr(), "127.0.0.1:8080");
    }
}
