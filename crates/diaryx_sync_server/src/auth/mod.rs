mod middleware;

pub use middleware::{authorize_request, extract_token, url_query_param};
