//! Bearer-token guard for the admin API.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::http::server::AppState;

/// Whether `headers` carry `Authorization: Bearer <api_key>`. An empty key never matches.
pub fn is_authorized(headers: &HeaderMap, api_key: &str) -> bool {
    if api_key.is_empty() {
        return false;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == api_key)
}

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Read per request so a reloaded key takes effect immediately.
    let inner = state.inner.load_full();
    if is_authorized(request.headers(), &inner.config.admin.api_key) {
        return Ok(next.run(request).await);
    }

    tracing::warn!(path = %request.uri().path(), "Rejected admin request");
    Err(StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_accepted() {
        assert!(is_authorized(&headers("Bearer secret"), "secret"));
    }

    #[test]
    fn test_wrong_or_missing_token_rejected() {
        assert!(!is_authorized(&headers("Bearer other"), "secret"));
        assert!(!is_authorized(&headers("Basic secret"), "secret"));
        assert!(!is_authorized(&HeaderMap::new(), "secret"));
        assert!(!is_authorized(&headers("Bearer "), ""));
    }
}
