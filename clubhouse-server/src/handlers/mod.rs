//! HTTP handlers for the service surface

pub mod auth;
pub mod health;
pub mod mfa;
pub mod notifications;
pub mod push;

use axum::http::HeaderMap;

/// Best-effort client IP for rate-limit keying.
///
/// Trusts the first `X-Forwarded-For` hop (the service runs behind a
/// reverse proxy); falls back to a constant so direct connections still
/// share one bucket.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "direct".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn takes_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.2"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.9");
    }

    #[test]
    fn falls_back_without_header() {
        assert_eq!(client_ip(&HeaderMap::new()), "direct");
    }
}
