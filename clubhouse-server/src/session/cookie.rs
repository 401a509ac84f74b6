//! Session cookie construction
//!
//! One cookie, fixed attributes: httpOnly, SameSite=Lax, Path=/, Secure in
//! anything but local development. Logout clears it with Max-Age=-1.

use cookie::{Cookie, SameSite};

/// Build the `Set-Cookie` value carrying a freshly issued session id
pub fn session_cookie(name: &str, value: &str, secure: bool, max_age_secs: u64) -> String {
    Cookie::build((name.to_owned(), value.to_owned()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(max_age_secs as i64))
        .build()
        .to_string()
}

/// Build the `Set-Cookie` value that clears the session cookie
pub fn clear_session_cookie(name: &str, secure: bool) -> String {
    Cookie::build((name.to_owned(), String::new()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(-1))
        .build()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_carries_required_attributes() {
        let header = session_cookie("session_id", "abc123", true, 2_592_000);
        assert!(header.starts_with("session_id=abc123"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("Secure"));
        assert!(header.contains("SameSite=Lax"));
        assert!(header.contains("Path=/"));
        assert!(header.contains("Max-Age=2592000"));
    }

    #[test]
    fn clearing_sets_negative_max_age() {
        let header = clear_session_cookie("session_id", false);
        assert!(header.starts_with("session_id="));
        assert!(header.contains("Max-Age=-1"));
        assert!(!header.contains("Secure"));
    }
}
