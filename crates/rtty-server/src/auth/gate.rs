//! Token gate for HTTP requests and WebSocket upgrades.
//!
//! The shared session token arrives either once as a `token` query
//! parameter (swapped for a cookie by the HTTP layer) or as the session
//! cookie afterwards. Every failure is reported the same way.

use axum::http::{header, HeaderMap};
use rtty_core::safe_equal;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "rtty_session";

/// Whether `presented` matches the live token. No live token, or nothing
/// presented, is always a failure.
pub fn is_authorized(expected: Option<&str>, presented: Option<&str>) -> bool {
    match (expected, presented) {
        (Some(expected), Some(presented)) => {
            safe_equal(expected.as_bytes(), presented.as_bytes())
        }
        _ => false,
    }
}

/// Extract the session token from the `Cookie` header(s).
pub fn token_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
}

/// A WebSocket upgrade's `Origin`, if present, must name the serving host.
pub fn origin_matches(headers: &HeaderMap) -> bool {
    let origin = match headers.get(header::ORIGIN) {
        None => return true,
        Some(v) => match v.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        },
    };
    let host = match headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        Some(h) => h,
        None => return false,
    };

    let origin_host = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin)
        .trim_end_matches('/');
    origin_host.eq_ignore_ascii_case(host)
}

/// Whether the request reached us over HTTPS, as reported by the
/// TLS-terminating tunnel in front of the relay.
pub fn is_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or("").trim().eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

/// Build the `Set-Cookie` value for a freshly exchanged token.
pub fn session_cookie(token: &str, secure: bool, max_age_secs: u64) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn authorization_requires_both_sides() {
        assert!(is_authorized(Some("abc"), Some("abc")));
        assert!(!is_authorized(Some("abc"), Some("abd")));
        assert!(!is_authorized(Some("abc"), None));
        assert!(!is_authorized(None, Some("abc")));
        assert!(!is_authorized(None, None));
    }

    #[test]
    fn cookie_is_found_among_others() {
        let h = headers(&[(header::COOKIE, "theme=dark; rtty_session=s3cret; lang=en")]);
        assert_eq!(token_from_cookies(&h).as_deref(), Some("s3cret"));

        let h = headers(&[
            (header::COOKIE, "theme=dark"),
            (header::COOKIE, "rtty_session=second"),
        ]);
        assert_eq!(token_from_cookies(&h).as_deref(), Some("second"));

        let h = headers(&[(header::COOKIE, "rtty_session_old=x")]);
        assert_eq!(token_from_cookies(&h), None);
    }

    #[test]
    fn origin_must_match_host_when_present() {
        assert!(origin_matches(&headers(&[(header::HOST, "a.example.com")])));
        assert!(origin_matches(&headers(&[
            (header::HOST, "a.example.com"),
            (header::ORIGIN, "https://a.example.com"),
        ])));
        assert!(origin_matches(&headers(&[
            (header::HOST, "127.0.0.1:7681"),
            (header::ORIGIN, "http://127.0.0.1:7681"),
        ])));
        assert!(!origin_matches(&headers(&[
            (header::HOST, "a.example.com"),
            (header::ORIGIN, "https://evil.example.com"),
        ])));
        assert!(!origin_matches(&headers(&[(header::ORIGIN, "https://a.example.com")])));
    }

    #[test]
    fn https_detection_uses_forwarded_proto() {
        assert!(is_https(&headers(&[(
            header::HeaderName::from_static("x-forwarded-proto"),
            "https"
        )])));
        assert!(!is_https(&headers(&[(
            header::HeaderName::from_static("x-forwarded-proto"),
            "http"
        )])));
        assert!(!is_https(&HeaderMap::new()));
    }

    #[test]
    fn cookie_flags() {
        let plain = session_cookie("t", false, 60);
        assert_eq!(plain, "rtty_session=t; Path=/; HttpOnly; SameSite=Lax; Max-Age=60");
        assert!(session_cookie("t", true, 60).ends_with("; Secure"));
    }
}
