//! Session flag cookie for the session dedup strategy

use axum::http::{header, HeaderMap};

/// Whether the request carries `<cookie_name>=1`
pub fn has_session_flag(headers: &HeaderMap, cookie_name: &str) -> bool {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(name, value)| name.trim() == cookie_name && value.trim() == "1")
}

/// Session cookie (no Max-Age/Expires) marking the session as counted
pub fn session_flag_cookie(cookie_name: &str) -> String {
    format!("{cookie_name}=1; Path=/; HttpOnly; SameSite=Lax")
}
