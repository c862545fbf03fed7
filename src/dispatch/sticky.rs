//! Cookie-based backend affinity.
//!
//! The cookie `{name}-{SERVICE}` carries a short digest of the backend URL,
//! so backend addresses never reach the client.

use sha2::{Digest, Sha256};

/// Name of the affinity cookie for `service`.
pub fn cookie_name(base: &str, service: &str) -> String {
    format!("{}-{}", base, service)
}

/// Opaque token identifying `url`: first 8 bytes of its SHA-256, hex-encoded.
pub fn token(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}

/// `Set-Cookie` value pinning the client to `url`.
pub fn set_cookie(base: &str, service: &str, url: &str) -> String {
    format!("{}={}; Path=/; HttpOnly", cookie_name(base, service), token(url))
}

/// Finds the value of cookie `name` in a `Cookie` header.
pub fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim())
    })
}

/// Returns the URL among `urls` the request's affinity cookie points at.
pub fn pinned_url(cookie_header: Option<&str>, base: &str, service: &str, urls: &[String]) -> Option<String> {
    let value = find_cookie(cookie_header?, &cookie_name(base, service))?;
    urls.iter().find(|url| token(url) == value).cloned()
}
