mod transport;

#[cfg(test)]
pub(crate) mod testing;

use once_cell::sync::Lazy;
use regex::Regex;

pub use transport::{Content, Header, Probe, ReqwestTransport, Response, Transport, TransportError};

static URL_CREDENTIALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9+.-]*://)[^/@]+@(.*)$").expect("valid credentials regex")
});

/// Hides a `user[:password]@` portion of `url` so it can be logged.
#[must_use]
pub fn mask_url(url: &str) -> String {
    match URL_CREDENTIALS.captures(url) {
        Some(captures) => format!("{}********@{}", &captures[1], &captures[2]),
        None => url.to_string(),
    }
}

pub(crate) fn bearer(token: &str) -> Header {
    ("Authorization".to_string(), format!("Bearer {token}"))
}
