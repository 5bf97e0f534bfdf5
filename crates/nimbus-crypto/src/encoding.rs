//! base64url helpers for keys, attributes and links on the wire
//!
//! The service uses the URL-safe alphabet without padding. Some older
//! payloads carry `,` separators or standard-alphabet characters; both are
//! tolerated on decode.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use nimbus_core::{CryptoError, CryptoResult};

pub fn b64_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn b64_decode(s: &str) -> CryptoResult<Vec<u8>> {
    let normalized: String = s
        .trim()
        .trim_end_matches('=')
        .chars()
        .filter(|c| *c != ',')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| CryptoError::InvalidEncoding(format!("base64: {e}")))
}
