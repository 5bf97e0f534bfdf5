//! Public file links
//!
//! A link carries the file handle and the raw 256-bit file key, so anyone
//! holding it can decrypt the file without an account. Two URL shapes are in
//! circulation:
//!
//! - `https://mega.nz/#!<handle>!<key>`
//! - `https://mega.nz/file/<handle>#<key>`

use std::fmt;
use std::str::FromStr;

use nimbus_core::{CryptoError, CryptoResult, NodeHandle};

use crate::keys::FileKey;

const LINK_BASE: &str = "https://mega.nz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLink {
    pub handle: NodeHandle,
    pub key: FileKey,
}

impl FileLink {
    pub fn new(handle: NodeHandle, key: FileKey) -> Self {
        Self { handle, key }
    }

    pub fn parse(url: &str) -> CryptoResult<Self> {
        let url = url.trim();
        let (handle, key) = if let Some((_, rest)) = url.split_once("/file/") {
            rest.split_once('#')
                .ok_or_else(|| invalid(url, "missing key fragment"))?
        } else if let Some((_, rest)) = url.split_once("#!") {
            rest.split_once('!')
                .ok_or_else(|| invalid(url, "missing key separator"))?
        } else {
            return Err(invalid(url, "not a file link"));
        };

        // Trailing query or path components are not part of the key
        let key = key.split(['?', '/', '#']).next().unwrap_or_default();
        if handle.is_empty() || key.is_empty() {
            return Err(invalid(url, "empty handle or key"));
        }
        let raw = crate::encoding::b64_decode(key)?;
        let key = FileKey::from_slice(&raw).map_err(|_| invalid(url, "key is not 256 bits"))?;
        Ok(Self::new(NodeHandle::new(handle), key))
    }

    /// The `#!handle!key` form.
    pub fn to_url(&self) -> String {
        format!("{LINK_BASE}/#!{}!{}", self.handle, self.key.to_b64())
    }
}

impl fmt::Display for FileLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

impl FromStr for FileLink {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn invalid(url: &str, reason: &str) -> CryptoError {
    // Only the prefix: the tail of a link is key material
    let shown: String = url.chars().take(24).collect();
    CryptoError::InvalidEncoding(format!("{reason}: {shown}..."))
}
