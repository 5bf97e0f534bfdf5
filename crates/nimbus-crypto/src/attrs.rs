//! Node attribute encryption
//!
//! Plaintext is the marker `MEGA` followed by compact JSON (`{"n":"name",...}`),
//! zero-padded to the block size and CBC-encrypted under the node's attribute
//! key with an all-zero IV. Decoding fails closed: a wrong key, a missing
//! marker or a missing name is `CorruptAttributes`, never a placeholder name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use nimbus_core::{CryptoError, CryptoResult};

use crate::codec::{self, BLOCK_SIZE};
use crate::encoding::{b64_decode, b64_encode};
use crate::keys::AesKey;

const MARKER: &[u8] = b"MEGA";

/// Decrypted node attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(rename = "n")]
    pub name: String,
    /// Everything else the node carries (fingerprint, labels, ...), kept
    /// verbatim so a re-encode does not drop it
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Attributes {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: Map::new(),
        }
    }
}

/// Serialize to the padded plaintext form.
pub fn encode(attributes: &Attributes) -> CryptoResult<Vec<u8>> {
    let json = serde_json::to_vec(attributes)
        .map_err(|e| CryptoError::CorruptAttributes(format!("serialize: {e}")))?;
    let mut plain = Vec::with_capacity(MARKER.len() + json.len() + BLOCK_SIZE);
    plain.extend_from_slice(MARKER);
    plain.extend_from_slice(&json);
    let padded = plain.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    plain.resize(padded, 0);
    Ok(plain)
}

/// Parse the padded plaintext form.
pub fn decode(plain: &[u8]) -> CryptoResult<Attributes> {
    let end = plain.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let trimmed = &plain[..end];

    let json = trimmed
        .strip_prefix(MARKER)
        .filter(|rest| rest.first() == Some(&b'{'))
        .ok_or_else(|| CryptoError::CorruptAttributes("missing attribute marker".into()))?;

    serde_json::from_slice(json).map_err(|e| CryptoError::CorruptAttributes(format!("json: {e}")))
}

pub fn encrypt(key: &AesKey, attributes: &Attributes) -> CryptoResult<Vec<u8>> {
    let mut data = encode(attributes)?;
    codec::cbc_encrypt_zero_iv(key, &mut data)?;
    Ok(data)
}

pub fn decrypt(key: &AesKey, ciphertext: &[u8]) -> CryptoResult<Attributes> {
    let mut data = ciphertext.to_vec();
    codec::cbc_decrypt_zero_iv(key, &mut data)?;
    decode(&data)
}

/// Encrypt to the base64url wire form carried in a node's `a` field.
pub fn encrypt_b64(key: &AesKey, attributes: &Attributes) -> CryptoResult<String> {
    Ok(b64_encode(&encrypt(key, attributes)?))
}

pub fn decrypt_b64(key: &AesKey, encoded: &str) -> CryptoResult<Attributes> {
    let ciphertext = b64_decode(encoded)
        .map_err(|e| CryptoError::CorruptAttributes(format!("attribute string: {e}")))?;
    decrypt(key, &ciphertext)
}
