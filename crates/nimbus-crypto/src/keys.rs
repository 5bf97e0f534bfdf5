//! Key value types and node key wrapping
//!
//! ```text
//! MasterKey (128-bit)
//!   ├── Folder NodeKey (128-bit, wrapped by master, share or ancestor key)
//!   │     └── wraps children, encrypts the folder's attributes
//!   └── File NodeKey (256-bit, one stored value, several views)
//!         bytes  0..16  content_key XOR (nonce || meta_mac)
//!         bytes 16..24  nonce     (CTR counter prefix, CBC-MAC seed)
//!         bytes 24..32  meta_mac  (stored condensed MAC)
//! ```
//!
//! The file key is kept as the single 256-bit value and every sub-key is a
//! view computed from it, so the pre-fold nonce words can never drift from
//! the folded content key.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use nimbus_core::{CryptoError, CryptoResult, NodeKind};

use crate::codec;
use crate::encoding::{b64_decode, b64_encode};

/// Size of an AES-128 key in bytes
pub const KEY_SIZE: usize = 16;

/// Size of a stored file key in bytes
pub const FILE_KEY_SIZE: usize = 32;

/// Size of the CTR nonce (the high half of every counter block)
pub const NONCE_SIZE: usize = 8;

/// Size of the condensed MAC stored on a file node
pub const META_MAC_SIZE: usize = 8;

/// A 128-bit AES key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AesKey {
    bytes: [u8; KEY_SIZE],
}

impl AesKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::KeyUnwrapFailed(format!(
                "expected {KEY_SIZE}-byte key, got {} bytes",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub fn from_b64(s: &str) -> CryptoResult<Self> {
        let raw = Zeroizing::new(b64_decode(s)?);
        Self::from_slice(&raw)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn to_b64(&self) -> String {
        b64_encode(&self.bytes)
    }
}

impl PartialEq for AesKey {
    fn eq(&self, other: &Self) -> bool {
        ct_eq(&self.bytes, &other.bytes)
    }
}

impl Eq for AesKey {}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A key encrypted under another key, exactly as received.
///
/// Length is validated once at construction: a non-zero multiple of the
/// AES block size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    bytes: Vec<u8>,
}

impl WrappedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> CryptoResult<Self> {
        if bytes.is_empty() || bytes.len() % codec::BLOCK_SIZE != 0 {
            return Err(CryptoError::KeyUnwrapFailed(format!(
                "wrapped key length {} is not a non-zero multiple of {}",
                bytes.len(),
                codec::BLOCK_SIZE
            )));
        }
        Ok(Self { bytes })
    }

    pub fn from_b64(s: &str) -> CryptoResult<Self> {
        Self::from_bytes(b64_decode(s)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_b64(&self) -> String {
        b64_encode(&self.bytes)
    }
}

/// The 256-bit key stored on a file node. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKey {
    bytes: [u8; FILE_KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; FILE_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; FILE_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::KeyUnwrapFailed(format!(
                "expected {FILE_KEY_SIZE}-byte file key, got {} bytes",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Pack a content key, nonce and condensed MAC into the stored form.
    pub fn compose(
        content_key: &AesKey,
        nonce: &[u8; NONCE_SIZE],
        meta_mac: &[u8; META_MAC_SIZE],
    ) -> Self {
        let mut bytes = [0u8; FILE_KEY_SIZE];
        bytes[16..24].copy_from_slice(nonce);
        bytes[24..32].copy_from_slice(meta_mac);
        for i in 0..KEY_SIZE {
            bytes[i] = content_key.as_bytes()[i] ^ bytes[KEY_SIZE + i];
        }
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; FILE_KEY_SIZE] {
        &self.bytes
    }

    /// Low half XOR high half.
    pub fn content_key(&self) -> AesKey {
        let mut folded = [0u8; KEY_SIZE];
        for (i, byte) in folded.iter_mut().enumerate() {
            *byte = self.bytes[i] ^ self.bytes[KEY_SIZE + i];
        }
        let key = AesKey::from_bytes(folded);
        folded.zeroize();
        key
    }

    /// CBC-MAC key for content integrity. The protocol reuses the content key.
    pub fn mac_key(&self) -> AesKey {
        self.content_key()
    }

    /// Attribute encryption key. The protocol reuses the content key.
    pub fn attribute_key(&self) -> AesKey {
        self.content_key()
    }

    /// Pre-fold bytes 16..24.
    pub fn nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&self.bytes[16..24]);
        nonce
    }

    /// Pre-fold bytes 24..32: the condensed MAC recorded at upload time.
    pub fn meta_mac(&self) -> [u8; META_MAC_SIZE] {
        let mut mac = [0u8; META_MAC_SIZE];
        mac.copy_from_slice(&self.bytes[24..32]);
        mac
    }

    /// All three views at once, derived from the same stored bytes.
    pub fn split(&self) -> (AesKey, [u8; NONCE_SIZE], [u8; META_MAC_SIZE]) {
        (self.content_key(), self.nonce(), self.meta_mac())
    }

    pub fn to_b64(&self) -> String {
        b64_encode(&self.bytes)
    }
}

impl PartialEq for FileKey {
    fn eq(&self, other: &Self) -> bool {
        ct_eq(&self.bytes, &other.bytes)
    }
}

impl Eq for FileKey {}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// An unwrapped node key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKey {
    Folder(AesKey),
    File(FileKey),
}

impl NodeKey {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeKey::Folder(_) => NodeKind::Folder,
            NodeKey::File(_) => NodeKind::File,
        }
    }

    /// Key used to encrypt this node's attributes.
    pub fn attribute_key(&self) -> AesKey {
        match self {
            NodeKey::Folder(key) => key.clone(),
            NodeKey::File(key) => key.attribute_key(),
        }
    }

    /// Key that wraps this node's children. Only folders have children.
    pub fn wrapping_key(&self) -> Option<AesKey> {
        match self {
            NodeKey::Folder(key) => Some(key.clone()),
            NodeKey::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileKey> {
        match self {
            NodeKey::File(key) => Some(key),
            NodeKey::Folder(_) => None,
        }
    }

    fn raw(&self) -> &[u8] {
        match self {
            NodeKey::Folder(key) => key.as_bytes(),
            NodeKey::File(key) => key.as_bytes(),
        }
    }
}

/// Unwrap a node key and check its size against the node type.
pub fn unwrap_node_key(
    wrapped: &WrappedKey,
    unwrapping_key: &AesKey,
    kind: NodeKind,
) -> CryptoResult<NodeKey> {
    let raw = codec::unwrap_key(unwrapping_key, wrapped.as_bytes())?;
    match (kind, raw.len()) {
        (NodeKind::Folder, KEY_SIZE) => Ok(NodeKey::Folder(AesKey::from_slice(&raw)?)),
        (NodeKind::File, FILE_KEY_SIZE) => Ok(NodeKey::File(FileKey::from_slice(&raw)?)),
        (kind, len) => Err(CryptoError::KeyUnwrapFailed(format!(
            "{len}-byte key is not valid for a {kind:?} node"
        ))),
    }
}

/// Wrap a node key for storage under `wrapping_key`.
pub fn wrap_node_key(key: &NodeKey, wrapping_key: &AesKey) -> CryptoResult<WrappedKey> {
    let wrapped = codec::wrap_key(wrapping_key, key.raw())?;
    WrappedKey::from_bytes(wrapped)
}

/// Generate a random folder key.
pub fn generate_folder_key() -> NodeKey {
    NodeKey::Folder(codec::random_key())
}

pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
