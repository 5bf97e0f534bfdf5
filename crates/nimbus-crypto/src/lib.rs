//! nimbus-crypto: client-side key management for nimbus
//!
//! The server only ever sees wrapped keys and encrypted attributes. Every key
//! is unwrapped here, on the client.
//!
//! Key hierarchy:
//! ```text
//! Password
//!   └── Password Key (legacy AES hash, or PBKDF2-HMAC-SHA512 with salt)
//!         └── Master Key (128-bit, wrapped by the password key)
//!               ├── Share Keys (128-bit, wrapped by the master key)
//!               └── Node Keys (wrapped by master, share or ancestor folder key)
//!                     ├── Folder: 128-bit, attributes + wraps children
//!                     └── File: 256-bit, content key + CTR nonce + stored MAC
//! ```
//!
//! Modes: key wrapping is per-block AES-128, content is AES-128-CTR,
//! attributes are AES-128-CBC with a zero IV, integrity is a chained CBC-MAC.

pub mod attrs;
pub mod cache;
pub mod codec;
pub mod encoding;
pub mod kdf;
pub mod keys;
pub mod link;
pub mod manager;

pub use attrs::Attributes;
pub use cache::{KeyCache, SlotState};
pub use codec::{
    cbc_mac, random_key, random_nonce, stream_cipher, stream_cipher_at, unwrap_key, wrap_key,
    CbcMac, CtrStream, BLOCK_SIZE,
};
pub use kdf::{
    decrypt_master_key, derive_credentials, encrypt_master_key, ephemeral_account, select_kdf,
    verify_session_challenge, AccountParams, AccountVersion, DerivedCredentials,
    EphemeralAccount, LegacyKdf, MasterKey, PasswordKdf, SaltedKdf,
};
pub use keys::{
    generate_folder_key, unwrap_node_key, wrap_node_key, AesKey, FileKey, NodeKey, WrappedKey,
    FILE_KEY_SIZE, KEY_SIZE, META_MAC_SIZE, NONCE_SIZE,
};
pub use link::FileLink;
pub use manager::{NewNode, NodeKeyManager};
