use thiserror::Error;

pub type NimbusResult<T> = Result<T, NimbusError>;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Terminal failures of the crypto core.
///
/// None of these are retried internally. `Clone` so a single-flight key
/// derivation can hand the same failure to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Bad password, missing salt, or unusable KDF parameters.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// A wrapped key had an impossible length or shape for its node.
    #[error("key unwrap failed: {0}")]
    KeyUnwrapFailed(String),

    /// Decrypted attributes did not carry the expected marker or fields.
    #[error("corrupt attributes: {0}")]
    CorruptAttributes(String),

    /// The condensed MAC of transferred content did not match.
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    /// No key entry on the node could be unwrapped with the keys we hold.
    #[error("no usable key: {0}")]
    MissingKey(String),

    /// Malformed base64, key strings or links.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
}

#[derive(Debug, Error)]
pub enum NimbusError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("node tree inconsistent: {0}")]
    TreeInconsistent(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
