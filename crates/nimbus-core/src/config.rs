use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level client configuration (loaded from nimbus.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    pub crypto: CryptoConfig,
    pub transfer: TransferConfig,
}

impl NimbusConfig {
    /// Load a config file. Missing sections fall back to their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file: {}", path.display()))?;
        let config: NimbusConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded nimbus config");
        Ok(config)
    }
}

/// Password-derivation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2 iterations used when the server does not advertise a count
    /// (default: 100000)
    pub pbkdf2_iterations: u32,
    /// AES rounds for legacy (v1) accounts (default: 65536)
    pub legacy_rounds: u32,
    /// AES rounds for the legacy login hash (default: 16384)
    pub legacy_hash_rounds: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 100_000,
            legacy_rounds: 0x10000,
            legacy_hash_rounds: 0x4000,
        }
    }
}

/// Content transfer behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Buffered downloads at or above this size are verified on the rayon
    /// pool instead of sequentially (default: 8 MiB)
    pub parallel_threshold_bytes: u64,
    /// Read buffer size used by streaming adapters (default: 64 KiB)
    pub read_buffer_bytes: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallel_threshold_bytes: 8 * 1024 * 1024,
            read_buffer_bytes: 64 * 1024,
        }
    }
}
