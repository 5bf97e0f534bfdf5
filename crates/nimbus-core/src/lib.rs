//! nimbus-core: node model, tree arena, config schema and error types shared
//! by the crypto and transfer crates.

pub mod config;
pub mod error;
pub mod tree;
pub mod types;

pub use config::{CryptoConfig, NimbusConfig, TransferConfig};
pub use error::{CryptoError, CryptoResult, NimbusError, NimbusResult};
pub use tree::{NodeTree, TreeReport};
pub use types::{parse_key_entries, KeyEntry, Node, NodeHandle, NodeKind};
