use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::{CryptoError, CryptoResult};

/// Stable opaque identifier of a node (or of a user, for key owners)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(String);

impl NodeHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Node type tag as carried in the listing's `t` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeKind {
    File,
    Folder,
    Root,
    Inbox,
    Trash,
}

impl NodeKind {
    /// File and folder nodes carry keys and attributes; the three
    /// well-known top-level containers do not.
    pub fn has_key(self) -> bool {
        matches!(self, NodeKind::File | NodeKind::Folder)
    }
}

impl TryFrom<u8> for NodeKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeKind::File),
            1 => Ok(NodeKind::Folder),
            2 => Ok(NodeKind::Root),
            3 => Ok(NodeKind::Inbox),
            4 => Ok(NodeKind::Trash),
            other => Err(format!("unknown node type {other}")),
        }
    }
}

impl From<NodeKind> for u8 {
    fn from(kind: NodeKind) -> u8 {
        match kind {
            NodeKind::File => 0,
            NodeKind::Folder => 1,
            NodeKind::Root => 2,
            NodeKind::Inbox => 3,
            NodeKind::Trash => 4,
        }
    }
}

/// One `owner:key` pair of a node's key string.
///
/// `owner` names whose key wraps `encoded`: the account's user handle
/// (master key), a share handle, or an ancestor folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub owner: NodeHandle,
    /// base64url wrapped key, still undecoded
    pub encoded: String,
}

impl KeyEntry {
    /// The `owner:key` wire form.
    pub fn to_wire(&self) -> String {
        format!("{}:{}", self.owner, self.encoded)
    }
}

/// A filesystem entity as delivered by the listing call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "h")]
    pub handle: NodeHandle,
    /// Weak reference to the parent; lookup only
    #[serde(rename = "p", default, deserialize_with = "empty_as_none")]
    pub parent: Option<NodeHandle>,
    #[serde(rename = "u", default, deserialize_with = "empty_as_none")]
    pub owner: Option<NodeHandle>,
    #[serde(rename = "t")]
    pub kind: NodeKind,
    /// Raw key string: `owner:key[/owner:key...]`
    #[serde(rename = "k", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// base64url encrypted attributes
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<String>,
    /// Content size in bytes (files only)
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Node {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Split the raw key string into its `owner:key` entries.
    pub fn key_entries(&self) -> CryptoResult<Vec<KeyEntry>> {
        let Some(raw) = self.key.as_deref() else {
            return Ok(Vec::new());
        };
        parse_key_entries(raw)
    }
}

/// Parse `owner:key/owner:key` into entries, rejecting empty parts.
pub fn parse_key_entries(raw: &str) -> CryptoResult<Vec<KeyEntry>> {
    raw.split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (owner, encoded) = part.split_once(':').ok_or_else(|| {
                CryptoError::InvalidEncoding(format!("key entry without owner: {part:?}"))
            })?;
            if owner.is_empty() || encoded.is_empty() {
                return Err(CryptoError::InvalidEncoding(format!(
                    "empty owner or key in entry {part:?}"
                )));
            }
            Ok(KeyEntry {
                owner: NodeHandle::new(owner),
                encoded: encoded.to_string(),
            })
        })
        .collect()
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<NodeHandle>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(NodeHandle::new))
}
