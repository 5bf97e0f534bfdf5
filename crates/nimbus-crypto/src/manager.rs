//! Node key resolution over a listing
//!
//! A node's `k` string lists one or more `owner:wrapped` entries. The owner
//! decides which key unwraps the entry:
//!
//! - the account's own user handle: the master key
//! - a share handle with a known share key: that share key
//! - an ancestor folder: that folder's node key, itself resolved the same way
//!
//! Resolved keys are memoized per node in a [`KeyCache`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use nimbus_core::{CryptoError, CryptoResult, KeyEntry, Node, NodeHandle, NodeKind, NodeTree};

use crate::attrs::{self, Attributes};
use crate::cache::KeyCache;
use crate::codec;
use crate::kdf::MasterKey;
use crate::keys::{
    generate_folder_key, unwrap_node_key, wrap_node_key, AesKey, FileKey, NodeKey, WrappedKey,
    KEY_SIZE,
};

/// Key material for a node about to be created
#[derive(Debug, Clone)]
pub struct NewNode {
    pub key: NodeKey,
    /// The key wrapped under the master key, owned by the account user
    pub key_entry: KeyEntry,
    /// Encrypted attributes, base64url
    pub attributes: String,
}

pub struct NodeKeyManager {
    user: NodeHandle,
    master: MasterKey,
    share_keys: RwLock<HashMap<NodeHandle, AesKey>>,
    cache: KeyCache,
}

impl NodeKeyManager {
    pub fn new(user: NodeHandle, master: MasterKey) -> Self {
        Self {
            user,
            master,
            share_keys: RwLock::new(HashMap::new()),
            cache: KeyCache::new(),
        }
    }

    pub fn user(&self) -> &NodeHandle {
        &self.user
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Register a share key supplied out of band. Earlier failures are
    /// forgotten, since they may now resolve.
    pub fn add_share_key(&self, share: NodeHandle, key: AesKey) {
        tracing::debug!(share = %share, "added share key");
        self.share_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(share, key);
        self.cache.clear_failed();
    }

    /// Register a share key as listed for the account: 16 bytes wrapped
    /// under the master key, base64url.
    pub fn import_share_key(&self, share: NodeHandle, encoded: &str) -> CryptoResult<()> {
        let wrapped = WrappedKey::from_b64(encoded)?;
        if wrapped.len() != KEY_SIZE {
            return Err(CryptoError::KeyUnwrapFailed(format!(
                "share key for {share} is {} bytes",
                wrapped.len()
            )));
        }
        let raw = codec::unwrap_key(self.master.as_key(), wrapped.as_bytes())?;
        self.add_share_key(share, AesKey::from_slice(&raw)?);
        Ok(())
    }

    /// The unwrapped key of `handle`, derived at most once.
    pub fn node_key(&self, tree: &NodeTree, handle: &NodeHandle) -> CryptoResult<Arc<NodeKey>> {
        if let Some(key) = self.cache.peek(handle) {
            return Ok(key);
        }
        let node = tree
            .get(handle)
            .ok_or_else(|| CryptoError::MissingKey(format!("node {handle} is not in the listing")))?;
        self.cache
            .get_or_resolve(handle, || self.resolve(tree, node))
    }

    /// The 256-bit key of a file node.
    pub fn file_key(&self, tree: &NodeTree, handle: &NodeHandle) -> CryptoResult<FileKey> {
        let key = self.node_key(tree, handle)?;
        key.as_file().cloned().ok_or_else(|| {
            CryptoError::KeyUnwrapFailed(format!("node {handle} does not carry a file key"))
        })
    }

    /// Decrypt a node's attributes with its own key.
    pub fn attributes(&self, tree: &NodeTree, handle: &NodeHandle) -> CryptoResult<Attributes> {
        let node = tree
            .get(handle)
            .ok_or_else(|| CryptoError::MissingKey(format!("node {handle} is not in the listing")))?;
        let encoded = node.attributes.as_deref().ok_or_else(|| {
            CryptoError::CorruptAttributes(format!("node {handle} has no attributes"))
        })?;
        let key = self.node_key(tree, handle)?;
        attrs::decrypt_b64(&key.attribute_key(), encoded)
    }

    /// Forget the memoized key of a node (recreated, or its key rotated).
    pub fn invalidate(&self, handle: &NodeHandle) -> bool {
        self.cache.invalidate(handle)
    }

    /// Wrap a node key under the master key as a key entry owned by the
    /// account user.
    pub fn wrap_with_master(&self, key: &NodeKey) -> CryptoResult<KeyEntry> {
        let wrapped = wrap_node_key(key, self.master.as_key())?;
        Ok(KeyEntry {
            owner: self.user.clone(),
            encoded: wrapped.to_b64(),
        })
    }

    /// Fresh key and encrypted attributes for a new folder.
    pub fn new_folder(&self, name: &str) -> CryptoResult<NewNode> {
        self.new_node(generate_folder_key(), name)
    }

    /// Key entry and encrypted attributes for a freshly uploaded file.
    pub fn new_file(&self, file_key: FileKey, name: &str) -> CryptoResult<NewNode> {
        self.new_node(NodeKey::File(file_key), name)
    }

    fn new_node(&self, key: NodeKey, name: &str) -> CryptoResult<NewNode> {
        let attributes = attrs::encrypt_b64(&key.attribute_key(), &Attributes::new(name))?;
        let key_entry = self.wrap_with_master(&key)?;
        Ok(NewNode {
            key,
            key_entry,
            attributes,
        })
    }

    fn resolve(&self, tree: &NodeTree, node: &Node) -> CryptoResult<NodeKey> {
        if !node.kind.has_key() {
            return Err(CryptoError::MissingKey(format!(
                "{:?} node {} carries no key",
                node.kind, node.handle
            )));
        }

        let entries = node.key_entries()?;
        let mut last_error = None;
        for entry in &entries {
            // An unresolvable owner only rules out this entry
            let unwrapping_key = match self.unwrapping_key(tree, node, &entry.owner) {
                Ok(Some(key)) => key,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!(
                        handle = %node.handle,
                        owner = %entry.owner,
                        error = %err,
                        "key entry owner unresolvable"
                    );
                    last_error = Some(err);
                    continue;
                }
            };
            let result = WrappedKey::from_b64(&entry.encoded)
                .and_then(|wrapped| unwrap_node_key(&wrapped, &unwrapping_key, node.kind));
            match result {
                Ok(key) => {
                    tracing::debug!(handle = %node.handle, owner = %entry.owner, "unwrapped node key");
                    return Ok(key);
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CryptoError::MissingKey(format!(
                "none of {} key entries on {} has a known owner",
                entries.len(),
                node.handle
            ))
        }))
    }

    /// The key that unwraps an entry owned by `owner`, or `None` if we do not
    /// hold one.
    fn unwrapping_key(
        &self,
        tree: &NodeTree,
        node: &Node,
        owner: &NodeHandle,
    ) -> CryptoResult<Option<AesKey>> {
        if *owner == self.user {
            return Ok(Some(self.master.as_key().clone()));
        }
        if let Some(key) = self
            .share_keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
        {
            return Ok(Some(key.clone()));
        }

        // Ancestor folders only; a parent cycle would make resolution wait on itself
        let usable_ancestor = tree.get(owner).is_some_and(|n| n.kind == NodeKind::Folder)
            && !tree.is_cyclic(owner)
            && !tree.is_cyclic(&node.handle)
            && tree.is_ancestor(owner, &node.handle);
        if !usable_ancestor {
            return Ok(None);
        }
        let ancestor = self.node_key(tree, owner)?;
        Ok(ancestor.wrapping_key())
    }
}

impl std::fmt::Debug for NodeKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeyManager")
            .field("user", &self.user)
            .field("master", &"[REDACTED]")
            .field("cached", &self.cache.len())
            .finish()
    }
}
