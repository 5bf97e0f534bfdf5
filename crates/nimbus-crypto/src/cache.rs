//! Per-node single-flight memoization of unwrapped keys
//!
//! Each handle moves through `Unresolved → Resolving → Resolved | Failed`.
//! The first caller for a handle runs the derivation; callers arriving while
//! it runs block on the condvar and receive the same `Arc` (or the same
//! error). A derivation that panics puts the slot back to `Unresolved` so a
//! later caller can retry. Failures stay memoized until `invalidate`.
//!
//! Invalidating a handle while it resolves marks the in-flight derivation
//! stale: its caller still gets the result, but nothing is memoized and the
//! next caller derives again.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use nimbus_core::{CryptoResult, NodeHandle};

use crate::keys::NodeKey;

#[derive(Debug, Clone)]
enum Slot {
    Resolving { stale: bool },
    Resolved(Arc<NodeKey>),
    Failed(nimbus_core::CryptoError),
}

/// Observable state of one handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unresolved,
    Resolving,
    Resolved,
    Failed,
}

#[derive(Debug, Default)]
pub struct KeyCache {
    slots: Mutex<HashMap<NodeHandle, Slot>>,
    ready: Condvar,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized key for `handle`, running `resolve` at most once
    /// across all concurrent callers.
    ///
    /// `resolve` runs without the cache lock held, so it may itself call
    /// back into the cache for other handles (ancestor resolution).
    pub fn get_or_resolve<F>(&self, handle: &NodeHandle, resolve: F) -> CryptoResult<Arc<NodeKey>>
    where
        F: FnOnce() -> CryptoResult<NodeKey>,
    {
        let mut slots = self.lock();
        loop {
            match slots.get(handle) {
                Some(Slot::Resolved(key)) => return Ok(Arc::clone(key)),
                Some(Slot::Failed(err)) => return Err(err.clone()),
                Some(Slot::Resolving { .. }) => {
                    slots = self
                        .ready
                        .wait(slots)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => break,
            }
        }
        slots.insert(handle.clone(), Slot::Resolving { stale: false });
        drop(slots);

        let guard = ResolvingGuard {
            cache: self,
            handle,
            armed: true,
        };
        let outcome = resolve().map(Arc::new);
        guard.commit(&outcome);
        outcome
    }

    /// The memoized key, if resolution already succeeded.
    pub fn peek(&self, handle: &NodeHandle) -> Option<Arc<NodeKey>> {
        match self.lock().get(handle) {
            Some(Slot::Resolved(key)) => Some(Arc::clone(key)),
            _ => None,
        }
    }

    pub fn state(&self, handle: &NodeHandle) -> SlotState {
        match self.lock().get(handle) {
            None => SlotState::Unresolved,
            Some(Slot::Resolving { .. }) => SlotState::Resolving,
            Some(Slot::Resolved(_)) => SlotState::Resolved,
            Some(Slot::Failed(_)) => SlotState::Failed,
        }
    }

    /// Drop a memoized key or failure, or mark an in-flight resolution stale
    /// so its result is not memoized. Returns `false` if nothing was known.
    pub fn invalidate(&self, handle: &NodeHandle) -> bool {
        let mut slots = self.lock();
        match slots.get_mut(handle) {
            None => false,
            Some(Slot::Resolving { stale }) => {
                *stale = true;
                tracing::debug!(handle = %handle, "invalidated in-flight node key");
                true
            }
            Some(_) => {
                slots.remove(handle);
                tracing::debug!(handle = %handle, "invalidated cached node key");
                true
            }
        }
    }

    /// Drop every settled entry and mark in-flight ones stale.
    pub fn clear(&self) {
        self.lock().retain(|_, slot| match slot {
            Slot::Resolving { stale } => {
                *stale = true;
                true
            }
            _ => false,
        });
    }

    /// Drop memoized failures only, so they are retried on next access.
    pub fn clear_failed(&self) {
        self.lock()
            .retain(|_, slot| !matches!(slot, Slot::Failed(_)));
    }

    /// Number of settled entries (resolved or failed)
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| !matches!(slot, Slot::Resolving { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeHandle, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the `Resolving` slot while the derivation runs. Dropped without
/// `commit` (the derivation panicked) it resets the slot to `Unresolved`.
/// A slot invalidated meanwhile is reset the same way on commit.
struct ResolvingGuard<'a> {
    cache: &'a KeyCache,
    handle: &'a NodeHandle,
    armed: bool,
}

impl ResolvingGuard<'_> {
    fn commit(mut self, outcome: &CryptoResult<Arc<NodeKey>>) {
        let slot = match outcome {
            Ok(key) => Slot::Resolved(Arc::clone(key)),
            Err(err) => {
                tracing::warn!(handle = %self.handle, error = %err, "node key resolution failed");
                Slot::Failed(err.clone())
            }
        };
        let mut slots = self.cache.lock();
        if matches!(slots.get(self.handle), Some(Slot::Resolving { stale: true })) {
            tracing::debug!(handle = %self.handle, "discarding stale node key resolution");
            slots.remove(self.handle);
        } else {
            slots.insert(self.handle.clone(), slot);
        }
        drop(slots);
        self.armed = false;
        self.cache.ready.notify_all();
    }
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.lock().remove(self.handle);
            self.cache.ready.notify_all();
        }
    }
}
