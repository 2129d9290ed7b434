//! Advisory locks for (document, stage) mutual exclusion.
//!
//! The lock identifier is derived deterministically by hashing
//! `"{document_id}:{stage_name}"` into the signed 64-bit range, matching
//! what a relational session-scoped advisory primitive accepts. Guards
//! release on drop, so every exit path releases.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Backend holding the actual lock table.
///
/// The in-process backend covers the single-coordinator deployment; a
/// relational backend implements the same trait over the store's native
/// session-scoped try-lock, which releases automatically on connection
/// loss.
pub trait LockBackend: Send + Sync {
    /// Attempts to take the lock; false means someone else holds it.
    fn try_acquire(&self, key: i64) -> bool;

    /// Releases the lock.
    fn release(&self, key: i64);
}

/// Process-local lock table.
#[derive(Debug, Default)]
pub struct InProcessLockBackend {
    held: DashMap<i64, ()>,
}

impl InProcessLockBackend {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of locks currently held.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

impl LockBackend for InProcessLockBackend {
    fn try_acquire(&self, key: i64) -> bool {
        match self.held.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                true
            }
        }
    }

    fn release(&self, key: i64) {
        self.held.remove(&key);
    }
}

/// Derives the lock identifier for a (document, stage) pair.
#[must_use]
pub fn derive_lock_key(document_id: &str, stage_name: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b":");
    hasher.update(stage_name.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Non-blocking mutual exclusion keyed by (document, stage).
pub struct AdvisoryLockManager {
    backend: Arc<dyn LockBackend>,
}

impl Default for AdvisoryLockManager {
    fn default() -> Self {
        Self::in_process()
    }
}

impl AdvisoryLockManager {
    /// Creates a manager over an arbitrary backend.
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Creates a manager with the process-local table.
    #[must_use]
    pub fn in_process() -> Self {
        Self::new(Arc::new(InProcessLockBackend::new()))
    }

    /// Attempts to acquire the lock for a (document, stage) pair.
    ///
    /// `None` means another execution is in flight for the same pair; the
    /// caller reports "retry already in progress" rather than an error.
    #[must_use]
    pub fn try_acquire(&self, document_id: &str, stage_name: &str) -> Option<LockGuard> {
        let key = derive_lock_key(document_id, stage_name);
        if self.backend.try_acquire(key) {
            Some(LockGuard {
                backend: self.backend.clone(),
                key,
            })
        } else {
            None
        }
    }

    /// Returns true if the pair is currently locked.
    #[must_use]
    pub fn is_locked(&self, document_id: &str, stage_name: &str) -> bool {
        let key = derive_lock_key(document_id, stage_name);
        if self.backend.try_acquire(key) {
            self.backend.release(key);
            false
        } else {
            true
        }
    }
}

/// Holds an advisory lock; releases it on drop.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    key: i64,
}

impl LockGuard {
    /// The derived lock identifier this guard holds.
    #[must_use]
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.backend.release(self.key);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}
