//! Process-wide credential pool manager.
//!
//! Wraps the pure [`CredentialPool`] ring with a single-writer lock, persists
//! every mutation before it becomes visible, and appends each mutation to the
//! rotation ledger.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::pool::{
    ActiveCredential, CredentialPool, CredentialRecord, PoolError, RotationEvent, Slot,
};
use crate::io::layout::QuillPaths;
use crate::io::ledger::{append_records, read_recent};
use crate::io::pool_store::PoolStore;

/// Masked, consistent view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub credentials: Vec<CredentialRecord>,
    pub current_index: usize,
    /// Masked id of the usable credential, if any.
    pub current: Option<String>,
}

impl PoolSnapshot {
    pub fn usable(&self) -> usize {
        self.credentials.iter().filter(|c| !c.exhausted).count()
    }
}

#[derive(Debug)]
pub struct PoolManager {
    store: PoolStore,
    rotations_path: PathBuf,
    pool: Mutex<CredentialPool>,
}

impl PoolManager {
    /// Load the pool stored under `.quill/state/`.
    pub fn open(paths: &QuillPaths) -> Result<Self> {
        let store = PoolStore::new(&paths.pool_path, &paths.credentials_path);
        let pool = store.load()?;
        Ok(Self {
            store,
            rotations_path: paths.rotations_path.clone(),
            pool: Mutex::new(pool),
        })
    }

    pub fn size(&self) -> usize {
        self.pool.lock().size()
    }

    /// The credential new sessions should use.
    pub fn current(&self) -> Result<ActiveCredential, PoolError> {
        self.pool.lock().current()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let pool = self.pool.lock().clone();
        let record = pool.record();
        PoolSnapshot {
            current: pool.current().ok().map(|c| c.masked_id()),
            credentials: record.credentials,
            current_index: record.current_index,
        }
    }

    pub fn add(&self, secret: &str, slot: Option<Slot>) -> Result<RotationEvent> {
        let event = self.mutate(|pool| Some(pool.add(secret, slot, Utc::now())))?;
        event.ok_or_else(|| anyhow::anyhow!("pool add produced no event"))
    }

    /// Flag `credential` as exhausted. `None` when it already was (no rotation).
    pub fn mark_exhausted(
        &self,
        credential: &ActiveCredential,
        reason: &str,
    ) -> Result<Option<RotationEvent>> {
        self.mutate(|pool| pool.mark_exhausted(credential, reason, Utc::now()))
    }

    pub fn reset_exhausted(&self) -> Result<RotationEvent> {
        let event = self.mutate(|pool| Some(pool.reset_exhausted(Utc::now())))?;
        event.ok_or_else(|| anyhow::anyhow!("pool reset produced no event"))
    }

    pub fn rotate_manually(&self) -> Result<RotationEvent> {
        let event = self.mutate(|pool| Some(pool.rotate_manually(Utc::now())))?;
        event.ok_or_else(|| anyhow::anyhow!("pool rotation produced no event"))
    }

    /// The most recent rotation events, oldest first.
    pub fn recent_rotations(&self, limit: usize) -> Result<Vec<RotationEvent>> {
        read_recent(&self.rotations_path, limit)
    }

    /// Apply `change` to a copy of the pool, persist it, then publish it.
    ///
    /// The lock is held across persistence so mutations are totally ordered.
    /// A failed write leaves the in-memory pool untouched.
    fn mutate<F>(&self, change: F) -> Result<Option<RotationEvent>>
    where
        F: FnOnce(&mut CredentialPool) -> Option<RotationEvent>,
    {
        let mut guard = self.pool.lock();
        let mut next = guard.clone();
        let Some(event) = change(&mut next) else {
            debug!("pool mutation was a no-op");
            return Ok(None);
        };
        self.store.save(&next)?;
        *guard = next;
        append_records(&self.rotations_path, std::slice::from_ref(&event))?;
        info!(
            from = event.from.as_deref().unwrap_or("-"),
            to = event.to.as_deref().unwrap_or("-"),
            reason = %event.reason,
            "credential pool changed"
        );
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const KEY_A: &str = "key-aaaa-0000-1111";
    const KEY_B: &str = "key-bbbb-2222-3333";

    fn manager(root: &std::path::Path) -> PoolManager {
        PoolManager::open(&QuillPaths::new(root)).expect("open")
    }

    #[test]
    fn mutations_persist_across_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = manager(temp.path());
        pool.add(KEY_A, Some(Slot::Primary)).expect("add a");
        pool.add(KEY_B, Some(Slot::Secondary)).expect("add b");
        let a = pool.current().expect("current");
        pool.mark_exhausted(&a, "quota").expect("mark");

        let reopened = manager(temp.path());
        assert_eq!(reopened.current().expect("current").secret, KEY_B);
        assert_eq!(reopened.snapshot(), pool.snapshot());
    }

    #[test]
    fn double_exhaustion_logs_one_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = manager(temp.path());
        pool.add(KEY_A, None).expect("add");
        let a = pool.current().expect("current");
        assert!(pool.mark_exhausted(&a, "quota").expect("first").is_some());
        assert!(pool.mark_exhausted(&a, "quota").expect("second").is_none());

        let events = pool.recent_rotations(10).expect("rotations");
        assert_eq!(events.len(), 2, "add + one exhaustion");
        assert!(events[1].reason.starts_with("exhausted"));
        assert_eq!(pool.current(), Err(PoolError::AllExhausted(1)));
    }

    #[test]
    fn concurrent_exhaustion_rotates_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = Arc::new(manager(temp.path()));
        pool.add(KEY_A, Some(Slot::Primary)).expect("add a");
        pool.add(KEY_B, Some(Slot::Secondary)).expect("add b");
        let a = pool.current().expect("current");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let a = a.clone();
                thread::spawn(move || pool.mark_exhausted(&a, "quota").expect("mark"))
            })
            .collect();
        let rotated = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(Option::is_some)
            .count();
        assert_eq!(rotated, 1);
        assert_eq!(pool.current().expect("current").secret, KEY_B);
    }

    #[test]
    fn snapshot_is_masked() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pool = manager(temp.path());
        pool.add(KEY_A, None).expect("add");
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.current.as_deref(), Some("key-…1111"));
        assert_eq!(snapshot.usable(), 1);
        let json = serde_json::to_string(&snapshot).expect("json");
        assert!(!json.contains(KEY_A));
    }
}
