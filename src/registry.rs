//! Upload session registry.
//!
//! Sessions live in a sharded map so unrelated uploads never contend. Each
//! session also owns a patch lock; a second patch arriving while one is in
//! flight is refused instead of queued.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::UploadError;
use crate::models::{SessionState, UploadId, UploadSession};

/// held for the duration of one patch
pub struct PatchGuard {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<UploadId, UploadSession>,
    patch_locks: DashMap<UploadId, Arc<Mutex<()>>>,
}

/// point-in-time counters for the stats endpoint
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub active: usize,
    pub finalized: usize,
    pub bytes_received: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session; returns false if the id is already taken.
    pub fn insert_if_absent(&self, session: UploadSession) -> bool {
        let id = session.id;
        match self.sessions.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                self.patch_locks.insert(id, Arc::new(Mutex::new(())));
                true
            }
        }
    }

    /// Snapshot of a live session. Expired sessions are invisible even if
    /// the sweeper has not reclaimed them yet.
    pub fn get(&self, id: &UploadId, now: DateTime<Utc>) -> Option<UploadSession> {
        self.sessions
            .get(id)
            .filter(|s| !s.is_expired(now))
            .map(|s| s.value().clone())
    }

    /// Claim the single patch slot for `id`.
    pub fn begin_patch(&self, id: &UploadId) -> Result<PatchGuard, UploadError> {
        let lock = self
            .patch_locks
            .get(id)
            .map(|l| Arc::clone(&l))
            .ok_or(UploadError::NotFound)?;
        let guard = lock.try_lock_owned().map_err(|_| UploadError::Conflict)?;
        Ok(PatchGuard { _guard: guard })
    }

    /// Apply `update` only if the session is live and still at
    /// `expected_offset`. Returns the updated snapshot.
    pub fn compare_and_swap<F>(
        &self,
        id: &UploadId,
        expected_offset: u64,
        now: DateTime<Utc>,
        update: F,
    ) -> Result<UploadSession, UploadError>
    where
        F: FnOnce(&mut UploadSession),
    {
        let mut session = self.sessions.get_mut(id).ok_or(UploadError::NotFound)?;
        if session.is_expired(now) {
            return Err(UploadError::NotFound);
        }
        if session.offset != expected_offset {
            return Err(UploadError::OffsetMismatch {
                expected: expected_offset,
                current: session.offset,
            });
        }
        update(session.value_mut());
        Ok(session.value().clone())
    }

    /// Apply `update` to a live session.
    pub fn update<F>(
        &self,
        id: &UploadId,
        now: DateTime<Utc>,
        update: F,
    ) -> Result<UploadSession, UploadError>
    where
        F: FnOnce(&mut UploadSession),
    {
        let mut session = self.sessions.get_mut(id).ok_or(UploadError::NotFound)?;
        if session.is_expired(now) {
            return Err(UploadError::NotFound);
        }
        update(session.value_mut());
        Ok(session.value().clone())
    }

    pub fn remove(&self, id: &UploadId) -> Option<UploadSession> {
        self.patch_locks.remove(id);
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Ids whose expiry has passed.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<UploadId> {
        self.sessions
            .iter()
            .filter(|s| s.is_expired(now))
            .map(|s| *s.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for session in self.sessions.iter().filter(|s| !s.is_expired(now)) {
            if session.state == SessionState::Finalized {
                stats.finalized += 1;
            } else {
                stats.active += 1;
            }
            stats.bytes_received += session.offset;
        }
        stats
    }
}
