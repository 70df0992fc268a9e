//! Capsule state store with per-id single-flight leases
//!
//! State may only change while holding the capsule's [`CapsuleLease`], so at
//! most one attempt per capsule id is ever active.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use reflex_types::{CapsuleId, CapsuleResult, CapsuleState, ReflexError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: CapsuleId,
        from: CapsuleState,
        to: CapsuleState,
    },

    #[error("Capsule not tracked: {0}")]
    UnknownCapsule(CapsuleId),
}

impl From<StoreError> for ReflexError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidTransition { from, to, .. } => ReflexError::InvalidTransition { from, to },
            StoreError::UnknownCapsule(id) => ReflexError::EngineExecution(format!("capsule not tracked: {}", id)),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub from: CapsuleState,
    pub to: CapsuleState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapsuleRecord {
    pub state: CapsuleState,
    /// Attempts started so far
    pub attempts: u32,
    pub history: Vec<StateChange>,
    pub last_result: Option<CapsuleResult>,
    pub updated_at: DateTime<Utc>,
}

impl CapsuleRecord {
    fn new() -> Self {
        Self {
            state: CapsuleState::Created,
            attempts: 0,
            history: Vec::new(),
            last_result: None,
            updated_at: Utc::now(),
        }
    }

    fn apply(&mut self, id: &CapsuleId, to: CapsuleState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: self.state,
                to,
            });
        }
        let at = Utc::now();
        self.history.push(StateChange {
            from: self.state,
            to,
            at,
        });
        self.state = to;
        self.updated_at = at;
        Ok(())
    }
}

/// Exclusive right to drive one capsule; released on drop or by [`release`](Self::release)
pub struct CapsuleLease {
    capsule_id: CapsuleId,
    /// Engine calls that outlived their timeout
    overruns: parking_lot::Mutex<Vec<JoinHandle<CapsuleResult>>>,
    _guard: OwnedMutexGuard<()>,
}

impl CapsuleLease {
    fn new(capsule_id: CapsuleId, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            capsule_id,
            overruns: parking_lot::Mutex::new(Vec::new()),
            _guard: guard,
        }
    }

    pub fn capsule_id(&self) -> &CapsuleId {
        &self.capsule_id
    }

    /// Keep the capsule busy until `call` returns, even after the attempt ended
    pub fn hold_for(&self, call: JoinHandle<CapsuleResult>) {
        self.overruns.lock().push(call);
    }

    pub fn has_overruns(&self) -> bool {
        !self.overruns.lock().is_empty()
    }

    /// Release now, or once every overrunning engine call has returned
    pub fn release(self) {
        let overruns = std::mem::take(&mut *self.overruns.lock());
        if overruns.is_empty() {
            return;
        }
        let id = self.capsule_id.clone();
        debug!(capsule_id = %id, calls = overruns.len(), "lease held for overrunning engine calls");
        tokio::spawn(async move {
            for call in overruns {
                if let Err(err) = call.await {
                    warn!(capsule_id = %id, error = %err, "overrunning engine call aborted");
                }
            }
            debug!(capsule_id = %id, "overrunning engine calls finished, releasing lease");
            drop(self);
        });
    }
}

impl std::fmt::Debug for CapsuleLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleLease").field("capsule_id", &self.capsule_id).finish()
    }
}

#[derive(Default)]
pub struct CapsuleStore {
    records: DashMap<CapsuleId, CapsuleRecord>,
    locks: DashMap<CapsuleId, Arc<Mutex<()>>>,
}

impl CapsuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: &CapsuleId) -> Arc<Mutex<()>> {
        self.locks.entry(id.clone()).or_default().clone()
    }

    /// Wait for the capsule's lease
    pub async fn acquire(&self, id: &CapsuleId) -> CapsuleLease {
        let guard = self.lock_for(id).lock_owned().await;
        CapsuleLease::new(id.clone(), guard)
    }

    /// Lease if nobody else holds it
    pub fn try_acquire(&self, id: &CapsuleId) -> Option<CapsuleLease> {
        let guard = self.lock_for(id).try_lock_owned().ok()?;
        Some(CapsuleLease::new(id.clone(), guard))
    }

    /// Move the capsule to RUNNING for a new attempt; returns the attempt number.
    ///
    /// A non-terminal state left behind by an aborted attempt is closed as
    /// FAILED first.
    pub fn begin_attempt(&self, lease: &CapsuleLease) -> Result<u32> {
        let id = lease.capsule_id();
        let mut record = self.records.entry(id.clone()).or_insert_with(CapsuleRecord::new);

        match record.state {
            CapsuleState::Created | CapsuleState::Completed | CapsuleState::Failed => {}
            stale => {
                warn!(capsule_id = %id, state = %stale, "previous attempt aborted, closing it");
                record.apply(id, CapsuleState::Failed)?;
            }
        }
        record.apply(id, CapsuleState::Running)?;
        record.attempts += 1;
        record.last_result = None;
        debug!(capsule_id = %id, attempt = record.attempts, "attempt started");
        Ok(record.attempts)
    }

    pub fn transition(&self, lease: &CapsuleLease, to: CapsuleState) -> Result<()> {
        let id = lease.capsule_id();
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownCapsule(id.clone()))?;
        let from = record.state;
        record.apply(id, to)?;
        debug!(capsule_id = %id, %from, %to, "capsule transition");
        Ok(())
    }

    pub fn record_result(&self, lease: &CapsuleLease, result: &CapsuleResult) -> Result<()> {
        let id = lease.capsule_id();
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownCapsule(id.clone()))?;
        record.last_result = Some(result.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    pub fn state(&self, id: &CapsuleId) -> Option<CapsuleState> {
        self.records.get(id).map(|r| r.state)
    }

    pub fn record(&self, id: &CapsuleId) -> Option<CapsuleRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop terminal records whose lease nobody holds or waits for
    pub fn prune_terminal(&self) -> usize {
        let candidates: Vec<CapsuleId> = self
            .records
            .iter()
            .filter(|r| r.state.is_terminal())
            .map(|r| r.key().clone())
            .collect();

        let mut pruned = 0;
        for id in candidates {
            let idle = self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1).is_some()
                || !self.locks.contains_key(&id);
            if idle && self.records.remove_if(&id, |_, r| r.state.is_terminal()).is_some() {
                pruned += 1;
            }
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attempt_lifecycle() {
        let store = CapsuleStore::new();
        let id = CapsuleId::from("cap-1");
        let lease = store.acquire(&id).await;

        assert_eq!(store.begin_attempt(&lease).unwrap(), 1);
        store.transition(&lease, CapsuleState::Blocked).unwrap();
        store.transition(&lease, CapsuleState::Escalated).unwrap();
        store.transition(&lease, CapsuleState::Running).unwrap();
        store.transition(&lease, CapsuleState::Completed).unwrap();

        let record = store.record(&id).unwrap();
        assert_eq!(record.state, CapsuleState::Completed);
        assert_eq!(record.history.len(), 5);

        // a completed capsule may be run again
        assert_eq!(store.begin_attempt(&lease).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let store = CapsuleStore::new();
        let id = CapsuleId::from("cap-2");
        let lease = store.acquire(&id).await;
        store.begin_attempt(&lease).unwrap();

        let err = store.transition(&lease, CapsuleState::Assisted).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.state(&id), Some(CapsuleState::Running));
    }

    #[tokio::test]
    async fn test_stale_attempt_is_closed() {
        let store = CapsuleStore::new();
        let id = CapsuleId::from("cap-3");
        {
            let lease = store.acquire(&id).await;
            store.begin_attempt(&lease).unwrap();
            store.transition(&lease, CapsuleState::Blocked).unwrap();
        }
        let lease = store.acquire(&id).await;
        store.begin_attempt(&lease).unwrap();
        let history = store.record(&id).unwrap().history;
        let tail: Vec<_> = history.iter().rev().take(2).map(|c| c.to).collect();
        assert_eq!(tail, vec![CapsuleState::Running, CapsuleState::Failed]);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let store = CapsuleStore::new();
        let id = CapsuleId::from("cap-4");
        let lease = store.acquire(&id).await;
        assert!(store.try_acquire(&id).is_none());
        assert!(store.try_acquire(&CapsuleId::from("other")).is_some());
        drop(lease);
        assert!(store.try_acquire(&id).is_some());
    }

    #[tokio::test]
    async fn test_release_waits_for_overrunning_calls() {
        let store = CapsuleStore::new();
        let id = CapsuleId::from("cap-6");
        let lease = store.acquire(&id).await;

        let (finish, finished) = tokio::sync::oneshot::channel::<()>();
        let call_id = id.clone();
        lease.hold_for(tokio::spawn(async move {
            let _ = finished.await;
            CapsuleResult::success(call_id, Default::default())
        }));
        assert!(lease.has_overruns());
        lease.release();

        tokio::task::yield_now().await;
        assert!(store.try_acquire(&id).is_none());

        finish.send(()).unwrap();
        let relock = tokio::time::timeout(std::time::Duration::from_secs(1), store.acquire(&id)).await;
        assert!(relock.is_ok());
    }

    #[tokio::test]
    async fn test_release_without_overruns_is_immediate() {
        let store = CapsuleStore::new();
        let id = CapsuleId::from("cap-7");
        store.acquire(&id).await.release();
        assert!(store.try_acquire(&id).is_some());
    }

    #[tokio::test]
    async fn test_prune_skips_held_leases() {
        let store = CapsuleStore::new();
        let id = CapsuleId::from("cap-5");
        let lease = store.acquire(&id).await;
        store.begin_attempt(&lease).unwrap();
        store.transition(&lease, CapsuleState::Completed).unwrap();

        assert_eq!(store.prune_terminal(), 0);
        drop(lease);
        assert_eq!(store.prune_terminal(), 1);
        assert!(store.is_empty());
    }
}
