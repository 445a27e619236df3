//! Per-connection state: the table of in-flight operations plus timing
//! metadata.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tether_core::{OperationId, ResponseEnvelope, SessionId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::DispatchError;

/// One tracked, running operation.
#[derive(Debug)]
pub struct TrackedOperation {
    pub target: String,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    generation: u64,
}

impl TrackedOperation {
    pub fn new(target: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            target: target.into(),
            cancel,
            started_at: Utc::now(),
            generation: 0,
        }
    }
}

/// Server-side state of one live connection.
pub struct ConnectionSession {
    id: SessionId,
    opened_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    operations: DashMap<OperationId, TrackedOperation>,
    next_generation: AtomicU64,
    outbound: mpsc::Sender<ResponseEnvelope>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    closing: AtomicBool,
}

impl ConnectionSession {
    /// `outbound` feeds the connection's writer; `shutdown` ends the
    /// connection loop when tripped.
    pub fn create(outbound: mpsc::Sender<ResponseEnvelope>, shutdown: CancellationToken) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: SessionId::new(),
            opened_at: now,
            last_activity: RwLock::new(now),
            operations: DashMap::new(),
            next_generation: AtomicU64::new(1),
            outbound,
            tasks: TaskTracker::new(),
            shutdown,
            closing: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_activity())
            .to_std()
            .unwrap_or_default()
    }

    /// Register a running operation. A uid that is already in flight is
    /// refused and the existing entry is left alone.
    ///
    /// Returns the generation of the new entry, for [`Self::untrack_generation`].
    pub fn track(&self, uid: OperationId, mut op: TrackedOperation) -> Result<u64, DispatchError> {
        match self.operations.entry(uid) {
            Entry::Occupied(e) => Err(DispatchError::DuplicateOperation(e.key().clone())),
            Entry::Vacant(e) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                op.generation = generation;
                e.insert(op);
                Ok(generation)
            }
        }
    }

    /// Remove an entry. Absent uids are a no-op.
    pub fn untrack(&self, uid: &OperationId) -> bool {
        self.operations.remove(uid).is_some()
    }

    /// Remove an entry only if it is still the one registered as `generation`.
    pub fn untrack_generation(&self, uid: &OperationId, generation: u64) -> bool {
        self.operations
            .remove_if(uid, |_, op| op.generation == generation)
            .is_some()
    }

    /// Request cancellation of one operation. False if it isn't tracked.
    pub fn cancel(&self, uid: &OperationId) -> bool {
        match self.operations.get(uid) {
            Some(op) => {
                op.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Request cancellation of everything in flight. Only the first call
    /// does anything; later calls return 0.
    pub fn cancel_all(&self) -> usize {
        if self.closing.swap(true, Ordering::AcqRel) {
            return 0;
        }
        // Snapshot first: runners remove their own entries concurrently.
        let tokens: Vec<CancellationToken> = self
            .operations
            .iter()
            .map(|entry| entry.value().cancel.clone())
            .collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_tracked(&self, uid: &OperationId) -> bool {
        self.operations.contains_key(uid)
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Tracked uids, sorted.
    pub fn operation_ids(&self) -> Vec<OperationId> {
        let mut ids: Vec<OperationId> = self.operations.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn outbound(&self) -> &mpsc::Sender<ResponseEnvelope> {
        &self.outbound
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Wait for every spawned runner to finish. False if `timeout` ran out
    /// first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok()
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: DateTime<Utc>) {
        *self.last_activity.write() = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Arc<ConnectionSession>, mpsc::Receiver<ResponseEnvelope>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionSession::create(tx, CancellationToken::new()), rx)
    }

    fn op() -> (TrackedOperation, CancellationToken) {
        let token = CancellationToken::new();
        (TrackedOperation::new("a/b/c", token.clone()), token)
    }

    #[test]
    fn create_sets_timestamps() {
        let (s, _rx) = session();
        assert!(s.id().as_str().starts_with("sess_"));
        assert_eq!(s.opened_at(), s.last_activity());
        assert_eq!(s.operation_count(), 0);
    }

    #[test]
    fn touch_advances_last_activity() {
        let (s, _rx) = session();
        s.set_last_activity(Utc::now() - chrono::Duration::seconds(30));
        assert!(s.idle_for() >= Duration::from_secs(29));
        s.touch();
        assert!(s.idle_for() < Duration::from_secs(5));
    }

    #[test]
    fn track_and_untrack() {
        let (s, _rx) = session();
        let (o, _) = op();
        s.track("1".into(), o).unwrap();
        assert!(s.is_tracked(&"1".into()));
        assert!(s.untrack(&"1".into()));
        assert!(!s.is_tracked(&"1".into()));
    }

    #[test]
    fn duplicate_uid_is_refused_and_original_kept() {
        let (s, _rx) = session();
        let (first, first_token) = op();
        let (second, _) = op();
        let generation = s.track("1".into(), first).unwrap();
        let err = s.track("1".into(), second).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateOperation(ref id) if id.as_str() == "1"));

        // The original entry is still the one registered.
        assert!(s.cancel(&"1".into()));
        assert!(first_token.is_cancelled());
        assert!(s.untrack_generation(&"1".into(), generation));
    }

    #[test]
    fn untrack_twice_is_harmless_and_leaves_others() {
        let (s, _rx) = session();
        let (a, _) = op();
        let (b, _) = op();
        s.track("a".into(), a).unwrap();
        s.track("b".into(), b).unwrap();

        assert!(s.untrack(&"a".into()));
        assert!(!s.untrack(&"a".into()));
        assert_eq!(s.operation_ids(), vec![OperationId::from("b")]);
    }

    #[test]
    fn stale_generation_does_not_remove_newer_entry() {
        let (s, _rx) = session();
        let (first, _) = op();
        let old = s.track("x".into(), first).unwrap();
        assert!(s.untrack_generation(&"x".into(), old));

        let (second, _) = op();
        let new = s.track("x".into(), second).unwrap();
        assert_ne!(old, new);
        assert!(!s.untrack_generation(&"x".into(), old));
        assert!(s.is_tracked(&"x".into()));
    }

    #[test]
    fn cancel_unknown_is_false() {
        let (s, _rx) = session();
        assert!(!s.cancel(&"nope".into()));
    }

    #[test]
    fn cancel_all_trips_every_token_once() {
        let (s, _rx) = session();
        let tokens: Vec<CancellationToken> = (0..3)
            .map(|i| {
                let (o, t) = op();
                s.track(i.to_string().into(), o).unwrap();
                t
            })
            .collect();

        assert_eq!(s.cancel_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert!(s.is_closing());
        assert_eq!(s.cancel_all(), 0);
    }

    #[test]
    fn cancel_all_tolerates_vanished_entries() {
        let (s, _rx) = session();
        let (o, _) = op();
        s.track("gone".into(), o).unwrap();
        s.untrack(&"gone".into());
        assert_eq!(s.cancel_all(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_spawned_tasks() {
        let (s, _rx) = session();
        s.tasks().spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert!(s.drain(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn drain_times_out_on_stuck_task() {
        let (s, _rx) = session();
        s.tasks().spawn(std::future::pending::<()>());
        assert!(!s.drain(Duration::from_millis(20)).await);
    }
}
