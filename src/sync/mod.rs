//! Social-interaction synchronization core.
//!
//! Three primitives, all built on the conditional store operations in
//! `crate::store`:
//!
//! - `derive_thread_key` + `ThreadRegistry`: canonical conversation identity
//!   and idempotent thread creation. Two users opening the same conversation
//!   concurrently converge on one record.
//! - `RelationshipToggle`: like/follow toggling. The edge set is the source
//!   of truth; counters are adjusted by the delta of the mutation that was
//!   actually applied, so replays cannot double-count.
//! - `CounterReconciler`: recomputes a counter from its membership set and
//!   repairs drift.
//!
//! Nothing here takes a lock across clients; convergence comes from
//! write-if-absent / remove-if-present / compare-and-set at the store.

use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    following_mirror_path, CounterKind, EdgeRecord, RelationshipKind, RelationshipState, Thread,
    ThreadHandle, ThreadKey,
};
use crate::store::{StoreError, StoreResult, SyncStore};

/// How many compare-and-set rounds a counter adjustment gets before the
/// drift is left to reconciliation.
const COUNTER_CAS_ATTEMPTS: u32 = 4;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed or self-referential input. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The backing store could not be reached or answered garbage. The
    /// caller may retry with backoff; every operation here is idempotent.
    #[error("sync store unavailable: {0}")]
    Unavailable(#[from] StoreError),
    /// The authoritative edge mutation was rejected after the caller already
    /// applied its optimistic flip. `prior` is the pre-toggle snapshot the
    /// caller must roll back to.
    #[error("toggle failed, roll back to prior state: {source}")]
    ToggleFailed {
        prior: RelationshipState,
        source: StoreError,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Ids become path segments in the store, so the separator is reserved.
fn validate_id(label: &str, id: &str) -> SyncResult<()> {
    if id.is_empty() {
        return Err(SyncError::InvalidArgument(format!("{} must not be empty", label)));
    }
    if id.contains('/') {
        return Err(SyncError::InvalidArgument(format!(
            "{} must not contain '/': {:?}",
            label, id
        )));
    }
    Ok(())
}

// ==================== Identity keyer ====================

/// Derive the canonical key for the conversation between two distinct users.
///
/// The pair is ordered lexicographically and each id is length-prefixed, so
/// the key is commutative and injective over unordered pairs: no choice of
/// ids can make two different pairs collide, even ids that contain the
/// separator characters themselves.
pub fn derive_thread_key(user_a: &str, user_b: &str) -> SyncResult<ThreadKey> {
    validate_id("user id", user_a)?;
    validate_id("user id", user_b)?;
    if user_a == user_b {
        return Err(SyncError::InvalidArgument(
            "cannot open a conversation with yourself".to_string(),
        ));
    }
    let (first, second) = ordered_pair(user_a, user_b);
    Ok(ThreadKey(format!(
        "{}:{}|{}:{}",
        first.len(),
        first,
        second.len(),
        second
    )))
}

fn ordered_pair<'a>(user_a: &'a str, user_b: &'a str) -> (&'a str, &'a str) {
    if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    }
}

fn thread_path(key: &ThreadKey) -> String {
    format!("threads/{}", key)
}

// ==================== Thread registry ====================

/// Get-or-create of conversation records, race-convergent by construction:
/// the single write is conditional, and a lost race means adopting the
/// winner's record instead of erroring.
pub struct ThreadRegistry {
    store: Arc<dyn SyncStore>,
}

impl ThreadRegistry {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub async fn get_or_create(&self, user_a: &str, user_b: &str) -> SyncResult<ThreadHandle> {
        let key = derive_thread_key(user_a, user_b)?;
        let path = thread_path(&key);

        if let Some(value) = self.store.read(&path).await? {
            return Ok(ThreadHandle {
                thread: parse_thread(value)?,
                created: false,
            });
        }

        let (first, second) = ordered_pair(user_a, user_b);
        let thread = Thread {
            id: Uuid::new_v4().to_string(),
            key: key.clone(),
            participants: [first.to_string(), second.to_string()],
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&thread).map_err(StoreError::from)?;

        if self.store.write_if_absent(&path, value).await? {
            log::info!("created thread {} for ({}, {})", thread.id, first, second);
            return Ok(ThreadHandle {
                thread,
                created: true,
            });
        }

        // Lost the creation race: another client's record is in place now.
        match self.store.read(&path).await? {
            Some(value) => Ok(ThreadHandle {
                thread: parse_thread(value)?,
                created: false,
            }),
            // Threads are never deleted, so this means the store is lying.
            None => Err(SyncError::Unavailable(StoreError::NotFound(format!(
                "thread {}",
                key
            )))),
        }
    }
}

fn parse_thread(value: serde_json::Value) -> SyncResult<Thread> {
    serde_json::from_value(value).map_err(|e| SyncError::Unavailable(StoreError::Json(e)))
}

// ==================== Relationship toggle ====================

/// Toggle engine for binary relationships (like, follow) with counter
/// maintenance.
///
/// The caller passes the state it last observed; the engine flips it through
/// a conditional edge mutation and adjusts the affected counters by exactly
/// the delta that mutation produced. A replayed toggle finds the edge
/// already in the desired state, mutates nothing, and therefore counts
/// nothing.
pub struct RelationshipToggle {
    store: Arc<dyn SyncStore>,
    cas_attempts: u32,
}

impl RelationshipToggle {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self {
            store,
            cas_attempts: COUNTER_CAS_ATTEMPTS,
        }
    }

    /// The immediate local flip a client renders while the authoritative
    /// phase is in flight. Pure; provisional until `toggle` confirms, and
    /// discarded (not persisted) if the call is cancelled or fails.
    pub fn optimistic_next(observed: &RelationshipState) -> RelationshipState {
        if observed.active {
            RelationshipState {
                active: false,
                counter: (observed.counter - 1).max(0),
            }
        } else {
            RelationshipState {
                active: true,
                counter: observed.counter + 1,
            }
        }
    }

    /// Flip the relationship and return the confirmed post-toggle state.
    ///
    /// On an edge-mutation failure the error carries `observed` back so the
    /// caller can re-render the true pre-toggle state.
    pub async fn toggle(
        &self,
        actor: &str,
        target: &str,
        kind: RelationshipKind,
        observed: &RelationshipState,
    ) -> SyncResult<RelationshipState> {
        validate_id("actor id", actor)?;
        validate_id("target id", target)?;
        if kind == RelationshipKind::Follow && actor == target {
            return Err(SyncError::InvalidArgument(
                "cannot follow yourself".to_string(),
            ));
        }

        let desired = !observed.active;
        let edge_path = kind.edge_path(target, actor);
        let applied = self
            .apply_edge(&edge_path, actor, desired)
            .await
            .map_err(|source| SyncError::ToggleFailed {
                prior: observed.clone(),
                source,
            })?;

        // 0 when the edge already matched the desired state: a retry that
        // replays the mutation must not move the counter again.
        let delta = match (applied, desired) {
            (true, true) => 1,
            (true, false) => -1,
            (false, _) => 0,
        };

        let counter_kind = match kind {
            RelationshipKind::Like => CounterKind::Likes,
            RelationshipKind::Follow => CounterKind::Followers,
        };
        if delta != 0 {
            self.bump_counter(&counter_kind.counter_path(target), delta)
                .await;
        }
        if kind == RelationshipKind::Follow {
            self.sync_follow_mirror(actor, target, desired).await;
        }

        let counter = self.read_counter(&counter_kind.counter_path(target)).await?;
        Ok(RelationshipState {
            active: desired,
            counter,
        })
    }

    /// Current confirmed state of a relationship for one actor.
    pub async fn current(
        &self,
        actor: &str,
        target: &str,
        kind: RelationshipKind,
    ) -> SyncResult<RelationshipState> {
        validate_id("actor id", actor)?;
        validate_id("target id", target)?;
        let active = self.store.read(&kind.edge_path(target, actor)).await?.is_some();
        let counter_kind = match kind {
            RelationshipKind::Like => CounterKind::Likes,
            RelationshipKind::Follow => CounterKind::Followers,
        };
        let counter = self.read_counter(&counter_kind.counter_path(target)).await?;
        Ok(RelationshipState { active, counter })
    }

    async fn apply_edge(&self, edge_path: &str, member: &str, desired: bool) -> StoreResult<bool> {
        if desired {
            let record = EdgeRecord {
                user: member.to_string(),
                created_at: Utc::now(),
            };
            let value = serde_json::to_value(&record)?;
            self.store.write_if_absent(edge_path, value).await
        } else {
            self.store.remove_if_present(edge_path).await
        }
    }

    /// Keep the actor-side following set and counter in step with a follow
    /// toggle. Failures are logged, not surfaced: the follower set is
    /// already correct, and a retried toggle or the reconciler converges
    /// this side too.
    async fn sync_follow_mirror(&self, actor: &str, target: &str, desired: bool) {
        let mirror = following_mirror_path(actor, target);
        match self.apply_edge(&mirror, target, desired).await {
            Ok(true) => {
                let delta = if desired { 1 } else { -1 };
                self.bump_counter(&CounterKind::Following.counter_path(actor), delta)
                    .await;
            }
            Ok(false) => {}
            Err(e) => log::warn!("following mirror {} not updated: {}", mirror, e),
        }
    }

    /// Adjust a counter through compare-and-set. A contended or failing
    /// adjustment is logged and left to reconciliation; the edge set is
    /// already authoritative at this point, so the toggle itself succeeds.
    async fn bump_counter(&self, path: &str, delta: i64) {
        for _ in 0..self.cas_attempts {
            match self.try_bump(path, delta).await {
                Ok(true) => return,
                Ok(false) => continue, // lost the swap; re-read and retry
                Err(e) => {
                    log::warn!("counter {} not adjusted by {}: {}", path, delta, e);
                    return;
                }
            }
        }
        log::warn!(
            "counter {} still contended after {} attempts, leaving drift to reconciliation",
            path,
            self.cas_attempts
        );
    }

    async fn try_bump(&self, path: &str, delta: i64) -> StoreResult<bool> {
        match self.store.read(path).await? {
            None => {
                let next = delta.max(0);
                self.store.write_if_absent(path, json!(next)).await
            }
            Some(current) => {
                // a drifted counter never goes below zero
                let next = (current.as_i64().unwrap_or(0) + delta).max(0);
                self.store.set_if_matches(path, &current, json!(next)).await
            }
        }
    }

    async fn read_counter(&self, path: &str) -> SyncResult<i64> {
        Ok(self
            .store
            .read(path)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }
}

// ==================== Counter reconciler ====================

/// Repairs a denormalized counter from its authoritative membership set.
/// Never touches the edges; strictly a corrective write on the counter.
pub struct CounterReconciler {
    store: Arc<dyn SyncStore>,
}

impl CounterReconciler {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile(&self, owner: &str, kind: CounterKind) -> SyncResult<i64> {
        validate_id("target id", owner)?;
        let members = self.store.list(&kind.edge_prefix(owner)).await?;
        let actual = members.len() as i64;

        let path = kind.counter_path(owner);
        let stored = self
            .store
            .read(&path)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        if stored != actual {
            log::info!(
                "counter drift at {}: stored {}, actual {}",
                path,
                stored,
                actual
            );
            self.store.set_field(&path, json!(actual)).await?;
        }
        Ok(actual)
    }
}

/// Decides when a toggle should be followed by an opportunistic
/// reconciliation pass: every `every`-th toggle process-wide, trading strict
/// counter accuracy for write volume.
pub struct ReconcilePolicy {
    every: u64,
    toggles: AtomicU64,
}

impl ReconcilePolicy {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            toggles: AtomicU64::new(0),
        }
    }

    /// Record one toggle; true when this one crosses the cadence boundary.
    pub fn due(&self) -> bool {
        let n = self.toggles.fetch_add(1, Ordering::Relaxed) + 1;
        n % self.every == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteSync;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    fn memory_store() -> Arc<dyn SyncStore> {
        Arc::new(SqliteSync::in_memory().unwrap())
    }

    fn inactive(counter: i64) -> RelationshipState {
        RelationshipState {
            active: false,
            counter,
        }
    }

    fn active(counter: i64) -> RelationshipState {
        RelationshipState {
            active: true,
            counter,
        }
    }

    // ==================== keyer ====================

    #[test]
    fn test_thread_key_commutative() {
        let ab = derive_thread_key("alice", "bob").unwrap();
        let ba = derive_thread_key("bob", "alice").unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_thread_key_injective_for_separator_bearing_ids() {
        // Naive concatenation would map both pairs to "a|b|c".
        let first = derive_thread_key("a|b", "c").unwrap();
        let second = derive_thread_key("a", "b|c").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_thread_key_injective_for_colon_bearing_ids() {
        // Both pairs concatenate to "3:bob:alice" under a naive ":" scheme.
        let first = derive_thread_key("3:bob", "alice").unwrap();
        let second = derive_thread_key("3", "bob:alice").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_thread_key_rejects_self() {
        assert!(matches!(
            derive_thread_key("alice", "alice"),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_thread_key_rejects_empty_and_path_separator() {
        assert!(matches!(
            derive_thread_key("", "bob"),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            derive_thread_key("ali/ce", "bob"),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    // ==================== thread registry ====================

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = ThreadRegistry::new(memory_store());

        let first = registry.get_or_create("alice", "bob").await.unwrap();
        assert!(first.created);
        assert_eq!(
            first.thread.participants,
            ["alice".to_string(), "bob".to_string()]
        );

        // opposite argument order from the other device
        let second = registry.get_or_create("bob", "alice").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.thread.id, first.thread.id);
        assert_eq!(second.thread.key, first.thread.key);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_converges() {
        let store = memory_store();
        let registry_a = ThreadRegistry::new(store.clone());
        let registry_b = ThreadRegistry::new(store.clone());

        let (a, b) = tokio::join!(
            registry_a.get_or_create("alice", "bob"),
            registry_b.get_or_create("bob", "alice"),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.thread.id, b.thread.id);
        assert_eq!(
            usize::from(a.created) + usize::from(b.created),
            1,
            "exactly one call creates the record"
        );
    }

    /// Store that makes every conditional create lose, simulating a racing
    /// client that wrote the record between our read and our write.
    struct LosingStore {
        inner: Arc<dyn SyncStore>,
        winner: Value,
        reads: Mutex<u32>,
    }

    #[async_trait]
    impl SyncStore for LosingStore {
        async fn read(&self, _path: &str) -> StoreResult<Option<Value>> {
            let mut reads = self.reads.lock().unwrap();
            *reads += 1;
            if *reads == 1 {
                // the initial existence check still sees nothing
                return Ok(None);
            }
            Ok(Some(self.winner.clone()))
        }
        async fn write_if_absent(&self, _path: &str, _value: Value) -> StoreResult<bool> {
            Ok(false)
        }
        async fn remove_if_present(&self, path: &str) -> StoreResult<bool> {
            self.inner.remove_if_present(path).await
        }
        async fn set_field(&self, path: &str, value: Value) -> StoreResult<()> {
            self.inner.set_field(path, value).await
        }
        async fn set_if_matches(
            &self,
            path: &str,
            expected: &Value,
            value: Value,
        ) -> StoreResult<bool> {
            self.inner.set_if_matches(path, expected, value).await
        }
        async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_lost_creation_race_adopts_winner() {
        let winner = Thread {
            id: "winner-thread".to_string(),
            key: derive_thread_key("alice", "bob").unwrap(),
            participants: ["alice".to_string(), "bob".to_string()],
            created_at: Utc::now(),
        };
        let store = Arc::new(LosingStore {
            inner: memory_store(),
            winner: serde_json::to_value(&winner).unwrap(),
            reads: Mutex::new(0),
        });

        let registry = ThreadRegistry::new(store);
        let handle = registry.get_or_create("alice", "bob").await.unwrap();
        assert!(!handle.created);
        assert_eq!(handle.thread.id, "winner-thread");
    }

    // ==================== toggle ====================

    #[test]
    fn test_optimistic_next_flips_and_clamps() {
        assert_eq!(RelationshipToggle::optimistic_next(&inactive(3)), active(4));
        assert_eq!(RelationshipToggle::optimistic_next(&active(4)), inactive(3));
        // a stale zero snapshot must not go negative
        assert_eq!(RelationshipToggle::optimistic_next(&active(0)), inactive(0));
    }

    #[tokio::test]
    async fn test_like_toggle_and_idempotent_retry() {
        let store = memory_store();
        store
            .set_field("counters/likes/p1", json!(3))
            .await
            .unwrap();
        let toggles = RelationshipToggle::new(store.clone());

        let state = toggles
            .toggle("alice", "p1", RelationshipKind::Like, &inactive(3))
            .await
            .unwrap();
        assert_eq!(state, active(4));

        // an identical replayed call finds the edge already present
        let replayed = toggles
            .toggle("alice", "p1", RelationshipKind::Like, &inactive(3))
            .await
            .unwrap();
        assert_eq!(replayed, active(4));

        let edges = store.list("edges/like/p1").await.unwrap();
        assert_eq!(edges.len(), 1, "replay must not duplicate the edge");
    }

    #[tokio::test]
    async fn test_toggle_reversible() {
        let store = memory_store();
        let toggles = RelationshipToggle::new(store.clone());

        let on = toggles
            .toggle("alice", "p1", RelationshipKind::Like, &inactive(0))
            .await
            .unwrap();
        assert_eq!(on, active(1));

        let off = toggles
            .toggle("alice", "p1", RelationshipKind::Like, &on)
            .await
            .unwrap();
        assert_eq!(off, inactive(0));
        assert!(store.list("edges/like/p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_follow_maintains_both_sides() {
        let store = memory_store();
        let toggles = RelationshipToggle::new(store.clone());

        let state = toggles
            .toggle("alice", "bob", RelationshipKind::Follow, &inactive(0))
            .await
            .unwrap();
        assert_eq!(state, active(1));

        let followers = store.read("counters/followers/bob").await.unwrap();
        assert_eq!(followers, Some(json!(1)));
        let following = store.read("counters/following/alice").await.unwrap();
        assert_eq!(following, Some(json!(1)));
        assert!(store
            .read("edges/following/alice/bob")
            .await
            .unwrap()
            .is_some());

        toggles
            .toggle("alice", "bob", RelationshipKind::Follow, &state)
            .await
            .unwrap();
        let following = store.read("counters/following/alice").await.unwrap();
        assert_eq!(following, Some(json!(0)));
    }

    #[tokio::test]
    async fn test_follow_self_rejected() {
        let toggles = RelationshipToggle::new(memory_store());
        let result = toggles
            .toggle("alice", "alice", RelationshipKind::Follow, &inactive(0))
            .await;
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    /// Store whose mutations always fail with a transport error.
    struct UnreachableStore;

    #[async_trait]
    impl SyncStore for UnreachableStore {
        async fn read(&self, _path: &str) -> StoreResult<Option<Value>> {
            Ok(None)
        }
        async fn write_if_absent(&self, _path: &str, _value: Value) -> StoreResult<bool> {
            Err(StoreError::Unreachable("simulated outage".to_string()))
        }
        async fn remove_if_present(&self, _path: &str) -> StoreResult<bool> {
            Err(StoreError::Unreachable("simulated outage".to_string()))
        }
        async fn set_field(&self, _path: &str, _value: Value) -> StoreResult<()> {
            Err(StoreError::Unreachable("simulated outage".to_string()))
        }
        async fn set_if_matches(
            &self,
            _path: &str,
            _expected: &Value,
            _value: Value,
        ) -> StoreResult<bool> {
            Err(StoreError::Unreachable("simulated outage".to_string()))
        }
        async fn list(&self, _prefix: &str) -> StoreResult<Vec<(String, Value)>> {
            Err(StoreError::Unreachable("simulated outage".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_toggle_carries_prior_state_for_rollback() {
        let toggles = RelationshipToggle::new(Arc::new(UnreachableStore));
        let observed = inactive(3);

        let err = toggles
            .toggle("alice", "p1", RelationshipKind::Like, &observed)
            .await
            .unwrap_err();
        match err {
            SyncError::ToggleFailed { prior, .. } => assert_eq!(prior, observed),
            other => panic!("expected ToggleFailed, got {:?}", other),
        }
    }

    /// Store that loses every compare-and-set, as if another device kept
    /// winning the counter swap.
    struct ContendedStore {
        inner: Arc<dyn SyncStore>,
    }

    #[async_trait]
    impl SyncStore for ContendedStore {
        async fn read(&self, path: &str) -> StoreResult<Option<Value>> {
            self.inner.read(path).await
        }
        async fn write_if_absent(&self, path: &str, value: Value) -> StoreResult<bool> {
            if path.starts_with("counters/") {
                return Ok(false);
            }
            self.inner.write_if_absent(path, value).await
        }
        async fn remove_if_present(&self, path: &str) -> StoreResult<bool> {
            self.inner.remove_if_present(path).await
        }
        async fn set_field(&self, path: &str, value: Value) -> StoreResult<()> {
            self.inner.set_field(path, value).await
        }
        async fn set_if_matches(
            &self,
            _path: &str,
            _expected: &Value,
            _value: Value,
        ) -> StoreResult<bool> {
            Ok(false)
        }
        async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_contended_counter_leaves_drift_to_reconciler() {
        let inner = memory_store();
        let store: Arc<dyn SyncStore> = Arc::new(ContendedStore {
            inner: inner.clone(),
        });
        let toggles = RelationshipToggle::new(store.clone());

        // toggle succeeds even though the counter never moves
        let state = toggles
            .toggle("alice", "p1", RelationshipKind::Like, &inactive(0))
            .await
            .unwrap();
        assert!(state.active);
        assert_eq!(state.counter, 0, "counter bump lost to contention");

        // the edge landed, so reconciliation repairs the counter
        let reconciler = CounterReconciler::new(inner);
        let corrected = reconciler.reconcile("p1", CounterKind::Likes).await.unwrap();
        assert_eq!(corrected, 1);
    }

    // ==================== reconciler ====================

    #[tokio::test]
    async fn test_reconcile_repairs_drift() {
        let store = memory_store();
        let toggles = RelationshipToggle::new(store.clone());
        toggles
            .toggle("alice", "p1", RelationshipKind::Like, &inactive(0))
            .await
            .unwrap();
        toggles
            .toggle("bob", "p1", RelationshipKind::Like, &inactive(1))
            .await
            .unwrap();

        // smash the counter
        store
            .set_field("counters/likes/p1", json!(40))
            .await
            .unwrap();

        let reconciler = CounterReconciler::new(store.clone());
        let corrected = reconciler.reconcile("p1", CounterKind::Likes).await.unwrap();
        assert_eq!(corrected, 2);
        let stored = store.read("counters/likes/p1").await.unwrap();
        assert_eq!(stored, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_reconcile_matches_set_after_churn() {
        let store = memory_store();
        let toggles = RelationshipToggle::new(store.clone());

        // alice on, bob on, alice off
        let a = toggles
            .toggle("alice", "p1", RelationshipKind::Like, &inactive(0))
            .await
            .unwrap();
        toggles
            .toggle("bob", "p1", RelationshipKind::Like, &inactive(1))
            .await
            .unwrap();
        toggles
            .toggle("alice", "p1", RelationshipKind::Like, &a)
            .await
            .unwrap();

        let reconciler = CounterReconciler::new(store);
        let corrected = reconciler.reconcile("p1", CounterKind::Likes).await.unwrap();
        assert_eq!(corrected, 1);
    }

    #[tokio::test]
    async fn test_reconcile_never_touches_edges() {
        let store = memory_store();
        let toggles = RelationshipToggle::new(store.clone());
        toggles
            .toggle("alice", "p1", RelationshipKind::Like, &inactive(0))
            .await
            .unwrap();

        let reconciler = CounterReconciler::new(store.clone());
        reconciler.reconcile("p1", CounterKind::Likes).await.unwrap();

        let edges = store.list("edges/like/p1").await.unwrap();
        assert_eq!(edges.len(), 1);
        let record: EdgeRecord = serde_json::from_value(edges[0].1.clone()).unwrap();
        assert_eq!(record.user, "alice");
    }

    #[tokio::test]
    async fn test_reconcile_following_counter() {
        let store = memory_store();
        let toggles = RelationshipToggle::new(store.clone());
        toggles
            .toggle("alice", "bob", RelationshipKind::Follow, &inactive(0))
            .await
            .unwrap();
        toggles
            .toggle("alice", "carol", RelationshipKind::Follow, &inactive(0))
            .await
            .unwrap();

        store
            .set_field("counters/following/alice", json!(9))
            .await
            .unwrap();

        let reconciler = CounterReconciler::new(store);
        let corrected = reconciler
            .reconcile("alice", CounterKind::Following)
            .await
            .unwrap();
        assert_eq!(corrected, 2);
    }

    // ==================== policy ====================

    #[test]
    fn test_reconcile_policy_cadence() {
        let policy = ReconcilePolicy::new(3);
        let due: Vec<bool> = (0..6).map(|_| policy.due()).collect();
        assert_eq!(due, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_reconcile_policy_every_toggle() {
        let policy = ReconcilePolicy::new(1);
        assert!(policy.due());
        assert!(policy.due());
    }
}
