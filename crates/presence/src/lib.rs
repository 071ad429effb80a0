//! Incremental per-namespace workload presence.
//!
//! Instead of issuing a six-way list fan-out every time a caller asks
//! "does this namespace run anything", the tracker folds watch events
//! for the six workload kinds into per-namespace key sets and answers
//! from those counts in O(1). Missed or out-of-order events never
//! produce a wrong answer: any inconsistency degrades the namespace to
//! `Unknown`, which tells callers to fall back to an authoritative
//! listing instead of trusting the incremental count.

#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use argus_core::Presence;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The six watched workload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Pod,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 6] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::DaemonSet,
        WorkloadKind::Job,
        WorkloadKind::CronJob,
        WorkloadKind::Pod,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
            WorkloadKind::Job => "job",
            WorkloadKind::CronJob => "cronjob",
            WorkloadKind::Pod => "pod",
        }
    }

    fn index(self) -> usize {
        match self {
            WorkloadKind::Deployment => 0,
            WorkloadKind::StatefulSet => 1,
            WorkloadKind::DaemonSet => 2,
            WorkloadKind::Job => 3,
            WorkloadKind::CronJob => 4,
            WorkloadKind::Pod => 5,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-namespace bookkeeping. `total` always equals the sum of the
/// per-kind set sizes.
#[derive(Debug, Default)]
struct NamespaceState {
    objects: [FxHashSet<String>; 6],
    total: usize,
    unknown: bool,
}

/// Live presence across all watched namespaces. One coarse lock over
/// the namespace map; every event costs O(1) under it.
pub struct WorkloadTracker {
    namespaces: RwLock<FxHashMap<String, NamespaceState>>,
    gate: SyncGate,
}

impl Default for WorkloadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkloadTracker {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(FxHashMap::default()),
            gate: SyncGate::new(),
        }
    }

    /// Gate the watch feeds report their initial sync through.
    pub fn sync_gate(&self) -> &SyncGate {
        &self.gate
    }

    /// Records an object add (or a relist re-add, which is a no-op for
    /// an already-tracked key). A genuinely new key is authoritative
    /// evidence and clears a prior `unknown` flag.
    pub fn handle_add(&self, kind: WorkloadKind, namespace: &str, key: &str) {
        let mut map = self.namespaces.write().unwrap();
        let state = map.entry(namespace.to_string()).or_default();
        if state.objects[kind.index()].insert(key.to_string()) {
            state.total += 1;
            if state.unknown {
                debug!(namespace = %namespace, kind = %kind, "presence: add cleared unknown");
                state.unknown = false;
            }
        }
        metrics::counter!("presence_events_total", 1u64, "kind" => kind.as_str(), "op" => "add");
        metrics::gauge!("presence_namespaces_tracked", map.len() as f64);
    }

    /// Records an object delete. A delete for an untracked namespace or
    /// key means we missed events, so the namespace degrades to
    /// `unknown` rather than guessing. A namespace whose last tracked
    /// key is removed cleanly is dropped from the map entirely.
    pub fn handle_delete(&self, kind: WorkloadKind, namespace: &str, key: &str) {
        let mut map = self.namespaces.write().unwrap();
        match map.entry(namespace.to_string()) {
            Entry::Vacant(slot) => {
                warn!(namespace = %namespace, kind = %kind, "presence: delete for untracked namespace");
                slot.insert(NamespaceState { unknown: true, ..Default::default() });
                metrics::counter!("presence_desync_total", 1u64, "kind" => kind.as_str());
            }
            Entry::Occupied(mut slot) => {
                let state = slot.get_mut();
                if state.objects[kind.index()].remove(key) {
                    state.total -= 1;
                    if state.total == 0 && !state.unknown {
                        slot.remove();
                    }
                } else {
                    warn!(namespace = %namespace, kind = %kind, key = %key, "presence: delete for untracked key");
                    state.unknown = true;
                    metrics::counter!("presence_desync_total", 1u64, "kind" => kind.as_str());
                }
            }
        }
        metrics::counter!("presence_events_total", 1u64, "kind" => kind.as_str(), "op" => "delete");
        metrics::gauge!("presence_namespaces_tracked", map.len() as f64);
    }

    /// Forces `Unknown` for a namespace, e.g. after a failed
    /// reconciliation scan. Creates the entry if needed so the flag
    /// sticks until an authoritative add clears it.
    pub fn mark_unknown(&self, namespace: &str) {
        let mut map = self.namespaces.write().unwrap();
        map.entry(namespace.to_string()).or_default().unknown = true;
        metrics::gauge!("presence_namespaces_tracked", map.len() as f64);
    }

    /// `(has_workloads, known)`. Before the initial sync everything is
    /// `(false, false)`; an unseen namespace afterwards is confidently
    /// empty `(false, true)`; otherwise `(total > 0, !unknown)`.
    pub fn has_workloads(&self, namespace: &str) -> (bool, bool) {
        if !self.gate.is_synced() {
            return (false, false);
        }
        let map = self.namespaces.read().unwrap();
        match map.get(namespace) {
            None => (false, true),
            Some(state) => (state.total > 0, !state.unknown),
        }
    }

    /// [`has_workloads`](Self::has_workloads) folded into the tri-state
    /// answer callers branch on.
    pub fn presence(&self, namespace: &str) -> Presence {
        match self.has_workloads(namespace) {
            (_, false) => Presence::Unknown,
            (true, true) => Presence::Present,
            (false, true) => Presence::Absent,
        }
    }

    /// Number of namespaces currently holding tracked state.
    pub fn namespace_count(&self) -> usize {
        self.namespaces.read().unwrap().len()
    }

    /// Tracked object count for one namespace, if any state exists.
    pub fn tracked_total(&self, namespace: &str) -> Option<usize> {
        self.namespaces.read().unwrap().get(namespace).map(|s| s.total)
    }
}

// ---- sync gate ----

struct GateState {
    pending: FxHashSet<String>,
    registered: usize,
}

struct GateInner {
    state: Mutex<GateState>,
    synced: AtomicBool,
    tx: watch::Sender<bool>,
}

/// Tracks which informers have completed their initial list. Once every
/// registered feed has reported in, the gate latches open permanently.
#[derive(Clone)]
pub struct SyncGate {
    inner: Arc<GateInner>,
}

impl Default for SyncGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState { pending: FxHashSet::default(), registered: 0 }),
                synced: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Registers a feed by name. All registrations must happen before
    /// the feeds start reporting, or the gate may latch early.
    pub fn register(&self, name: impl Into<String>) -> SyncToken {
        let name = name.into();
        {
            let mut st = self.inner.state.lock().unwrap();
            st.pending.insert(name.clone());
            st.registered += 1;
        }
        SyncToken { gate: self.clone(), name, fired: AtomicBool::new(false) }
    }

    pub fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    /// Waits until every registered feed has synced, or `timeout`
    /// elapses. The synced result is memoized permanently, so later
    /// calls return immediately.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        if self.is_synced() {
            return true;
        }
        let mut rx = self.inner.tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        let waited = tokio::time::timeout(timeout, async move {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if *rx.borrow() {
                    return true;
                }
            }
        })
        .await;
        waited.unwrap_or(false)
    }

    fn mark(&self, name: &str) {
        let all_done = {
            let mut st = self.inner.state.lock().unwrap();
            st.pending.remove(name);
            st.registered > 0 && st.pending.is_empty()
        };
        if all_done && !self.inner.synced.swap(true, Ordering::AcqRel) {
            info!("presence: all feeds synced");
            metrics::gauge!("presence_synced", 1.0);
            let _ = self.inner.tx.send(true);
        }
    }
}

/// Handed to one feed; reports that feed's initial sync exactly once,
/// no matter how many relists follow.
pub struct SyncToken {
    gate: SyncGate,
    name: String,
    fired: AtomicBool,
}

impl SyncToken {
    pub fn mark_synced(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            debug!(feed = %self.name, "presence: feed synced");
            self.gate.mark(&self.name);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;

    /// Tracker with the gate already open, for tests that are not about
    /// sync behavior.
    fn synced_tracker() -> WorkloadTracker {
        let tracker = WorkloadTracker::new();
        tracker.sync_gate().register("test").mark_synced();
        tracker
    }

    #[test]
    fn everything_is_unknown_before_sync() {
        let tracker = WorkloadTracker::new();
        tracker.handle_add(WorkloadKind::Pod, "prod", "prod/web-0");
        assert_eq!(tracker.presence("prod"), Presence::Unknown);
        assert_eq!(tracker.has_workloads("prod"), (false, false));
    }

    #[test]
    fn unseen_namespace_is_confidently_empty() {
        let tracker = synced_tracker();
        assert_eq!(tracker.presence("idle"), Presence::Absent);
        assert_eq!(tracker.has_workloads("idle"), (false, true));
    }

    #[test]
    fn adds_across_kinds_accumulate() {
        let tracker = synced_tracker();
        tracker.handle_add(WorkloadKind::Deployment, "prod", "prod/web");
        tracker.handle_add(WorkloadKind::Pod, "prod", "prod/web-0");
        tracker.handle_add(WorkloadKind::Pod, "prod", "prod/web-0"); // relist duplicate
        assert_eq!(tracker.tracked_total("prod"), Some(2));
        assert_eq!(tracker.presence("prod"), Presence::Present);
    }

    #[test]
    fn clean_removal_of_last_object_garbage_collects() {
        let tracker = synced_tracker();
        tracker.handle_add(WorkloadKind::Job, "batch", "batch/migrate");
        tracker.handle_delete(WorkloadKind::Job, "batch", "batch/migrate");
        assert_eq!(tracker.namespace_count(), 0);
        // Indistinguishable from a namespace never seen: confidently empty.
        assert_eq!(tracker.presence("batch"), Presence::Absent);
    }

    #[test]
    fn delete_for_untracked_key_degrades_to_unknown() {
        let tracker = synced_tracker();
        tracker.handle_add(WorkloadKind::Pod, "prod", "prod/web-0");
        tracker.handle_delete(WorkloadKind::Pod, "prod", "prod/ghost");
        assert_eq!(tracker.presence("prod"), Presence::Unknown);
        // Still tracked so the flag sticks.
        assert_eq!(tracker.namespace_count(), 1);
    }

    #[test]
    fn delete_for_untracked_namespace_creates_unknown_entry() {
        let tracker = synced_tracker();
        tracker.handle_delete(WorkloadKind::Deployment, "mystery", "mystery/app");
        assert_eq!(tracker.presence("mystery"), Presence::Unknown);
        assert_eq!(tracker.namespace_count(), 1);
    }

    #[test]
    fn new_add_recovers_from_unknown() {
        let tracker = synced_tracker();
        tracker.mark_unknown("prod");
        assert_eq!(tracker.presence("prod"), Presence::Unknown);
        tracker.handle_add(WorkloadKind::StatefulSet, "prod", "prod/db");
        assert_eq!(tracker.presence("prod"), Presence::Present);
    }

    #[test]
    fn duplicate_add_does_not_recover_unknown() {
        let tracker = synced_tracker();
        tracker.handle_add(WorkloadKind::Pod, "prod", "prod/web-0");
        tracker.mark_unknown("prod");
        // Re-observing an already-tracked key proves nothing new.
        tracker.handle_add(WorkloadKind::Pod, "prod", "prod/web-0");
        assert_eq!(tracker.presence("prod"), Presence::Unknown);
    }

    #[test]
    fn unknown_namespace_is_not_garbage_collected_when_emptied() {
        let tracker = synced_tracker();
        tracker.handle_add(WorkloadKind::Pod, "prod", "prod/web-0");
        tracker.mark_unknown("prod");
        tracker.handle_delete(WorkloadKind::Pod, "prod", "prod/web-0");
        // Empty but uncertain: the entry must survive to keep the flag.
        assert_eq!(tracker.namespace_count(), 1);
        assert_eq!(tracker.presence("prod"), Presence::Unknown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gate_opens_only_after_every_feed_reports() {
        let gate = SyncGate::new();
        let pods = gate.register("pods");
        let jobs = gate.register("jobs");

        assert!(!gate.wait_for_sync(Duration::from_millis(20)).await);

        pods.mark_synced();
        assert!(!gate.wait_for_sync(Duration::from_millis(20)).await);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_for_sync(Duration::from_secs(5)).await })
        };
        jobs.mark_synced();
        assert!(waiter.await.unwrap());

        // Memoized: instant and still true.
        assert!(gate.wait_for_sync(Duration::from_millis(1)).await);
        assert!(gate.is_synced());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn token_is_idempotent_across_relists() {
        let gate = SyncGate::new();
        let pods = gate.register("pods");
        let jobs = gate.register("jobs");
        pods.mark_synced();
        pods.mark_synced();
        pods.mark_synced();
        assert!(!gate.is_synced(), "one feed syncing repeatedly must not open the gate");
        jobs.mark_synced();
        assert!(gate.wait_for_sync(Duration::from_millis(50)).await);
    }
}
