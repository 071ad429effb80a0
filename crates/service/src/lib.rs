//! Snapshot build service: the single entry point the transport layers
//! call to obtain a versioned [`Snapshot`] for a `(domain, scope)` pair.
//!
//! A build request passes, in order, through the permission gate
//! ([`gate`]), the TTL cache, and a singleflight table that collapses
//! concurrent identical requests onto one builder invocation. Bypass
//! requests skip the cache and fly under a separate singleflight key so
//! a forced rebuild never queues behind a normal one. Successful builds
//! are stamped with a process-wide sequence number, a payload checksum,
//! and timing stats before they are published or cached.

#![forbid(unsafe_code)]

pub mod gate;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use argus_core::{payload_checksum, Domain, Error, Result, Snapshot};
pub use gate::{
    policy_for, Decision, PermissionChecker, PermissionPolicy, RequirementMode,
    ResourceRequirement,
};

// ---- builder registry ----

/// Produces the raw payload for one domain. Implementations own their
/// upstream access (informer caches, API listings) and fill
/// `Snapshot.version`, `payload` and the item/batch stats; everything
/// else is stamped by the service.
#[async_trait::async_trait]
pub trait DomainBuilder: Send + Sync {
    async fn build_snapshot(&self, scope: &str) -> anyhow::Result<Snapshot>;
}

/// Builders keyed by domain, assembled once at startup.
#[derive(Default)]
pub struct DomainRegistry {
    builders: FxHashMap<Domain, Arc<dyn DomainBuilder>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a builder, replacing (and logging) any previous one.
    pub fn register(&mut self, domain: Domain, builder: Arc<dyn DomainBuilder>) -> &mut Self {
        if self.builders.insert(domain, builder).is_some() {
            warn!(domain = %domain, "registry: builder replaced");
        }
        self
    }

    pub fn is_registered(&self, domain: Domain) -> bool {
        self.builders.contains_key(&domain)
    }

    pub fn domains(&self) -> Vec<Domain> {
        let mut out: Vec<Domain> = self.builders.keys().copied().collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

// ---- configuration ----

/// Identity of the cluster this service instance fronts. Injected, not
/// global, so several instances can coexist in one process.
#[derive(Debug, Clone)]
pub struct ClusterIdentity {
    pub id: String,
}

impl ClusterIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// `ARGUS_CLUSTER_ID`, defaulting to `local`.
    pub fn from_env() -> Self {
        let id = std::env::var("ARGUS_CLUSTER_ID").unwrap_or_else(|_| "local".into());
        Self { id }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long a cacheable snapshot stays servable.
    pub cache_ttl: Duration,
    /// Upper bound on a single domain builder invocation.
    pub build_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(15),
            build_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    /// `ARGUS_SNAPSHOT_TTL_SECS` / `ARGUS_BUILD_TIMEOUT_SECS`, with the
    /// defaults above.
    pub fn from_env() -> Self {
        let ttl = std::env::var("ARGUS_SNAPSHOT_TTL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(15);
        let timeout = std::env::var("ARGUS_BUILD_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        Self {
            cache_ttl: Duration::from_secs(ttl),
            build_timeout: Duration::from_secs(timeout),
        }
    }
}

/// Per-call build options. The default is a normal, cache-served call.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Skip the cache read and force a rebuild. The rebuilt snapshot is
    /// still cached (when cacheable) and still consumes a sequence number.
    pub bypass_cache: bool,
}

// ---- service ----

struct CacheEntry {
    snapshot: Arc<Snapshot>,
    expires_at: Instant,
}

type FlightSlot = Option<Result<Arc<Snapshot>>>;

struct Inner {
    builders: FxHashMap<Domain, Arc<dyn DomainBuilder>>,
    checker: Arc<dyn PermissionChecker>,
    cluster: ClusterIdentity,
    config: ServiceConfig,
    cache: RwLock<FxHashMap<String, CacheEntry>>,
    flights: Mutex<FxHashMap<String, watch::Receiver<FlightSlot>>>,
    sequence: AtomicU64,
}

/// Cheaply cloneable handle; all clones share cache, flights and the
/// sequence counter.
#[derive(Clone)]
pub struct SnapshotService {
    inner: Arc<Inner>,
}

impl SnapshotService {
    pub fn new(
        registry: DomainRegistry,
        checker: Arc<dyn PermissionChecker>,
        cluster: ClusterIdentity,
        config: ServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                builders: registry.builders,
                checker,
                cluster,
                config,
                cache: RwLock::new(FxHashMap::default()),
                flights: Mutex::new(FxHashMap::default()),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn cluster(&self) -> &ClusterIdentity {
        &self.inner.cluster
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn registered_domains(&self) -> Vec<Domain> {
        let mut out: Vec<Domain> = self.inner.builders.keys().copied().collect();
        out.sort();
        out
    }

    /// Builds (or serves from cache) the snapshot for `(domain, scope)`.
    pub async fn build(&self, domain: Domain, scope: &str) -> Result<Arc<Snapshot>> {
        self.build_with(domain, scope, BuildOptions::default()).await
    }

    /// [`build`](Self::build) with explicit per-call options.
    pub async fn build_with(
        &self,
        domain: Domain,
        scope: &str,
        opts: BuildOptions,
    ) -> Result<Arc<Snapshot>> {
        validate_scope(scope)?;
        gate::authorize(domain, self.inner.checker.as_ref()).await?;

        let key = Snapshot::cache_key(domain, scope);
        if !opts.bypass_cache {
            if let Some(hit) = self.cache_lookup(&key).await {
                metrics::counter!("snapshot_cache_hits_total", 1u64, "domain" => domain.as_str());
                debug!(domain = %domain, scope = %scope, "cache: hit");
                return Ok(hit);
            }
            metrics::counter!("snapshot_cache_misses_total", 1u64, "domain" => domain.as_str());
        }

        self.singleflight(domain, scope, opts).await
    }

    /// Joins the in-flight build for this key, or becomes its leader.
    /// The leader runs on a spawned task so a caller that disconnects
    /// mid-build cannot strand the joiners waiting on the same flight.
    async fn singleflight(
        &self,
        domain: Domain,
        scope: &str,
        opts: BuildOptions,
    ) -> Result<Arc<Snapshot>> {
        let mut flight_key = Snapshot::cache_key(domain, scope);
        if opts.bypass_cache {
            // Separate keyspace: a forced rebuild neither blocks on nor
            // is blocked by a concurrent normal build.
            flight_key.push_str("#bypass");
        }

        enum Flight {
            Join(watch::Receiver<FlightSlot>),
            Lead(watch::Sender<FlightSlot>),
        }

        let flight = {
            let mut flights = self.inner.flights.lock().await;
            match flights.get(&flight_key) {
                Some(rx) => Flight::Join(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(flight_key.clone(), rx);
                    Flight::Lead(tx)
                }
            }
        };

        match flight {
            Flight::Join(rx) => {
                metrics::counter!("snapshot_flight_joined_total", 1u64, "domain" => domain.as_str());
                debug!(domain = %domain, scope = %scope, "flight: joined");
                await_flight(rx).await
            }
            Flight::Lead(tx) => {
                let rx = tx.subscribe();
                let svc = self.clone();
                let scope = scope.to_string();
                tokio::spawn(async move {
                    let result = svc.run_build(domain, &scope, opts).await;
                    // Remove the flight before publishing so late arrivals
                    // start a fresh one instead of observing a finished slot.
                    svc.inner.flights.lock().await.remove(&flight_key);
                    let _ = tx.send(Some(result));
                });
                await_flight(rx).await
            }
        }
    }

    /// Leader body: cache re-check, builder invocation under deadline,
    /// stamping, conditional cache store, telemetry.
    async fn run_build(
        &self,
        domain: Domain,
        scope: &str,
        opts: BuildOptions,
    ) -> Result<Arc<Snapshot>> {
        let key = Snapshot::cache_key(domain, scope);
        if !opts.bypass_cache {
            // A leader for the same key may have finished while this
            // request was acquiring the flight.
            if let Some(hit) = self.cache_lookup(&key).await {
                metrics::counter!("snapshot_cache_hits_total", 1u64, "domain" => domain.as_str());
                return Ok(hit);
            }
        }

        let builder = self
            .inner
            .builders
            .get(&domain)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no builder registered for domain {domain}")))?;

        let started = Instant::now();
        let started_unix = chrono::Utc::now().timestamp();
        debug!(
            cluster = %self.inner.cluster.id,
            domain = %domain,
            scope = %scope,
            bypass = opts.bypass_cache,
            "build: start"
        );

        let built = tokio::time::timeout(
            self.inner.config.build_timeout,
            builder.build_snapshot(scope),
        )
        .await;
        let took_ms = started.elapsed().as_millis() as u64;

        let snapshot = match built {
            Err(_) => {
                self.note_build(domain, "timeout", took_ms);
                warn!(domain = %domain, scope = %scope, took_ms, "build: timed out");
                return Err(Error::Upstream(format!(
                    "{domain} build exceeded {:?}",
                    self.inner.config.build_timeout
                )));
            }
            Ok(Err(e)) => {
                self.note_build(domain, "error", took_ms);
                warn!(domain = %domain, scope = %scope, took_ms, error = %e, "build: failed");
                return Err(Error::Upstream(format!("{domain} build failed: {e:#}")));
            }
            Ok(Ok(snapshot)) => snapshot,
        };

        let snapshot = Arc::new(self.stamp(domain, scope, snapshot, took_ms, started_unix));
        self.note_build(domain, "ok", took_ms);
        if snapshot.stats.truncated {
            metrics::counter!("snapshot_truncated_total", 1u64, "domain" => domain.as_str());
        }
        if !snapshot.stats.warnings.is_empty() {
            metrics::counter!(
                "snapshot_build_warnings_total",
                snapshot.stats.warnings.len() as u64,
                "domain" => domain.as_str()
            );
        }

        if snapshot.cacheable() {
            let mut cache = self.inner.cache.write().await;
            cache.insert(
                key,
                CacheEntry {
                    snapshot: snapshot.clone(),
                    expires_at: Instant::now() + self.inner.config.cache_ttl,
                },
            );
            metrics::gauge!("snapshot_cache_entries", cache.len() as f64);
        } else {
            debug!(domain = %domain, scope = %scope, "cache: skipped partial snapshot");
        }

        info!(
            cluster = %self.inner.cluster.id,
            domain = %domain,
            scope = %scope,
            seq = snapshot.sequence,
            items = snapshot.stats.item_count,
            took_ms,
            "build: ok"
        );
        Ok(snapshot)
    }

    /// Fills the service-owned fields of a freshly built snapshot. The
    /// builder-reported `version`, payload and item/batch stats are kept.
    fn stamp(
        &self,
        domain: Domain,
        scope: &str,
        mut snapshot: Snapshot,
        took_ms: u64,
        started_unix: i64,
    ) -> Snapshot {
        snapshot.domain = domain;
        snapshot.scope = scope.to_string();
        snapshot.sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        snapshot.generated_at = chrono::Utc::now().timestamp_millis();
        snapshot.checksum = payload_checksum(&snapshot.payload);
        snapshot.stats.build_duration_ms = took_ms;
        snapshot.stats.build_started_at_unix = started_unix;
        if snapshot.stats.time_to_first_row_ms == 0 {
            snapshot.stats.time_to_first_row_ms = took_ms;
        }
        snapshot
    }

    /// Serves a live entry, lazily evicting an expired one.
    async fn cache_lookup(&self, key: &str) -> Option<Arc<Snapshot>> {
        {
            let cache = self.inner.cache.read().await;
            match cache.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.snapshot.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        let mut cache = self.inner.cache.write().await;
        if let Some(entry) = cache.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.snapshot.clone());
            }
            cache.remove(key);
            metrics::gauge!("snapshot_cache_entries", cache.len() as f64);
            debug!(key = %key, "cache: evicted expired entry");
        }
        None
    }

    fn note_build(&self, domain: Domain, outcome: &'static str, took_ms: u64) {
        metrics::counter!("snapshot_builds_total", 1u64, "domain" => domain.as_str(), "outcome" => outcome);
        metrics::histogram!("snapshot_build_duration_ms", took_ms as f64, "domain" => domain.as_str());
    }
}

async fn await_flight(mut rx: watch::Receiver<FlightSlot>) -> Result<Arc<Snapshot>> {
    loop {
        if let Some(result) = rx.borrow_and_update().as_ref() {
            return result.clone();
        }
        if rx.changed().await.is_err() {
            return Err(Error::Upstream(
                "snapshot build ended without publishing a result".into(),
            ));
        }
    }
}

/// `#` is reserved to partition singleflight keyspaces.
fn validate_scope(scope: &str) -> Result<()> {
    if scope.trim().is_empty() {
        return Err(Error::Validation("scope must not be empty".into()));
    }
    if scope.contains('#') {
        return Err(Error::Validation(format!(
            "scope {scope:?} contains reserved character '#'"
        )));
    }
    Ok(())
}

// ---- bounded fan-out ----

/// Outcome of a bounded fan-out: results in task submission order plus
/// one warning per failed task.
#[derive(Debug)]
pub struct Fanout<T> {
    pub results: Vec<T>,
    pub warnings: Vec<String>,
}

/// `ARGUS_FANOUT_WORKERS`, defaulting to 8.
pub fn fanout_workers() -> usize {
    std::env::var("ARGUS_FANOUT_WORKERS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(8)
}

/// Runs `tasks` with at most `workers` in flight at once. Individual
/// failures become warnings; only when every task fails (and at least
/// one ran) does the first failure, in submission order, become the
/// overall error. Dropping the returned future cancels tasks that have
/// not been polled yet.
pub async fn run_bounded<T, F>(
    label: &'static str,
    tasks: Vec<(String, F)>,
    workers: usize,
) -> anyhow::Result<Fanout<T>>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let mut done: Vec<(usize, String, anyhow::Result<T>)> = stream::iter(
        tasks
            .into_iter()
            .enumerate()
            .map(|(idx, (name, fut))| async move { (idx, name, fut.await) }),
    )
    .buffer_unordered(workers.max(1))
    .collect()
    .await;
    done.sort_by_key(|(idx, _, _)| *idx);

    let total = done.len();
    let mut results = Vec::with_capacity(total);
    let mut warnings = Vec::new();
    let mut first_err: Option<anyhow::Error> = None;
    for (_, name, outcome) in done {
        match outcome {
            Ok(value) => results.push(value),
            Err(e) => {
                warn!(target = label, task = %name, error = %e, "fanout: task failed");
                warnings.push(format!("{name}: {e:#}"));
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    if !warnings.is_empty() {
        metrics::counter!("fanout_task_failures_total", warnings.len() as u64, "target" => label);
    }
    if results.is_empty() {
        if let Some(e) = first_err {
            return Err(e);
        }
    }
    Ok(Fanout { results, warnings })
}

// ---- tests ----
