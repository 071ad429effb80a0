//! Push streaming over the object catalog.
//!
//! A connection gets an immediate first frame (`reset = true`) built
//! from its filter, before the backing index is necessarily warm. Every
//! readiness signal from the provider then triggers a recomputed
//! incremental frame (`reset = false`). Frames carry a paginated view;
//! the finality rules live in [`paginate`] and are deliberately layered:
//! an unhealthy source forces the page final (resuming a broken partial
//! read is unsafe), a caller-requested finalize forces it final, cold
//! caches force it non-final even when the page looks complete, and only
//! then does the continuation token decide.

#![forbid(unsafe_code)]

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use argus_core::{Error, Result, SnapshotStats};

/// Forced-final failure count when `ARGUS_STREAM_FAILURE_THRESHOLD` is unset.
const MAX_SOURCE_FAILURES: u32 = 3;

fn failure_threshold() -> u32 {
    std::env::var("ARGUS_STREAM_FAILURE_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(MAX_SOURCE_FAILURES)
}

// ---- provider contract ----

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub query: String,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// The requested page, already sliced by the provider.
    pub items: Vec<serde_json::Value>,
    /// Total matching items across all pages.
    pub total: usize,
    /// Cursor for the next page, when one exists.
    pub continue_token: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Ok,
    Degraded,
    Errored,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub state: HealthState,
    pub stale: bool,
    pub consecutive_failures: u32,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self { state: HealthState::Ok, stale: false, consecutive_failures: 0 }
    }
}

impl HealthStatus {
    /// A source in this state cannot be trusted to resume a partial read.
    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy_at(failure_threshold())
    }

    fn unhealthy_at(&self, threshold: u32) -> bool {
        !matches!(self.state, HealthState::Ok)
            || self.stale
            || self.consecutive_failures >= threshold
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessUpdate {
    pub ready: bool,
}

/// Cancellation handle that aborts the underlying task, on explicit
/// cancel or on drop. A lost handle can never leak its task.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }

    /// Handle with nothing to abort, for providers without a feed task.
    pub fn noop() -> Self {
        Self { task: None }
    }

    /// Wraps a spawned feed task so cancelling aborts it.
    pub fn from_task(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Readiness-signal subscription handed out by a provider.
pub struct ReadinessSubscription {
    pub rx: mpsc::Receiver<ReadinessUpdate>,
    pub cancel: CancelHandle,
}

/// The indexed catalog source, consumed through its public surface only.
#[async_trait::async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn query(&self, opts: &QueryOptions) -> anyhow::Result<QueryResult>;
    fn health(&self) -> HealthStatus;
    fn caches_ready(&self) -> bool;
    fn subscribe_streaming(&self) -> ReadinessSubscription;
    /// Time the index took to serve its first batch, surfaced in stats.
    fn first_batch_latency(&self) -> Duration;
}

// ---- filter ----

/// Parsed connection filter. Raw form is a query string:
/// `q=<term>&limit=<n>&offset=<n>&final=<bool>&stream=<bool>`.
/// Values are taken verbatim (no percent-decoding); unknown keys and
/// malformed values are validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFilter {
    pub query: String,
    /// Page size. `None` (absent or non-positive) means everything.
    pub limit: Option<usize>,
    pub offset: usize,
    /// Caller asks for this read to be treated as finalizing.
    pub finalize: bool,
    /// `stream=0` turns the connection into a one-shot snapshot.
    pub streaming: bool,
}

impl Default for StreamFilter {
    fn default() -> Self {
        Self { query: String::new(), limit: None, offset: 0, finalize: false, streaming: true }
    }
}

impl StreamFilter {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut filter = StreamFilter::default();
        for pair in raw.split('&') {
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::Validation(format!(
                    "filter segment {pair:?} is not key=value"
                )));
            };
            match key {
                "q" => filter.query = value.to_string(),
                "limit" => {
                    let n: i64 = value.parse().map_err(|_| {
                        Error::Validation(format!("limit {value:?} is not an integer"))
                    })?;
                    filter.limit = if n > 0 { Some(n as usize) } else { None };
                }
                "offset" => {
                    filter.offset = value.parse().map_err(|_| {
                        Error::Validation(format!("offset {value:?} is not a non-negative integer"))
                    })?;
                }
                "final" => filter.finalize = parse_bool(key, value)?,
                "stream" => filter.streaming = parse_bool(key, value)?,
                other => {
                    return Err(Error::Validation(format!("unknown filter key {other:?}")));
                }
            }
        }
        Ok(filter)
    }

    /// Finalize applies when asked for explicitly or when streaming is
    /// off, since no later frame will ever complete the view.
    pub fn caller_finalize(&self) -> bool {
        self.finalize || !self.streaming
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(Error::Validation(format!("{key} {other:?} is not a boolean"))),
    }
}

// ---- pagination ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub effective_limit: usize,
    pub batch_index: usize,
    pub total_batches: usize,
    pub is_final: bool,
}

pub struct PageInputs<'a> {
    pub total_items: usize,
    pub limit: Option<usize>,
    pub offset: usize,
    pub continue_token: Option<&'a str>,
    pub health: &'a HealthStatus,
    pub caller_finalize: bool,
    pub caches_ready: bool,
}

/// Computes the page window. The finality layers apply strictly in
/// order: unhealthy source (token discarded), caller finalize, warming
/// caches, then the natural token/empty rule.
pub fn paginate(inputs: PageInputs<'_>) -> PageWindow {
    let effective_limit = inputs
        .limit
        .filter(|n| *n > 0)
        .unwrap_or(inputs.total_items)
        .max(1);
    let batch_index = inputs.offset / effective_limit;
    let total_batches = (inputs.total_items + effective_limit - 1) / effective_limit;

    let natural_final = inputs.continue_token.is_none() || inputs.total_items == 0;
    let is_final = if inputs.health.is_unhealthy() {
        true
    } else if inputs.caller_finalize {
        true
    } else if !inputs.caches_ready {
        false
    } else {
        natural_final
    };

    PageWindow { effective_limit, batch_index, total_batches, is_final }
}

// ---- wire frames ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    Full,
    Partial,
}

/// One push event as serialized onto the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushFrame {
    pub reset: bool,
    pub ready: bool,
    pub cache_ready: bool,
    pub truncated: bool,
    pub snapshot_mode: SnapshotMode,
    pub snapshot: serde_json::Value,
    pub stats: SnapshotStats,
    pub generated_at: i64,
    pub sequence: u64,
}

/// Live frame feed for one connection.
pub struct FrameStream {
    pub rx: mpsc::Receiver<PushFrame>,
    pub cancel: CancelHandle,
}

/// Opens a connection-scoped stream: immediate reset frame, then one
/// incremental frame per readiness signal. The pump ends, and releases
/// its provider subscription, when the consumer goes away (even while a
/// rebuild is in flight), the signal channel closes, or the handle is
/// cancelled or dropped.
pub fn open_stream(provider: Arc<dyn CatalogProvider>, filter: StreamFilter) -> FrameStream {
    let (tx, rx) = mpsc::channel::<PushFrame>(16);
    metrics::counter!("stream_connections_total", 1u64);

    let task = tokio::spawn(async move {
        let ReadinessSubscription { rx: mut signals, cancel: release } =
            provider.subscribe_streaming();
        let mut sequence: u64 = 0;

        let initial = tokio::select! {
            _ = tx.closed() => {
                release.cancel();
                return;
            }
            built = build_frame(provider.as_ref(), &filter, true, None, &mut sequence) => built,
        };
        match initial {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    release.cancel();
                    return;
                }
                metrics::counter!("stream_frames_total", 1u64, "kind" => "reset");
            }
            Err(e) => {
                warn!(error = %e, "stream: initial frame failed");
                release.cancel();
                return;
            }
        }

        if !filter.streaming {
            debug!("stream: one-shot connection served");
            release.cancel();
            return;
        }

        loop {
            let update = tokio::select! {
                _ = tx.closed() => break,
                update = signals.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            let built = tokio::select! {
                _ = tx.closed() => break,
                built = build_frame(provider.as_ref(), &filter, false, Some(update.ready), &mut sequence) => built,
            };
            match built {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                    metrics::counter!("stream_frames_total", 1u64, "kind" => "update");
                }
                Err(e) => {
                    // The next signal may find the source recovered.
                    metrics::counter!("stream_rebuild_failures_total", 1u64);
                    warn!(error = %e, "stream: frame rebuild failed");
                }
            }
        }
        release.cancel();
    });

    FrameStream { rx, cancel: CancelHandle::from_task(task) }
}

async fn build_frame(
    provider: &dyn CatalogProvider,
    filter: &StreamFilter,
    reset: bool,
    signaled_ready: Option<bool>,
    sequence: &mut u64,
) -> Result<PushFrame> {
    let health = provider.health();
    let caches_ready = provider.caches_ready();
    let opts = QueryOptions {
        query: filter.query.clone(),
        limit: filter.limit,
        offset: filter.offset,
    };
    let result = provider
        .query(&opts)
        .await
        .map_err(|e| Error::Upstream(format!("catalog query failed: {e:#}")))?;

    let window = paginate(PageInputs {
        total_items: result.total,
        limit: filter.limit,
        offset: filter.offset,
        continue_token: result.continue_token.as_deref(),
        health: &health,
        caller_finalize: filter.caller_finalize(),
        caches_ready,
    });
    let truncated = result.items.len() < result.total;
    let ready = signaled_ready.unwrap_or(caches_ready) && window.is_final;
    let snapshot_mode = if window.is_final && !truncated {
        SnapshotMode::Full
    } else {
        SnapshotMode::Partial
    };

    *sequence += 1;
    let stats = SnapshotStats {
        item_count: result.items.len(),
        total_items: result.total,
        truncated,
        batch_index: window.batch_index,
        batch_size: window.effective_limit,
        total_batches: window.total_batches,
        is_final_batch: window.is_final,
        warnings: result.warnings,
        time_to_first_row_ms: provider.first_batch_latency().as_millis() as u64,
        ..Default::default()
    };
    Ok(PushFrame {
        reset,
        ready,
        cache_ready: caches_ready,
        truncated,
        snapshot_mode,
        snapshot: serde_json::json!({ "items": result.items }),
        stats,
        generated_at: chrono::Utc::now().timestamp_millis(),
        sequence: *sequence,
    })
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_from_empty_query() {
        let f = StreamFilter::parse("").unwrap();
        assert_eq!(f, StreamFilter::default());
        assert!(f.streaming);
        assert!(!f.caller_finalize());
    }

    #[test]
    fn filter_parses_every_key() {
        let f = StreamFilter::parse("q=nginx&limit=50&offset=100&final=1&stream=true").unwrap();
        assert_eq!(f.query, "nginx");
        assert_eq!(f.limit, Some(50));
        assert_eq!(f.offset, 100);
        assert!(f.finalize);
        assert!(f.streaming);
    }

    #[test]
    fn non_positive_limit_means_unbounded() {
        assert_eq!(StreamFilter::parse("limit=0").unwrap().limit, None);
        assert_eq!(StreamFilter::parse("limit=-5").unwrap().limit, None);
    }

    #[test]
    fn stream_off_implies_finalize() {
        let f = StreamFilter::parse("stream=0").unwrap();
        assert!(!f.streaming);
        assert!(f.caller_finalize());
    }

    #[test]
    fn filter_rejects_garbage() {
        assert!(StreamFilter::parse("nginx").is_err());
        assert!(StreamFilter::parse("color=red").is_err());
        assert!(StreamFilter::parse("limit=many").is_err());
        assert!(StreamFilter::parse("offset=-1").is_err());
        assert!(StreamFilter::parse("final=maybe").is_err());
    }

    #[test]
    fn last_duplicate_key_wins() {
        let f = StreamFilter::parse("limit=2&limit=9").unwrap();
        assert_eq!(f.limit, Some(9));
    }

    fn inputs<'a>(health: &'a HealthStatus, token: Option<&'a str>) -> PageInputs<'a> {
        PageInputs {
            total_items: 3,
            limit: Some(2),
            offset: 0,
            continue_token: token,
            health,
            caller_finalize: false,
            caches_ready: true,
        }
    }

    #[test]
    fn token_present_keeps_page_open() {
        let health = HealthStatus::default();
        let w = paginate(inputs(&health, Some("cursor")));
        assert_eq!(w.effective_limit, 2);
        assert_eq!(w.total_batches, 2);
        assert_eq!(w.batch_index, 0);
        assert!(!w.is_final);
    }

    #[test]
    fn no_token_is_naturally_final() {
        let health = HealthStatus::default();
        assert!(paginate(inputs(&health, None)).is_final);
    }

    #[test]
    fn unhealthy_source_forces_final_and_discards_token() {
        for health in [
            HealthStatus { state: HealthState::Degraded, ..Default::default() },
            HealthStatus { state: HealthState::Errored, ..Default::default() },
            HealthStatus { stale: true, ..Default::default() },
            HealthStatus { consecutive_failures: MAX_SOURCE_FAILURES, ..Default::default() },
        ] {
            assert!(paginate(inputs(&health, Some("cursor"))).is_final, "{health:?}");
        }
    }

    #[test]
    fn failures_below_threshold_do_not_force_final() {
        let health =
            HealthStatus { consecutive_failures: MAX_SOURCE_FAILURES - 1, ..Default::default() };
        assert!(!paginate(inputs(&health, Some("cursor"))).is_final);
    }

    #[test]
    fn failure_threshold_gates_the_unhealthy_verdict() {
        let health = HealthStatus { consecutive_failures: 2, ..Default::default() };
        assert!(!health.unhealthy_at(3));
        assert!(health.unhealthy_at(2));
        assert!(health.unhealthy_at(1));
    }

    #[test]
    fn caller_finalize_overrides_token_and_warming() {
        let health = HealthStatus::default();
        let mut inp = inputs(&health, Some("cursor"));
        inp.caller_finalize = true;
        inp.caches_ready = false;
        assert!(paginate(inp).is_final);
    }

    #[test]
    fn warming_caches_force_non_final_even_when_page_looks_complete() {
        let health = HealthStatus::default();
        let mut inp = inputs(&health, None);
        inp.caches_ready = false;
        assert!(!paginate(inp).is_final);
    }

    #[test]
    fn unset_limit_serves_everything_with_floor_one() {
        let health = HealthStatus::default();
        let w = paginate(PageInputs {
            total_items: 0,
            limit: None,
            offset: 0,
            continue_token: None,
            health: &health,
            caller_finalize: false,
            caches_ready: true,
        });
        assert_eq!(w.effective_limit, 1);
        assert_eq!(w.total_batches, 0);
        assert!(w.is_final, "empty result is final");
    }

    #[test]
    fn batch_index_follows_offset() {
        let health = HealthStatus::default();
        let mut inp = inputs(&health, Some("cursor"));
        inp.offset = 2;
        let w = paginate(inp);
        assert_eq!(w.batch_index, 1);
        assert_eq!(w.total_batches, 2);
    }

    #[test]
    fn frame_wire_fields_are_camel_case() {
        let frame = PushFrame {
            reset: true,
            ready: false,
            cache_ready: true,
            truncated: false,
            snapshot_mode: SnapshotMode::Partial,
            snapshot: serde_json::json!({"items": []}),
            stats: SnapshotStats::default(),
            generated_at: 1,
            sequence: 1,
        };
        let v = serde_json::to_value(&frame).unwrap();
        for key in ["reset", "ready", "cacheReady", "truncated", "snapshotMode", "snapshot", "stats", "generatedAt", "sequence"] {
            assert!(v.get(key).is_some(), "missing wire field {key}");
        }
        assert_eq!(v["snapshotMode"], "partial");
    }
}
