//! Deterministic combination of N per-cluster snapshots into one
//! multi-cluster view, dispatched by domain.
//!
//! List domains concatenate items in input order and fold counters;
//! the overview domain sums scalar aggregates, re-deriving formatted
//! CPU/memory strings from raw totals ([`quantity`]). Merging is all
//! or nothing: a payload that does not decode as the domain's expected
//! shape fails the whole call.

#![forbid(unsafe_code)]

pub mod quantity;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use argus_core::{payload_checksum, Domain, Error, Result, Snapshot, SnapshotStats};

// ---- payload shapes ----

/// Poll freshness metadata a list builder may attach to its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricsMeta {
    /// Unix ms of the most recent successful poll.
    pub collected_at: i64,
    pub stale: bool,
    #[serde(default)]
    pub last_error: String,
    pub consecutive_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Payload shape shared by every list-oriented domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListPayload {
    pub items: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsMeta>,
}

/// One cluster's slice of the overview aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterContribution {
    pub total_nodes: u64,
    pub total_namespaces: u64,
    pub total_pods: u64,
    pub running_pods: u64,
    pub cpu_usage: String,
    pub memory_usage: String,
    pub cluster_type: String,
    pub cluster_version: String,
}

/// Overview payload. `clusters` maps source cluster id to that
/// cluster's contribution and is always populated on a merged result,
/// so re-merging merged overviews keeps the original breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OverviewPayload {
    pub total_nodes: u64,
    pub total_namespaces: u64,
    pub total_pods: u64,
    pub running_pods: u64,
    pub cpu_usage: String,
    pub memory_usage: String,
    pub cluster_type: String,
    pub cluster_version: String,
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub clusters: BTreeMap<String, ClusterContribution>,
}

impl OverviewPayload {
    fn contribution(&self) -> ClusterContribution {
        ClusterContribution {
            total_nodes: self.total_nodes,
            total_namespaces: self.total_namespaces,
            total_pods: self.total_pods,
            running_pods: self.running_pods,
            cpu_usage: self.cpu_usage.clone(),
            memory_usage: self.memory_usage.clone(),
            cluster_type: self.cluster_type.clone(),
            cluster_version: self.cluster_version.clone(),
        }
    }
}

// ---- strategy dispatch ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Concatenating list merge.
    List,
    /// Scalar-aggregate merge with per-cluster breakdown.
    Overview,
}

/// Closed dispatch table. `None` means the domain cannot be merged.
pub fn strategy_for(domain: Domain) -> Option<MergeStrategy> {
    match domain {
        Domain::Pods
        | Domain::Namespaces
        | Domain::Nodes
        | Domain::Events
        | Domain::Rbac
        | Domain::Storage
        | Domain::HelmReleases => Some(MergeStrategy::List),
        Domain::Overview => Some(MergeStrategy::Overview),
        Domain::Catalog | Domain::AuditLog => None,
    }
}

// ---- merger ----

#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterMerger;

impl ClusterMerger {
    pub fn new() -> Self {
        Self
    }

    /// Combines per-cluster snapshots for one domain. A single input is
    /// returned unchanged; an empty input, an unmergeable domain, an
    /// input built for a different domain, or a payload of the wrong
    /// shape all fail the merge outright.
    pub fn merge(
        &self,
        domain: Domain,
        scope: &str,
        inputs: &[Arc<Snapshot>],
    ) -> Result<Arc<Snapshot>> {
        if inputs.is_empty() {
            return Err(Error::Merge(format!("no {domain} snapshots to merge")));
        }
        let Some(strategy) = strategy_for(domain) else {
            return Err(Error::Merge(format!("domain {domain} has no merge strategy")));
        };
        for snap in inputs {
            if snap.domain != domain {
                return Err(Error::Merge(format!(
                    "cannot merge a {} snapshot into a {domain} view",
                    snap.domain
                )));
            }
        }
        if inputs.len() == 1 {
            return Ok(inputs[0].clone());
        }

        let t0 = std::time::Instant::now();
        let merged = match strategy {
            MergeStrategy::List => merge_list(domain, scope, inputs)?,
            MergeStrategy::Overview => merge_overview(domain, scope, inputs)?,
        };
        metrics::counter!("merge_operations_total", 1u64, "domain" => domain.as_str());
        metrics::histogram!("merge_duration_ms", t0.elapsed().as_millis() as f64, "domain" => domain.as_str());
        debug!(
            domain = %domain,
            scope = %scope,
            inputs = inputs.len(),
            items = merged.stats.item_count,
            "merge: combined"
        );
        Ok(Arc::new(merged))
    }
}

fn merge_list(domain: Domain, scope: &str, inputs: &[Arc<Snapshot>]) -> Result<Snapshot> {
    let mut items = Vec::new();
    let mut meta: Option<MetricsMeta> = None;
    for snap in inputs {
        let payload: ListPayload = decode(domain, "list", &snap.payload)?;
        items.extend(payload.items);
        if let Some(m) = payload.metrics {
            meta = Some(match meta {
                None => m,
                Some(acc) => merge_metrics(acc, m),
            });
        }
    }
    let item_count = items.len();
    let payload = serde_json::to_value(ListPayload { items, metrics: meta })
        .map_err(|e| Error::Merge(format!("re-encoding merged {domain} payload: {e}")))?;
    Ok(combined_snapshot(domain, scope, inputs, payload, item_count))
}

fn merge_overview(domain: Domain, scope: &str, inputs: &[Arc<Snapshot>]) -> Result<Snapshot> {
    let mut decoded = Vec::with_capacity(inputs.len());
    for snap in inputs {
        decoded.push(decode::<OverviewPayload>(domain, "overview", &snap.payload)?);
    }

    let mut out = OverviewPayload::default();
    let mut cpu_millis: u64 = 0;
    let mut memory_bytes: u64 = 0;
    for p in &decoded {
        out.total_nodes += p.total_nodes;
        out.total_namespaces += p.total_namespaces;
        out.total_pods += p.total_pods;
        out.running_pods += p.running_pods;
        cpu_millis += quantity::parse_cpu(&p.cpu_usage)?;
        memory_bytes += quantity::parse_memory(&p.memory_usage)?;
        if p.clusters.is_empty() {
            out.clusters.insert(p.cluster_id.clone(), p.contribution());
        } else {
            // Already-merged input: keep its original breakdown.
            for (id, contribution) in &p.clusters {
                out.clusters.insert(id.clone(), contribution.clone());
            }
        }
    }
    out.cpu_usage = quantity::format_cpu(cpu_millis);
    out.memory_usage = quantity::format_memory(memory_bytes);
    out.cluster_type = collapse(decoded.iter().map(|p| p.cluster_type.as_str()), "Mixed");
    out.cluster_version = collapse(decoded.iter().map(|p| p.cluster_version.as_str()), "Multiple");
    out.cluster_id = collapse(decoded.iter().map(|p| p.cluster_id.as_str()), "Multiple");

    let payload = serde_json::to_value(&out)
        .map_err(|e| Error::Merge(format!("re-encoding merged {domain} payload: {e}")))?;
    Ok(combined_snapshot(domain, scope, inputs, payload, 1))
}

/// Shared value if every input agrees, else the sentinel.
fn collapse<'a>(mut values: impl Iterator<Item = &'a str>, sentinel: &str) -> String {
    let Some(first) = values.next() else {
        return String::new();
    };
    if values.all(|v| v == first) {
        first.to_string()
    } else {
        sentinel.to_string()
    }
}

fn merge_metrics(acc: MetricsMeta, next: MetricsMeta) -> MetricsMeta {
    MetricsMeta {
        collected_at: acc.collected_at.max(next.collected_at),
        stale: acc.stale || next.stale,
        last_error: if acc.last_error.is_empty() { next.last_error } else { acc.last_error },
        consecutive_failures: acc.consecutive_failures.max(next.consecutive_failures),
        success_count: acc.success_count + next.success_count,
        failure_count: acc.failure_count + next.failure_count,
    }
}

fn decode<T: DeserializeOwned>(domain: Domain, expected: &str, payload: &serde_json::Value) -> Result<T> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        Error::Merge(format!("{domain} payload does not match the {expected} shape: {e}"))
    })
}

/// Snapshot-level field combination shared by both strategies.
fn combined_snapshot(
    domain: Domain,
    scope: &str,
    inputs: &[Arc<Snapshot>],
    payload: serde_json::Value,
    item_count: usize,
) -> Snapshot {
    let stats = SnapshotStats {
        item_count,
        total_items: inputs.iter().map(|s| s.stats.total_items).sum(),
        truncated: inputs.iter().any(|s| s.stats.truncated),
        // The merged view is not a paged read; only completeness carries over.
        batch_index: 0,
        batch_size: 0,
        total_batches: 0,
        is_final_batch: inputs
            .iter()
            .all(|s| s.stats.total_batches == 0 || s.stats.is_final_batch),
        warnings: inputs.iter().flat_map(|s| s.stats.warnings.iter().cloned()).collect(),
        build_duration_ms: inputs.iter().map(|s| s.stats.build_duration_ms).max().unwrap_or(0),
        build_started_at_unix: inputs
            .iter()
            .map(|s| s.stats.build_started_at_unix)
            .min()
            .unwrap_or(0),
        time_to_first_row_ms: inputs
            .iter()
            .map(|s| s.stats.time_to_first_row_ms)
            .max()
            .unwrap_or(0),
    };
    let checksum = payload_checksum(&payload);
    Snapshot {
        domain,
        scope: scope.to_string(),
        version: inputs.iter().map(|s| s.version).max().unwrap_or(0),
        sequence: inputs.iter().map(|s| s.sequence).max().unwrap_or(0),
        generated_at: inputs.iter().map(|s| s.generated_at).max().unwrap_or(0),
        checksum,
        payload,
        stats,
    }
}

// ---- tests ----
