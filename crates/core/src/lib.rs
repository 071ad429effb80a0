//! Argus core types: the snapshot model, domain registry, presence
//! tri-state, and the error taxonomy shared by every other crate.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named category of cluster state with one registered builder.
///
/// The set is closed on purpose: merge strategies and permission policies
/// dispatch on it with exhaustive matches, so adding a domain forces every
/// dispatch site to take a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    Pods,
    Namespaces,
    Nodes,
    Events,
    Rbac,
    Storage,
    HelmReleases,
    Overview,
    Catalog,
    AuditLog,
}

impl Domain {
    pub const ALL: [Domain; 10] = [
        Domain::Pods,
        Domain::Namespaces,
        Domain::Nodes,
        Domain::Events,
        Domain::Rbac,
        Domain::Storage,
        Domain::HelmReleases,
        Domain::Overview,
        Domain::Catalog,
        Domain::AuditLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Pods => "pods",
            Domain::Namespaces => "namespaces",
            Domain::Nodes => "nodes",
            Domain::Events => "events",
            Domain::Rbac => "rbac",
            Domain::Storage => "storage",
            Domain::HelmReleases => "helm-releases",
            Domain::Overview => "overview",
            Domain::Catalog => "catalog",
            Domain::AuditLog => "audit-log",
        }
    }

    /// Placeholder domains are reserved names that never serve data; the
    /// build service denies them before consulting any checker.
    pub fn is_placeholder(&self) -> bool {
        match self {
            Domain::AuditLog => true,
            Domain::Pods
            | Domain::Namespaces
            | Domain::Nodes
            | Domain::Events
            | Domain::Rbac
            | Domain::Storage
            | Domain::HelmReleases
            | Domain::Overview
            | Domain::Catalog => false,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown domain: {s}")))
    }
}

/// Namespace workload presence as a three-valued answer. `Unknown` means
/// the incremental tracker cannot vouch for its counts and the caller must
/// fall back to an authoritative listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Absent,
    Unknown,
}

impl Presence {
    pub fn is_known(&self) -> bool {
        !matches!(self, Presence::Unknown)
    }

    pub fn has_workloads(&self) -> bool {
        matches!(self, Presence::Present)
    }
}

/// The versioned unit of data exchanged between the build service, cache,
/// merger, and subscribers. Immutable once handed to a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub domain: Domain,
    pub scope: String,
    /// Derived by the builder from the max resource version / creation
    /// time observed; non-decreasing per (domain, scope) when upstream
    /// behaves.
    pub version: u64,
    /// Process-wide, strictly increasing, assigned exactly once per
    /// successful build.
    pub sequence: u64,
    /// Unix milliseconds at stamping time.
    pub generated_at: i64,
    pub checksum: String,
    /// Domain-defined; the core never interprets it.
    pub payload: serde_json::Value,
    pub stats: SnapshotStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub item_count: usize,
    pub total_items: usize,
    pub truncated: bool,
    pub batch_index: usize,
    pub batch_size: usize,
    pub total_batches: usize,
    pub is_final_batch: bool,
    pub warnings: Vec<String>,
    pub build_duration_ms: u64,
    pub build_started_at_unix: i64,
    /// 0 means the builder did not report a value of its own.
    pub time_to_first_row_ms: u64,
}

impl Snapshot {
    pub fn new(domain: Domain, scope: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            domain,
            scope: scope.into(),
            version: 0,
            sequence: 0,
            generated_at: 0,
            checksum: String::new(),
            payload,
            stats: SnapshotStats::default(),
        }
    }

    /// A snapshot may enter the TTL cache only when it is a complete view:
    /// untruncated, and either unbatched or carrying the final batch.
    pub fn cacheable(&self) -> bool {
        !self.stats.truncated && (self.stats.total_batches == 0 || self.stats.is_final_batch)
    }

    pub fn cache_key(domain: Domain, scope: &str) -> String {
        format!("{}:{}", domain.as_str(), scope)
    }
}

/// Checksum of a payload: blake3 over its canonical JSON bytes. Pure in
/// the payload; two equal payloads always hash identically.
pub fn payload_checksum(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Errors suitable for transport and for status-code mapping by an outer
/// HTTP layer. Cloneable so deduplicated concurrent callers can share one
/// failure.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),
    #[error("permission denied for {domain}: requires access to {resource}")]
    PermissionDenied { domain: Domain, resource: String },
    #[error("upstream: {0}")]
    Upstream(String),
    #[error("merge: {0}")]
    Merge(String),
    #[error("stream transport: {0}")]
    StreamTransport(String),
}

impl Error {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use super::{payload_checksum, Domain, Error, Presence, Result, Snapshot, SnapshotStats};
}
