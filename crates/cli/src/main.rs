use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use argus_core::{Domain, Presence, Snapshot};
use argus_kubelink::AccessReviewChecker;
use argus_merge::ClusterMerger;
use argus_presence::WorkloadTracker;
use argus_service::{fanout_workers, gate, run_bounded};
use argus_stream::http::{router, StreamState};
use argus_stream::{
    CancelHandle, CatalogProvider, HealthStatus, QueryOptions, QueryResult, ReadinessSubscription,
    ReadinessUpdate,
};

#[derive(Parser, Debug)]
#[command(name = "argusctl", version, about = "Argus diagnostics CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report workload presence for one or more namespaces
    Presence {
        /// Namespaces to query
        #[arg(required = true)]
        namespaces: Vec<String>,
    },
    /// Probe per-domain access for the current user via SelfSubjectAccessReview
    Access {
        /// Restrict to a single domain, e.g. "pods" or "helm-releases"
        #[arg(long = "domain")]
        domain: Option<String>,
    },
    /// Merge snapshot JSON files from several clusters into one view
    Merge {
        /// Snapshot files, one per cluster
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Serve the catalog stream endpoint over HTTP
    Serve {
        /// Listen address
        #[arg(long = "addr", default_value = "127.0.0.1:8086")]
        addr: String,
        /// JSON file with an array of catalog items to serve
        #[arg(long = "fixture")]
        fixture: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("ARGUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARGUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARGUS_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Presence { namespaces } => {
            info!(count = namespaces.len(), "presence invoked");
            let client = kube::Client::try_default().await.context("connecting kube client")?;
            let tracker = Arc::new(WorkloadTracker::new());
            let feeds = argus_kubelink::spawn_presence_feeds(client, Arc::clone(&tracker));

            let wait_secs = std::env::var("ARGUS_WAIT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(8);
            if !tracker.sync_gate().wait_for_sync(Duration::from_secs(wait_secs)).await {
                warn!(wait_secs, "presence feeds not fully synced; answers may be unknown");
            }

            match cli.output {
                Output::Human => {
                    println!("NAMESPACE            PRESENCE   TRACKED");
                    for ns in &namespaces {
                        let tracked = tracker
                            .tracked_total(ns)
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<20} {:<10} {}",
                            ns,
                            render_presence(tracker.presence(ns)),
                            tracked
                        );
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> {
                        namespace: &'a str,
                        presence: Presence,
                        tracked: Option<usize>,
                    }
                    let rows: Vec<_> = namespaces
                        .iter()
                        .map(|ns| Row {
                            namespace: ns,
                            presence: tracker.presence(ns),
                            tracked: tracker.tracked_total(ns),
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }

            for feed in feeds {
                feed.abort();
            }
        }
        Commands::Access { domain } => {
            let domains: Vec<Domain> = match domain.as_deref() {
                Some(s) => vec![s.parse::<Domain>()?],
                None => Domain::ALL.to_vec(),
            };
            info!(count = domains.len(), "access probes starting");
            let checker = AccessReviewChecker::connect().await?;

            let tasks: Vec<_> = domains
                .iter()
                .map(|d| {
                    let d = *d;
                    let checker = &checker;
                    (d.as_str().to_string(), async move {
                        Ok::<_, anyhow::Error>((d, gate::authorize(d, checker).await))
                    })
                })
                .collect();
            let fanout = run_bounded("access", tasks, fanout_workers()).await?;

            match cli.output {
                Output::Human => {
                    println!("DOMAIN           ACCESS    DETAIL");
                    for (d, outcome) in &fanout.results {
                        match outcome {
                            Ok(()) => println!("{:<16} allowed", d),
                            Err(e) if e.is_permission_denied() => {
                                println!("{:<16} denied    {}", d, e)
                            }
                            Err(e) => println!("{:<16} error     {}", d, e),
                        }
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> {
                        domain: Domain,
                        allowed: bool,
                        #[serde(skip_serializing_if = "Option::is_none")]
                        error: Option<&'a argus_core::Error>,
                    }
                    let rows: Vec<_> = fanout
                        .results
                        .iter()
                        .map(|(d, outcome)| Row {
                            domain: *d,
                            allowed: outcome.is_ok(),
                            error: outcome.as_ref().err(),
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Merge { files } => {
            info!(count = files.len(), "merge invoked");
            let mut inputs = Vec::with_capacity(files.len());
            for path in &files {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let snap: Snapshot = serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                inputs.push(Arc::new(snap));
            }
            let domain = inputs[0].domain;
            let scope = inputs[0].scope.clone();
            let merged = ClusterMerger::new().merge(domain, &scope, &inputs)?;

            match cli.output {
                Output::Human => {
                    println!("domain: {}", merged.domain);
                    println!("scope: {}", merged.scope);
                    println!("version: {}", merged.version);
                    println!("sequence: {}", merged.sequence);
                    println!("items: {}", merged.stats.total_items);
                    println!("truncated: {}", merged.stats.truncated);
                    if merged.stats.warnings.is_empty() {
                        println!("warnings: (none)");
                    } else {
                        println!("warnings: {}", merged.stats.warnings.join("; "));
                    }
                }
                Output::Json => {
                    println!("{}", serde_json::to_string_pretty(merged.as_ref())?);
                }
            }
        }
        Commands::Serve { addr, fixture } => {
            let state = match fixture {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let items: Vec<serde_json::Value> = serde_json::from_str(&text)
                        .with_context(|| format!("parsing {}", path.display()))?;
                    info!(count = items.len(), path = %path.display(), "serving catalog fixture");
                    StreamState::new(Arc::new(FixtureCatalog::new(items)))
                }
                None => {
                    warn!("no fixture given; catalog endpoint will answer 503");
                    StreamState::unavailable()
                }
            };
            let app = router(state);
            let sock: std::net::SocketAddr =
                addr.parse().with_context(|| format!("invalid listen address {addr:?}"))?;
            let listener = tokio::net::TcpListener::bind(sock).await?;
            info!(addr = %sock, "catalog stream listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = signal::ctrl_c().await;
                })
                .await?;
            info!("server stopped");
        }
    }

    Ok(())
}

fn render_presence(p: Presence) -> &'static str {
    match p {
        Presence::Present => "present",
        Presence::Absent => "absent",
        Presence::Unknown => "unknown",
    }
}

/// Catalog source backed by a static fixture: the index is ready from
/// the start and each connection gets exactly one readiness signal.
struct FixtureCatalog {
    items: Vec<serde_json::Value>,
}

impl FixtureCatalog {
    fn new(items: Vec<serde_json::Value>) -> Self {
        Self { items }
    }
}

#[async_trait::async_trait]
impl CatalogProvider for FixtureCatalog {
    async fn query(&self, opts: &QueryOptions) -> Result<QueryResult> {
        let matching: Vec<serde_json::Value> = self
            .items
            .iter()
            .filter(|item| opts.query.is_empty() || item.to_string().contains(&opts.query))
            .cloned()
            .collect();
        let total = matching.len();
        let start = opts.offset.min(total);
        let end = match opts.limit {
            Some(limit) => (start + limit).min(total),
            None => total,
        };
        let items = matching[start..end].to_vec();
        let continue_token = if end < total { Some(end.to_string()) } else { None };
        Ok(QueryResult { items, total, continue_token, warnings: Vec::new() })
    }

    fn health(&self) -> HealthStatus {
        HealthStatus::default()
    }

    fn caches_ready(&self) -> bool {
        true
    }

    fn subscribe_streaming(&self) -> ReadinessSubscription {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let _ = tx.send(ReadinessUpdate { ready: true }).await;
            std::future::pending::<()>().await;
        });
        ReadinessSubscription { rx, cancel: CancelHandle::from_task(task) }
    }

    fn first_batch_latency(&self) -> Duration {
        Duration::ZERO
    }
}
