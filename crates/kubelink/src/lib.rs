//! Cluster-facing wiring: typed workload watch feeds for the presence
//! tracker, and permission probes backed by SelfSubjectAccessReview.
//!
//! Everything that actually talks to a Kubernetes API server lives
//! here; the core crates only see the `WorkloadTracker` and
//! `PermissionChecker` contracts.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, PostParams},
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use argus_presence::{SyncToken, WorkloadKind, WorkloadTracker};
use argus_service::{Decision, PermissionChecker};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;

// ---- presence feeds ----

/// Starts one cluster-wide watch per workload kind, feeding the
/// tracker. Every feed is registered with the sync gate before any of
/// them runs, so the gate cannot latch while a slow feed is still
/// unregistered.
pub fn spawn_presence_feeds(
    client: Client,
    tracker: Arc<WorkloadTracker>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let gate = tracker.sync_gate();
    let tokens: Vec<SyncToken> = WorkloadKind::ALL
        .iter()
        .map(|kind| gate.register(kind.as_str()))
        .collect();

    let mut handles = Vec::with_capacity(WorkloadKind::ALL.len());
    for (kind, token) in WorkloadKind::ALL.into_iter().zip(tokens) {
        let client = client.clone();
        let tracker = Arc::clone(&tracker);
        handles.push(tokio::spawn(async move {
            match kind {
                WorkloadKind::Deployment => {
                    run_feed(Api::<Deployment>::all(client), kind, tracker, token).await
                }
                WorkloadKind::StatefulSet => {
                    run_feed(Api::<StatefulSet>::all(client), kind, tracker, token).await
                }
                WorkloadKind::DaemonSet => {
                    run_feed(Api::<DaemonSet>::all(client), kind, tracker, token).await
                }
                WorkloadKind::Job => run_feed(Api::<Job>::all(client), kind, tracker, token).await,
                WorkloadKind::CronJob => {
                    run_feed(Api::<CronJob>::all(client), kind, tracker, token).await
                }
                WorkloadKind::Pod => run_feed(Api::<Pod>::all(client), kind, tracker, token).await,
            }
        }));
    }
    handles
}

/// One list+watch loop. Applied/Deleted events map onto tracker adds
/// and deletes; a restart re-lists (re-adds are no-ops for tracked
/// keys) and reports initial sync through the token. Watch errors are
/// retried by the watcher itself, so they are logged and skipped here.
async fn run_feed<K>(api: Api<K>, kind: WorkloadKind, tracker: Arc<WorkloadTracker>, token: SyncToken)
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = %kind, "presence feed started");
    while let Some(step) = stream.next().await {
        match step {
            Ok(Event::Applied(obj)) => {
                if let Some((ns, key)) = object_scope(&obj) {
                    tracker.handle_add(kind, &ns, &key);
                }
            }
            Ok(Event::Deleted(obj)) => {
                if let Some((ns, key)) = object_scope(&obj) {
                    tracker.handle_delete(kind, &ns, &key);
                }
            }
            Ok(Event::Restarted(list)) => {
                debug!(kind = %kind, count = list.len(), "presence feed restart");
                for obj in list.iter() {
                    if let Some((ns, key)) = object_scope(obj) {
                        tracker.handle_add(kind, &ns, &key);
                    }
                }
                token.mark_synced();
            }
            Err(err) => {
                warn!(kind = %kind, error = %err, "presence feed watch error");
                metrics::counter!("presence_feed_errors_total", 1u64, "kind" => kind.as_str());
            }
        }
    }
    warn!(kind = %kind, "presence feed stream ended");
}

/// `(namespace, namespace/name)` for a watched object. All six kinds
/// are namespaced; an object without a namespace is malformed and gets
/// skipped rather than polluting the map.
fn object_scope<K: ResourceExt>(obj: &K) -> Option<(String, String)> {
    let namespace = obj.namespace()?;
    let key = format!("{}/{}", namespace, obj.name_any());
    Some((namespace, key))
}

// ---- access probes ----

/// `PermissionChecker` that asks the connected cluster directly via
/// SelfSubjectAccessReview, one review per `(group, resource, verb)`.
pub struct AccessReviewChecker {
    client: Client,
}

impl AccessReviewChecker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects with the ambient kubeconfig or in-cluster config.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("connecting kube client")?;
        Ok(Self::new(client))
    }
}

#[async_trait::async_trait]
impl PermissionChecker for AccessReviewChecker {
    async fn can(&self, group: &str, resource: &str, verb: &str) -> Result<Decision> {
        use k8s_openapi::api::authorization::v1::{
            ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
        };
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let ra = ResourceAttributes {
            group: if group.is_empty() { None } else { Some(group.to_string()) },
            resource: Some(resource.to_string()),
            verb: Some(verb.to_string()),
            ..Default::default()
        };
        let ssar = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ra),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = api.create(&PostParams::default(), &ssar).await?;
        let allowed = created.status.map(|s| s.allowed).unwrap_or(false);
        debug!(group = %group, resource = %resource, verb = %verb, allowed, "access review");
        Ok(Decision { allowed })
    }
}

// ---- tests ----
