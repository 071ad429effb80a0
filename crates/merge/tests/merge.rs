#![forbid(unsafe_code)]

use std::sync::Arc;

use argus_core::{payload_checksum, Domain, Error, Snapshot};
use argus_merge::{ClusterMerger, ListPayload, MetricsMeta, OverviewPayload};
use serde_json::json;

fn list_snapshot(
    domain: Domain,
    sequence: u64,
    version: u64,
    names: &[&str],
    metrics: Option<MetricsMeta>,
) -> Arc<Snapshot> {
    let payload = ListPayload {
        items: names.iter().map(|n| json!({ "name": n })).collect(),
        metrics,
    };
    let mut snap = Snapshot::new(domain, "all", serde_json::to_value(payload).unwrap());
    snap.version = version;
    snap.sequence = sequence;
    snap.generated_at = 1_000 + sequence as i64;
    snap.stats.item_count = names.len();
    snap.stats.total_items = names.len();
    snap.stats.build_duration_ms = 10 * sequence;
    snap.stats.build_started_at_unix = 500 + sequence as i64;
    Arc::new(snap)
}

fn overview_snapshot(cluster_id: &str, payload: OverviewPayload) -> Arc<Snapshot> {
    let payload = OverviewPayload { cluster_id: cluster_id.to_string(), ..payload };
    let mut snap = Snapshot::new(Domain::Overview, "all", serde_json::to_value(payload).unwrap());
    snap.version = 1;
    snap.sequence = 1;
    snap.stats.item_count = 1;
    snap.stats.total_items = 1;
    Arc::new(snap)
}

#[test]
fn list_merge_concatenates_in_input_order() {
    let merger = ClusterMerger::new();
    let a = list_snapshot(Domain::Pods, 4, 100, &["a-0", "a-1"], None);
    let b = list_snapshot(Domain::Pods, 9, 250, &["b-0"], None);

    let merged = merger.merge(Domain::Pods, "all", &[a, b]).unwrap();
    let payload: ListPayload = serde_json::from_value(merged.payload.clone()).unwrap();
    let names: Vec<&str> = payload.items.iter().map(|i| i["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["a-0", "a-1", "b-0"]);
    assert_eq!(merged.stats.item_count, 3);
    assert_eq!(merged.stats.total_items, 3);
    assert_eq!(merged.version, 250);
    assert_eq!(merged.sequence, 9);
    assert_eq!(merged.checksum, payload_checksum(&merged.payload));
}

#[test]
fn permutations_agree_on_every_numeric_total() {
    let merger = ClusterMerger::new();
    let a = list_snapshot(Domain::Nodes, 2, 10, &["n1"], None);
    let b = list_snapshot(Domain::Nodes, 7, 90, &["n2", "n3"], None);
    let c = list_snapshot(Domain::Nodes, 5, 40, &["n4"], None);

    let one = merger.merge(Domain::Nodes, "all", &[a.clone(), b.clone(), c.clone()]).unwrap();
    let two = merger.merge(Domain::Nodes, "all", &[c, a, b]).unwrap();

    assert_eq!(one.version, two.version);
    assert_eq!(one.sequence, two.sequence);
    assert_eq!(one.generated_at, two.generated_at);
    assert_eq!(one.stats.item_count, two.stats.item_count);
    assert_eq!(one.stats.total_items, two.stats.total_items);
    assert_eq!(one.stats.truncated, two.stats.truncated);
    assert_eq!(one.stats.build_duration_ms, two.stats.build_duration_ms);
    assert_eq!(one.stats.build_started_at_unix, two.stats.build_started_at_unix);
}

#[test]
fn truncation_and_warnings_carry_through() {
    let merger = ClusterMerger::new();
    let mut a = list_snapshot(Domain::Events, 1, 1, &["e1"], None);
    Arc::get_mut(&mut a).unwrap().stats.warnings = vec!["east: events capped".into()];
    let mut b = list_snapshot(Domain::Events, 2, 2, &["e2"], None);
    {
        let b = Arc::get_mut(&mut b).unwrap();
        b.stats.truncated = true;
        b.stats.warnings = vec!["west: slow poll".into()];
    }

    let merged = merger.merge(Domain::Events, "all", &[a, b]).unwrap();
    assert!(merged.stats.truncated);
    assert_eq!(
        merged.stats.warnings,
        vec!["east: events capped".to_string(), "west: slow poll".to_string()]
    );
}

#[test]
fn metrics_meta_merges_across_clusters() {
    let merger = ClusterMerger::new();
    let a = list_snapshot(
        Domain::Pods,
        1,
        1,
        &["p1"],
        Some(MetricsMeta {
            collected_at: 1_000,
            stale: false,
            last_error: String::new(),
            consecutive_failures: 0,
            success_count: 50,
            failure_count: 1,
        }),
    );
    let b = list_snapshot(
        Domain::Pods,
        2,
        2,
        &["p2"],
        Some(MetricsMeta {
            collected_at: 2_000,
            stale: true,
            last_error: "metrics-server 503".into(),
            consecutive_failures: 2,
            success_count: 30,
            failure_count: 4,
        }),
    );

    let merged = merger.merge(Domain::Pods, "all", &[a, b]).unwrap();
    let payload: ListPayload = serde_json::from_value(merged.payload.clone()).unwrap();
    let meta = payload.metrics.unwrap();
    assert_eq!(meta.collected_at, 2_000);
    assert!(meta.stale, "one stale source taints the whole");
    assert_eq!(meta.last_error, "metrics-server 503");
    assert_eq!(meta.consecutive_failures, 2);
    assert_eq!(meta.success_count, 80);
    assert_eq!(meta.failure_count, 5);
}

#[test]
fn overview_sums_and_reformats_quantities() {
    let merger = ClusterMerger::new();
    let east = overview_snapshot(
        "east",
        OverviewPayload {
            total_nodes: 2,
            total_pods: 40,
            running_pods: 38,
            cpu_usage: "150m".into(),
            memory_usage: "1Gi".into(),
            cluster_type: "EKS".into(),
            cluster_version: "1.29".into(),
            ..Default::default()
        },
    );
    let west = overview_snapshot(
        "west",
        OverviewPayload {
            total_nodes: 1,
            total_pods: 10,
            running_pods: 9,
            cpu_usage: "100m".into(),
            memory_usage: "512Mi".into(),
            cluster_type: "EKS".into(),
            cluster_version: "1.29".into(),
            ..Default::default()
        },
    );

    let merged = merger.merge(Domain::Overview, "all", &[east, west]).unwrap();
    let payload: OverviewPayload = serde_json::from_value(merged.payload.clone()).unwrap();
    assert_eq!(payload.total_nodes, 3);
    assert_eq!(payload.total_pods, 50);
    assert_eq!(payload.running_pods, 47);
    assert_eq!(payload.cpu_usage, "250m");
    assert_eq!(payload.memory_usage, "1536Mi");
    assert_eq!(payload.cluster_type, "EKS", "agreeing inputs keep their value");
    assert_eq!(payload.cluster_version, "1.29");
    assert_eq!(payload.clusters.len(), 2);
    assert_eq!(payload.clusters["east"].total_nodes, 2);
    assert_eq!(payload.clusters["west"].cpu_usage, "100m");
}

#[test]
fn disagreeing_categoricals_collapse_to_sentinels() {
    let merger = ClusterMerger::new();
    let east = overview_snapshot(
        "east",
        OverviewPayload {
            cluster_type: "EKS".into(),
            cluster_version: "1.29".into(),
            ..Default::default()
        },
    );
    let west = overview_snapshot(
        "west",
        OverviewPayload {
            cluster_type: "GKE".into(),
            cluster_version: "1.30".into(),
            ..Default::default()
        },
    );

    let merged = merger.merge(Domain::Overview, "all", &[east, west]).unwrap();
    let payload: OverviewPayload = serde_json::from_value(merged.payload.clone()).unwrap();
    assert_eq!(payload.cluster_type, "Mixed");
    assert_eq!(payload.cluster_version, "Multiple");
    assert_eq!(payload.cluster_id, "Multiple");
}

#[test]
fn remerging_a_merged_overview_keeps_the_breakdown() {
    let merger = ClusterMerger::new();
    let east = overview_snapshot(
        "east",
        OverviewPayload { total_nodes: 2, cpu_usage: "100m".into(), ..Default::default() },
    );
    let west = overview_snapshot(
        "west",
        OverviewPayload { total_nodes: 1, cpu_usage: "100m".into(), ..Default::default() },
    );
    let first = merger.merge(Domain::Overview, "all", &[east, west]).unwrap();

    let south = overview_snapshot(
        "south",
        OverviewPayload { total_nodes: 4, cpu_usage: "50m".into(), ..Default::default() },
    );
    let second = merger.merge(Domain::Overview, "all", &[first, south]).unwrap();
    let payload: OverviewPayload = serde_json::from_value(second.payload.clone()).unwrap();
    assert_eq!(payload.total_nodes, 7);
    assert_eq!(payload.cpu_usage, "250m");
    let ids: Vec<&str> = payload.clusters.keys().map(String::as_str).collect();
    assert_eq!(ids, vec!["east", "south", "west"]);
}

#[test]
fn single_input_is_returned_unchanged() {
    let merger = ClusterMerger::new();
    let only = list_snapshot(Domain::Rbac, 3, 3, &["role"], None);
    let merged = merger.merge(Domain::Rbac, "all", &[only.clone()]).unwrap();
    assert!(Arc::ptr_eq(&only, &merged));
}

#[test]
fn empty_input_fails() {
    let merger = ClusterMerger::new();
    let err = merger.merge(Domain::Pods, "all", &[]).unwrap_err();
    assert!(matches!(err, Error::Merge(_)), "got {err:?}");
}

#[test]
fn unmergeable_domains_fail() {
    let merger = ClusterMerger::new();
    let snap = list_snapshot(Domain::Catalog, 1, 1, &["x"], None);
    let err = merger.merge(Domain::Catalog, "all", &[snap.clone(), snap]).unwrap_err();
    assert!(matches!(err, Error::Merge(_)), "got {err:?}");
}

#[test]
fn input_for_another_domain_fails() {
    let merger = ClusterMerger::new();
    let pods = list_snapshot(Domain::Pods, 1, 1, &["p"], None);
    let nodes = list_snapshot(Domain::Nodes, 2, 2, &["n"], None);
    let err = merger.merge(Domain::Pods, "all", &[pods, nodes]).unwrap_err();
    assert!(matches!(err, Error::Merge(_)), "got {err:?}");
}

#[test]
fn wrong_payload_shape_fails_the_whole_merge() {
    let merger = ClusterMerger::new();
    let overview = overview_snapshot("east", OverviewPayload::default());
    let mut as_pods = Snapshot::new(Domain::Pods, "all", overview.payload.clone());
    as_pods.sequence = 1;
    let other = list_snapshot(Domain::Pods, 2, 2, &["p"], None);

    let err = merger.merge(Domain::Pods, "all", &[Arc::new(as_pods), other]).unwrap_err();
    match err {
        Error::Merge(msg) => assert!(msg.contains("does not match"), "{msg}"),
        other => panic!("expected merge error, got {other:?}"),
    }
}
