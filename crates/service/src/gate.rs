//! Per-domain access requirements and the gate that evaluates them
//! against an injected cluster permission checker.
//!
//! Each snapshot domain maps to a fixed set of Kubernetes resource
//! requirements. Single-resource domains demand every entry (`All`);
//! domains assembled from several resource kinds accept any granted
//! entry (`Any`) so a partial RBAC grant still yields a snapshot.

use argus_core::{Domain, Error, Result};
use smallvec::{smallvec, SmallVec};

/// One `(group, resource, verb)` probe against cluster RBAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequirement {
    pub group: &'static str,
    pub resource: &'static str,
    pub verb: &'static str,
}

impl ResourceRequirement {
    pub const fn new(group: &'static str, resource: &'static str, verb: &'static str) -> Self {
        Self { group, resource, verb }
    }
}

/// How a policy combines its requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementMode {
    /// Every requirement must be granted.
    All,
    /// At least one requirement must be granted.
    Any,
}

/// Access policy for one domain.
#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    pub mode: RequirementMode,
    pub requirements: SmallVec<[ResourceRequirement; 4]>,
    /// Resource name quoted in denial errors.
    pub resource_label: &'static str,
}

/// Outcome of a single requirement probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
}

impl Decision {
    pub const ALLOW: Decision = Decision { allowed: true };
    pub const DENY: Decision = Decision { allowed: false };
}

/// Answers a single `(group, resource, verb)` question for the
/// connected cluster. Implementations live next to the cluster client;
/// tests stub this with a fixed grant table.
#[async_trait::async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn can(&self, group: &str, resource: &str, verb: &str) -> anyhow::Result<Decision>;
}

/// Static requirement table. `None` means the domain is not RBAC-gated
/// (its availability is decided elsewhere, e.g. by provider registration).
pub fn policy_for(domain: Domain) -> Option<PermissionPolicy> {
    let (mode, requirements, resource_label): (
        RequirementMode,
        SmallVec<[ResourceRequirement; 4]>,
        &'static str,
    ) = match domain {
        Domain::Pods => (
            RequirementMode::All,
            smallvec![ResourceRequirement::new("", "pods", "list")],
            "pods",
        ),
        Domain::Namespaces => (
            RequirementMode::All,
            smallvec![ResourceRequirement::new("", "namespaces", "list")],
            "namespaces",
        ),
        Domain::Nodes => (
            RequirementMode::All,
            smallvec![ResourceRequirement::new("", "nodes", "list")],
            "nodes",
        ),
        Domain::Events => (
            RequirementMode::All,
            smallvec![ResourceRequirement::new("", "events", "list")],
            "events",
        ),
        // Role listings degrade gracefully: any granted kind is enough
        // to render a partial table.
        Domain::Rbac => (
            RequirementMode::Any,
            smallvec![
                ResourceRequirement::new("rbac.authorization.k8s.io", "roles", "list"),
                ResourceRequirement::new("rbac.authorization.k8s.io", "rolebindings", "list"),
                ResourceRequirement::new("rbac.authorization.k8s.io", "clusterroles", "list"),
                ResourceRequirement::new("rbac.authorization.k8s.io", "clusterrolebindings", "list"),
            ],
            "roles",
        ),
        Domain::Storage => (
            RequirementMode::Any,
            smallvec![
                ResourceRequirement::new("", "persistentvolumeclaims", "list"),
                ResourceRequirement::new("", "persistentvolumes", "list"),
                ResourceRequirement::new("storage.k8s.io", "storageclasses", "list"),
            ],
            "persistentvolumeclaims",
        ),
        // Helm stores release records in secrets (v3 default) or
        // configmaps (legacy driver).
        Domain::HelmReleases => (
            RequirementMode::Any,
            smallvec![
                ResourceRequirement::new("", "secrets", "list"),
                ResourceRequirement::new("", "configmaps", "list"),
            ],
            "secrets",
        ),
        Domain::Overview => (
            RequirementMode::All,
            smallvec![
                ResourceRequirement::new("", "nodes", "list"),
                ResourceRequirement::new("", "pods", "list"),
            ],
            "nodes",
        ),
        Domain::Catalog => return None,
        Domain::AuditLog => return None,
    };
    Some(PermissionPolicy { mode, requirements, resource_label })
}

/// Evaluates the domain's policy. Placeholder domains are denied before
/// any probe runs; domains without a policy pass. `All` short-circuits
/// on the first denial, `Any` on the first grant. When `Any` finds no
/// grant but some probes failed, the first probe error is returned
/// instead of a denial, since denial was never established.
pub async fn authorize(domain: Domain, checker: &dyn PermissionChecker) -> Result<()> {
    if domain.is_placeholder() {
        return Err(Error::PermissionDenied {
            domain,
            resource: domain.as_str().to_string(),
        });
    }
    let Some(policy) = policy_for(domain) else {
        return Ok(());
    };
    match policy.mode {
        RequirementMode::All => {
            for req in &policy.requirements {
                let decision = checker
                    .can(req.group, req.resource, req.verb)
                    .await
                    .map_err(|e| Error::Upstream(format!("permission probe failed: {e:#}")))?;
                if !decision.allowed {
                    return Err(Error::PermissionDenied {
                        domain,
                        resource: policy.resource_label.to_string(),
                    });
                }
            }
            Ok(())
        }
        RequirementMode::Any => {
            let mut first_err: Option<Error> = None;
            for req in &policy.requirements {
                match checker.can(req.group, req.resource, req.verb).await {
                    Ok(decision) if decision.allowed => return Ok(()),
                    Ok(_) => {}
                    Err(e) => {
                        if first_err.is_none() {
                            first_err =
                                Some(Error::Upstream(format!("permission probe failed: {e:#}")));
                        }
                    }
                }
            }
            Err(first_err.unwrap_or_else(|| Error::PermissionDenied {
                domain,
                resource: policy.resource_label.to_string(),
            }))
        }
    }
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct TableChecker {
        granted: BTreeSet<(&'static str, &'static str)>,
        fail_on: Option<(&'static str, &'static str)>,
    }

    impl TableChecker {
        fn granting(pairs: &[(&'static str, &'static str)]) -> Self {
            Self { granted: pairs.iter().copied().collect(), fail_on: None }
        }
    }

    #[async_trait::async_trait]
    impl PermissionChecker for TableChecker {
        async fn can(&self, group: &str, resource: &str, _verb: &str) -> anyhow::Result<Decision> {
            if let Some((g, r)) = self.fail_on {
                if g == group && r == resource {
                    anyhow::bail!("api unreachable");
                }
            }
            let hit = self
                .granted
                .iter()
                .any(|(g, r)| *g == group && *r == resource);
            Ok(if hit { Decision::ALLOW } else { Decision::DENY })
        }
    }

    #[tokio::test]
    async fn all_mode_denies_when_one_requirement_missing() {
        // Overview needs nodes and pods.
        let checker = TableChecker::granting(&[("", "nodes")]);
        let err = authorize(Domain::Overview, &checker).await.unwrap_err();
        assert!(err.is_permission_denied(), "got {err:?}");
    }

    #[tokio::test]
    async fn all_mode_passes_with_every_grant() {
        let checker = TableChecker::granting(&[("", "nodes"), ("", "pods")]);
        authorize(Domain::Overview, &checker).await.unwrap();
    }

    #[tokio::test]
    async fn any_mode_passes_with_a_single_grant() {
        let checker = TableChecker::granting(&[("", "configmaps")]);
        authorize(Domain::HelmReleases, &checker).await.unwrap();
    }

    #[tokio::test]
    async fn any_mode_denies_with_no_grants() {
        let checker = TableChecker::granting(&[]);
        let err = authorize(Domain::Storage, &checker).await.unwrap_err();
        match err {
            Error::PermissionDenied { domain, resource } => {
                assert_eq!(domain, Domain::Storage);
                assert_eq!(resource, "persistentvolumeclaims");
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn any_mode_prefers_probe_error_over_denial() {
        let mut checker = TableChecker::granting(&[]);
        checker.fail_on = Some(("", "secrets"));
        let err = authorize(Domain::HelmReleases, &checker).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn placeholder_domain_is_denied_without_probes() {
        struct Panics;
        #[async_trait::async_trait]
        impl PermissionChecker for Panics {
            async fn can(&self, _: &str, _: &str, _: &str) -> anyhow::Result<Decision> {
                panic!("placeholder must not probe");
            }
        }
        let err = authorize(Domain::AuditLog, &Panics).await.unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[test]
    fn every_gated_domain_has_requirements() {
        for domain in Domain::ALL {
            if let Some(policy) = policy_for(domain) {
                assert!(
                    !policy.requirements.is_empty(),
                    "{domain} has an empty policy"
                );
            }
        }
    }
}
