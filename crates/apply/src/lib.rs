//! kubelab apply: manifest building, YAML rendering and submission.

#![forbid(unsafe_code)]

use std::time::Instant;

use kubelab_core::{LabConfig, LabError, WorkloadIdentity};
use kubelab_kubehub::{ClusterApi, ResourceObject};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod jupyter;

pub use jupyter::JupyterManifests;

/// Turns a config into the resources to create for a workload.
pub trait ManifestBuilder: Send + Sync {
    fn build(&self, config: &LabConfig, identity: &WorkloadIdentity) -> Result<Vec<ResourceObject>, LabError>;
}

/// Multi-document YAML for inspection (`labctl manifests`).
pub fn render_yaml(resources: &[ResourceObject]) -> Result<String, LabError> {
    let mut out = String::new();
    for r in resources {
        let json = r.to_json().map_err(|e| LabError::Manifest(format!("{}: {}", r, e)))?;
        let doc = serde_yaml::to_string(&json).map_err(|e| LabError::Manifest(format!("{}: {}", r, e)))?;
        out.push_str("---\n");
        out.push_str(&doc);
    }
    Ok(out)
}

/// Outcome of [`submit_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub created: Vec<String>,
    /// Resources that already existed (409); treated as success.
    pub existing: Vec<String>,
}

/// Create every resource in order. A 409 on one resource does not stop the
/// rest; any other error aborts. Cancellation drops the in-flight create.
pub async fn submit_all(
    cluster: &dyn ClusterApi,
    namespace: &str,
    resources: &[ResourceObject],
    cancel: &CancellationToken,
) -> Result<SubmitReport, LabError> {
    let t0 = Instant::now();
    let mut report = SubmitReport::default();
    for r in resources {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(ns = %namespace, resource = %r, submitted = report.created.len(), "apply: cancelled");
                return Err(LabError::Cancelled);
            }
            res = cluster.create(namespace, r) => res,
        };
        match res {
            Ok(()) => {
                info!(ns = %namespace, resource = %r, "apply: created");
                counter!("manifests_applied", 1u64);
                report.created.push(r.to_string());
            }
            Err(e) if e.is_conflict() => {
                warn!(ns = %namespace, resource = %r, "apply: already exists, continuing");
                report.existing.push(r.to_string());
            }
            Err(e) => return Err(e.into()),
        }
    }
    histogram!("manifests_submit_ms", t0.elapsed().as_secs_f64() * 1000.0);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelab_core::ClusterError;
    use kubelab_kubehub::fake::FakeCluster;

    fn id() -> WorkloadIdentity { WorkloadIdentity::from_name("jupyter-aaaaaaaaaaaa") }

    #[test]
    fn yaml_has_one_document_per_resource() {
        let res = JupyterManifests.build(&LabConfig::default(), &id()).unwrap();
        let yaml = render_yaml(&res).unwrap();
        assert_eq!(yaml.matches("---\n").count(), res.len());
        assert!(yaml.contains("kind: StatefulSet"));
        assert!(yaml.contains("name: jupyter-aaaaaaaaaaaa-config"));
    }

    #[tokio::test]
    async fn conflict_does_not_abort_remaining_resources() {
        let fake = FakeCluster::new();
        fake.conflict_on("jupyter-aaaaaaaaaaaa-config");
        let res = JupyterManifests.build(&LabConfig::default(), &id()).unwrap();
        let report = submit_all(&fake, "ns", &res, &CancellationToken::new()).await.expect("submit");
        assert_eq!(report.existing, vec!["ConfigMap/jupyter-aaaaaaaaaaaa-config".to_string()]);
        assert_eq!(report.created.len(), 2);
        assert_eq!(fake.created().len(), 3);
        assert!(fake.has_controller("ns", "jupyter-aaaaaaaaaaaa"));
    }

    #[tokio::test]
    async fn other_errors_abort() {
        let fake = FakeCluster::new();
        fake.fail_creates(ClusterError::Forbidden("configmaps is forbidden".into()));
        let res = JupyterManifests.build(&LabConfig::default(), &id()).unwrap();
        let err = submit_all(&fake, "ns", &res, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "auth");
    }

    #[tokio::test]
    async fn cancelled_token_submits_nothing() {
        let fake = FakeCluster::new();
        let res = JupyterManifests.build(&LabConfig::default(), &id()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = submit_all(&fake, "ns", &res, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(fake.created().is_empty());
    }
}
