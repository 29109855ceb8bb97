//! Cluster reconciler: create, reuse, wait for, or recreate the workload.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kubelab_apply::{submit_all, ManifestBuilder, SubmitReport};
use kubelab_core::{ClusterError, DeploymentStatus, LabConfig, LabError, LabResult, WorkloadIdentity};
use kubelab_kubehub::ClusterApi;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub pod_name: String,
    /// Manifests were submitted by this call.
    pub created: bool,
    /// The controller was already there.
    pub existing: bool,
    /// Existing pod is already Running and ready.
    pub ready: bool,
}

/// Progress callbacks while creating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileStep {
    BuildingManifests,
    ApplyingManifests { count: usize },
    Applied(SubmitReport),
}

/// Drop `fut` as soon as `cancel` fires.
async fn or_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T, ClusterError>>) -> LabResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LabError::Cancelled),
        r = fut => r.map_err(LabError::from),
    }
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    builder: Arc<dyn ManifestBuilder>,
    namespace: String,
    terminating_grace: Duration,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, builder: Arc<dyn ManifestBuilder>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            builder,
            namespace: namespace.into(),
            terminating_grace: kubelab_core::env_secs("LAB_TERMINATING_GRACE_SECS", 10),
        }
    }

    pub fn with_terminating_grace(mut self, grace: Duration) -> Self {
        self.terminating_grace = grace;
        self
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    pub async fn reconcile(&self, config: &LabConfig, identity: &WorkloadIdentity, cancel: &CancellationToken) -> LabResult<ReconcileOutcome> {
        self.reconcile_with(config, identity, cancel, |_| {}).await
    }

    /// Converge on one controller named `identity`.
    ///
    /// Absent → build and submit manifests (409s are fine). Present and not
    /// terminating → reuse, reporting whether the pod is ready. Terminating →
    /// wait the grace period once; still there is `StuckTerminating`.
    pub async fn reconcile_with<F>(
        &self,
        config: &LabConfig,
        identity: &WorkloadIdentity,
        cancel: &CancellationToken,
        mut on_step: F,
    ) -> LabResult<ReconcileOutcome>
    where
        F: FnMut(ReconcileStep) + Send,
    {
        let ns = self.namespace.as_str();
        let pod_name = identity.pod_name();

        let mut controller = or_cancelled(cancel, self.cluster.get_controller(ns, identity.as_str())).await?;
        if controller.as_ref().map(|c| c.deleting).unwrap_or(false) {
            info!(ns = %ns, name = %identity, grace_s = self.terminating_grace.as_secs(), "reconcile: controller terminating, waiting");
            tokio::select! {
                _ = cancel.cancelled() => return Err(LabError::Cancelled),
                _ = tokio::time::sleep(self.terminating_grace) => {}
            }
            controller = or_cancelled(cancel, self.cluster.get_controller(ns, identity.as_str())).await?;
            if controller.is_some() {
                return Err(LabError::StuckTerminating { name: identity.to_string() });
            }
        }

        if controller.is_some() {
            let ready = match or_cancelled(cancel, self.cluster.pod_status(ns, &pod_name)).await? {
                Some(p) => p.is_ready(),
                None => false,
            };
            info!(ns = %ns, name = %identity, ready, "reconcile: reusing existing workload");
            return Ok(ReconcileOutcome { pod_name, created: false, existing: true, ready });
        }

        on_step(ReconcileStep::BuildingManifests);
        let resources = self.builder.build(config, identity)?;
        on_step(ReconcileStep::ApplyingManifests { count: resources.len() });
        let report = submit_all(self.cluster.as_ref(), ns, &resources, cancel).await?;
        info!(ns = %ns, name = %identity, created = report.created.len(), existing = report.existing.len(), "reconcile: manifests applied");
        on_step(ReconcileStep::Applied(report));
        Ok(ReconcileOutcome { pod_name, created: true, existing: false, ready: false })
    }

    pub async fn status(&self, identity: &WorkloadIdentity) -> LabResult<DeploymentStatus> {
        let ns = self.namespace.as_str();
        let controller = self.cluster.get_controller(ns, identity.as_str()).await?;
        let pod = match &controller {
            Some(_) => self.cluster.pod_status(ns, &identity.pod_name()).await?,
            None => None,
        };
        Ok(DeploymentStatus::from_parts(controller.as_ref(), pod.as_ref()))
    }

    /// Delete the controller and its service. ConfigMap and Secret stay for
    /// inspection. Returns whether the controller existed.
    pub async fn teardown(&self, identity: &WorkloadIdentity) -> LabResult<bool> {
        let ns = self.namespace.as_str();
        let controller = self.cluster.delete_controller(ns, identity.as_str()).await;
        let service = self.cluster.delete_service(ns, &identity.service_name()).await;
        match (controller, service) {
            (Ok(existed), Ok(_)) => {
                info!(ns = %ns, name = %identity, existed, "teardown: done");
                Ok(existed)
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(ns = %ns, name = %identity, error = %e, "teardown: failed");
                Err(e.into())
            }
        }
    }
}
