//! kubelab public API façade (in-process).
//!
//! [`LabApi`] is what front ends depend on. [`Orchestrator`] is the in-process
//! implementation: it derives the workload identity, validates the cluster
//! connection, reconciles the workload, waits for the pod and hands it to the
//! port-forward supervisor, reporting every phase as [`DeploymentProgress`].

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures::StreamExt;
use kubelab_apply::{JupyterManifests, ManifestBuilder};
use kubelab_core::{
    ChannelSink, DeploymentPhase, DeploymentProgress, DeploymentStatus, ForwardTarget, LabConfig, LabError, LabResult,
    PortForwardState, ProgressReporter, ProgressSink, WorkloadIdentity,
};
use kubelab_kubehub::{ClusterApi, ClusterConnector, ExplicitNamespace, KubeConnector, NamespaceResolver, RetryError, RetryPolicy};
use kubelab_ops::{wait_for_ready, KubeTunnel, PortForwardSupervisor, ReconcileStep, Reconciler, SupervisorConfig, TunnelLauncher, WaitOptions};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Orchestrator tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Local port to forward from; `0` picks a free one.
    pub local_port: u16,
    pub remote_port: u16,
    pub wait: WaitOptions,
    pub retry: RetryPolicy,
    pub terminating_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_port: kubelab_core::JUPYTER_PORT,
            remote_port: kubelab_core::JUPYTER_PORT,
            wait: WaitOptions::default(),
            retry: RetryPolicy::default(),
            terminating_grace: Duration::from_secs(10),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            local_port: kubelab_core::env_or("LAB_LOCAL_PORT", kubelab_core::JUPYTER_PORT),
            remote_port: kubelab_core::env_or("LAB_REMOTE_PORT", kubelab_core::JUPYTER_PORT),
            wait: WaitOptions::from_env(),
            retry: RetryPolicy::from_env(),
            terminating_grace: kubelab_core::env_secs("LAB_TERMINATING_GRACE_SECS", 10),
        }
    }
}

/// Result of a successful deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    pub identity: WorkloadIdentity,
    pub namespace: String,
    pub pod_name: String,
    pub url: String,
    /// An existing ready workload was reused as-is.
    pub reused: bool,
}

/// Public surface used by front ends.
#[async_trait::async_trait]
pub trait LabApi: Send + Sync {
    /// Run a full deployment, pushing progress to `sink`. Rejected with
    /// `InProgress` while another deployment runs on this instance.
    async fn deploy(&self, config: &LabConfig, sink: Arc<dyn ProgressSink>) -> LabResult<DeployOutcome>;

    /// Cancel the in-flight deployment, if any. Returns whether one was running.
    async fn cancel(&self) -> bool;

    fn port_forward_status(&self) -> PortForwardState;

    /// Stop forwarding to `identity` and delete its controller and service.
    async fn cleanup(&self, identity: &WorkloadIdentity) -> LabResult<bool>;

    async fn status(&self, config: &LabConfig) -> LabResult<DeploymentStatus>;

    async fn stop_port_forward(&self);
}

/// Cluster handle remembered from the last successful connection.
#[derive(Clone)]
struct ClusterSession {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
}

#[derive(Default)]
struct Session {
    deploying: bool,
    cancel: Option<CancellationToken>,
    identities: HashMap<PathBuf, WorkloadIdentity>,
    cluster: Option<ClusterSession>,
}

/// Clears the deploying flag however the deployment ends.
struct DeployGuard<'a> {
    session: &'a Mutex<Session>,
}

impl Drop for DeployGuard<'_> {
    fn drop(&mut self) {
        let mut s = self.session.lock().unwrap_or_else(|p| p.into_inner());
        s.deploying = false;
        s.cancel = None;
    }
}

/// What a failed deployment leaves behind for teardown.
struct Located {
    session: ClusterSession,
    identity: WorkloadIdentity,
}

pub struct Orchestrator {
    connector: Arc<dyn ClusterConnector>,
    builder: Arc<dyn ManifestBuilder>,
    resolver: Arc<dyn NamespaceResolver>,
    supervisor: PortForwardSupervisor,
    settings: Settings,
    session: Mutex<Session>,
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn ClusterConnector>, launcher: Arc<dyn TunnelLauncher>) -> Self {
        Self {
            connector,
            builder: Arc::new(JupyterManifests),
            resolver: Arc::new(ExplicitNamespace),
            supervisor: PortForwardSupervisor::new(launcher, SupervisorConfig::from_env()),
            settings: Settings::from_env(),
            session: Mutex::new(Session::default()),
        }
    }

    /// kube-rs connector, in-process tunnel, env-driven tunables.
    pub fn with_defaults() -> Self { Self::new(Arc::new(KubeConnector::default()), Arc::new(KubeTunnel::new())) }

    pub fn with_builder(mut self, builder: Arc<dyn ManifestBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn NamespaceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the supervisor, so call before any deployment.
    pub fn with_supervisor(mut self, launcher: Arc<dyn TunnelLauncher>, cfg: SupervisorConfig) -> Self {
        self.supervisor = PortForwardSupervisor::new(launcher, cfg);
        self
    }

    pub fn supervisor(&self) -> &PortForwardSupervisor { &self.supervisor }

    fn lock(&self) -> MutexGuard<'_, Session> { self.session.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Identity for the config's credential, cached per path for this session.
    pub fn identity_for(&self, config: &LabConfig) -> LabResult<WorkloadIdentity> {
        let path = config.credential_path()?.to_path_buf();
        if let Some(id) = self.lock().identities.get(&path) {
            return Ok(id.clone());
        }
        let id = WorkloadIdentity::compute(&path)?;
        debug!(path = %path.display(), identity = %id, "identity: derived");
        self.lock().identities.insert(path, id.clone());
        Ok(id)
    }

    /// Resolve the namespace, connect and check access, retrying
    /// connection-class failures. The result becomes the session cluster.
    pub async fn connect(&self, config: &LabConfig, cancel: &CancellationToken) -> LabResult<(Arc<dyn ClusterApi>, String)> {
        let namespace = self.resolver.resolve(config).await?;
        let credential = config.credential_path()?;
        let connector = self.connector.clone();
        let ns = namespace.as_str();
        let res = self
            .settings
            .retry
            .run("connect", cancel, || {
                let connector = connector.clone();
                async move {
                    let cluster = connector.connect(credential).await?;
                    cluster.check_access(ns).await?;
                    Ok(cluster)
                }
            })
            .await;
        let cluster = match res {
            Ok(c) => c,
            Err(RetryError::Cancelled) => return Err(LabError::Cancelled),
            Err(RetryError::Cluster(e)) => return Err(e.into()),
        };
        info!(ns = %namespace, "connected to cluster");
        self.lock().cluster = Some(ClusterSession { cluster: cluster.clone(), namespace: namespace.clone() });
        Ok((cluster, namespace))
    }

    fn reconciler(&self, cluster: Arc<dyn ClusterApi>, namespace: &str) -> Reconciler {
        Reconciler::new(cluster, self.builder.clone(), namespace).with_terminating_grace(self.settings.terminating_grace)
    }

    fn begin_deploy(&self) -> LabResult<(DeployGuard<'_>, CancellationToken)> {
        let mut s = self.lock();
        if s.deploying {
            return Err(LabError::InProgress("deployment".into()));
        }
        let token = CancellationToken::new();
        s.deploying = true;
        s.cancel = Some(token.clone());
        Ok((DeployGuard { session: &self.session }, token))
    }

    async fn run_deploy(
        &self,
        config: &LabConfig,
        cancel: &CancellationToken,
        progress: &mut ProgressReporter,
        located: &mut Option<Located>,
    ) -> LabResult<DeployOutcome> {
        progress.phase(DeploymentPhase::Initializing, "Preparing deployment");
        config.validate()?;
        let identity = self.identity_for(config)?;

        progress.phase(DeploymentPhase::ValidatingConnection, "Validating cluster connection");
        let (cluster, namespace) = self.connect(config, cancel).await?;

        let reconciler = self.reconciler(cluster.clone(), &namespace);
        let session = ClusterSession { cluster: cluster.clone(), namespace: namespace.clone() };
        let reconcile = reconciler.reconcile_with(config, &identity, cancel, |step| match step {
            ReconcileStep::BuildingManifests => progress.phase(DeploymentPhase::CreatingManifests, "Creating Kubernetes manifests"),
            ReconcileStep::ApplyingManifests { count } => {
                // partially submitted manifests still need teardown
                *located = Some(Located { session: session.clone(), identity: identity.clone() });
                progress.phase(DeploymentPhase::ApplyingManifests, format!("Applying {} resources", count))
            }
            ReconcileStep::Applied(report) => {
                debug!(created = report.created.len(), existing = report.existing.len(), "deploy: manifests applied")
            }
        });
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LabError::Cancelled),
            r = reconcile => r?,
        };
        *located = Some(Located { session, identity: identity.clone() });
        progress.set_pod(outcome.pod_name.clone());

        let reused = outcome.existing && outcome.ready;
        if !reused {
            let msg = if outcome.existing { "Waiting for existing pod" } else { "Waiting for pod" };
            progress.phase(DeploymentPhase::WaitingForPod, msg);
            wait_for_ready(cluster.as_ref(), &namespace, &outcome.pod_name, self.settings.wait, cancel, |pod| progress.pod_update(pod))
                .await?;
        }
        progress.phase(DeploymentPhase::PodReady, if reused { "Reusing running pod" } else { "Pod is ready" });

        progress.phase(DeploymentPhase::SettingUpAccess, "Starting port-forward");
        let target = ForwardTarget::new(&namespace, &outcome.pod_name, self.settings.local_port, self.settings.remote_port);
        let url = tokio::select! {
            _ = cancel.cancelled() => return Err(LabError::Cancelled),
            r = self.supervisor.start(cluster.clone(), target) => r?,
        };
        Ok(DeployOutcome { identity, namespace, pod_name: outcome.pod_name, url, reused })
    }

    /// Teardown after a failed or cancelled deployment; errors are only logged.
    async fn teardown_quietly(&self, located: Located) {
        let reconciler = self.reconciler(located.session.cluster, &located.session.namespace);
        match reconciler.teardown(&located.identity).await {
            Ok(existed) => info!(identity = %located.identity, existed, "deploy: cleaned up after failure"),
            Err(e) => warn!(identity = %located.identity, error = %e, "deploy: cleanup after failure failed"),
        }
    }

    /// Run [`LabApi::deploy`] in the background and expose its progress as a stream.
    pub fn deploy_stream(self: &Arc<Self>, config: LabConfig) -> DeployStream {
        let (tx, mut rx) = mpsc::unbounded_channel::<DeploymentProgress>();
        let this = self.clone();
        let result = tokio::spawn(async move { this.deploy(&config, Arc::new(ChannelSink(tx))).await });
        let events = async_stream::stream! {
            while let Some(ev) = rx.recv().await {
                yield ev;
            }
        }
        .boxed();
        DeployStream { events, result, api: self.clone() }
    }
}

/// Progress of a background deployment. The stream ends after the terminal event.
pub struct DeployStream {
    pub events: BoxStream<'static, DeploymentProgress>,
    pub result: JoinHandle<LabResult<DeployOutcome>>,
    api: Arc<Orchestrator>,
}

impl DeployStream {
    pub async fn cancel(&self) -> bool { self.api.cancel().await }
}

#[async_trait::async_trait]
impl LabApi for Orchestrator {
    async fn deploy(&self, config: &LabConfig, sink: Arc<dyn ProgressSink>) -> LabResult<DeployOutcome> {
        let (_guard, cancel) = self.begin_deploy()?;
        counter!("deploy_attempts", 1u64);
        let t0 = Instant::now();
        let mut progress = ProgressReporter::new(sink);
        info!(attempt = %progress.attempt_id(), "deploy: start");
        let mut located = None;
        let res = self.run_deploy(config, &cancel, &mut progress, &mut located).await;
        match &res {
            Ok(out) => {
                counter!("deploy_ok", 1u64);
                histogram!("deploy_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(identity = %out.identity, url = %out.url, reused = out.reused, took_ms = %t0.elapsed().as_millis(), "deploy: ready");
                progress.ready(&out.url);
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!("deploy: cancelled");
                } else {
                    counter!("deploy_err", 1u64);
                    warn!(kind = e.kind(), error = %e, "deploy: failed");
                }
                self.supervisor.stop().await;
                if let Some(l) = located {
                    self.teardown_quietly(l).await;
                }
                if e.is_cancelled() {
                    progress.cancelled();
                } else {
                    progress.error(e.to_string());
                }
            }
        }
        res
    }

    async fn cancel(&self) -> bool {
        let token = self.lock().cancel.clone();
        let running = token.is_some();
        if let Some(t) = token {
            info!("deploy: cancel requested");
            t.cancel();
        }
        self.supervisor.stop().await;
        running
    }

    fn port_forward_status(&self) -> PortForwardState { self.supervisor.status() }

    async fn cleanup(&self, identity: &WorkloadIdentity) -> LabResult<bool> {
        let session = self
            .lock()
            .cluster
            .clone()
            .ok_or_else(|| LabError::ConfigInvalid("not connected to a cluster".into()))?;
        let forwarding_here = self
            .supervisor
            .status()
            .active_config
            .map(|a| a.pod_name == identity.pod_name() && a.namespace == session.namespace)
            .unwrap_or(false);
        if forwarding_here {
            self.supervisor.stop().await;
        }
        self.reconciler(session.cluster, &session.namespace).teardown(identity).await
    }

    async fn status(&self, config: &LabConfig) -> LabResult<DeploymentStatus> {
        let identity = self.identity_for(config)?;
        let (cluster, namespace) = self.connect(config, &CancellationToken::new()).await?;
        self.reconciler(cluster, &namespace).status(&identity).await
    }

    async fn stop_port_forward(&self) { self.supervisor.stop().await; }
}
