use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use kubelab_api::{LabApi, Orchestrator, Settings};
use kubelab_core::{
    ClusterError, ControllerInfo, DeploymentPhase, DeploymentProgress, ForwardStatus, LabConfig, LabError, PodPhase, PodSnapshot,
    ProgressSink, WorkloadIdentity,
};
use kubelab_kubehub::fake::{pod_in, ready_pod, FakeCluster, FakeConnector, WatchEnd, WatchScript};
use kubelab_kubehub::{ClusterApi, ClusterConnector, PodWatch, PortConnection, ResourceObject, RetryPolicy};
use kubelab_ops::{KubeTunnel, SupervisorConfig, WaitOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const NS: &str = "lab";

struct Harness {
    _credential: tempfile::NamedTempFile,
    config: LabConfig,
    identity: WorkloadIdentity,
    fake: FakeCluster,
    connector: FakeConnector,
    orch: Arc<Orchestrator>,
}

fn orchestrator(connector: Arc<dyn ClusterConnector>) -> Orchestrator {
    let settings = Settings {
        local_port: 0,
        remote_port: 8888,
        wait: WaitOptions { timeout: Duration::from_secs(3), retry_delay: Duration::from_millis(10) },
        retry: RetryPolicy { max_retries: 3, base: Duration::from_millis(1) },
        terminating_grace: Duration::from_millis(20),
    };
    let supervisor = SupervisorConfig {
        restart_delay: Duration::from_millis(10),
        restart_step: Duration::ZERO,
        startup_timeout: Duration::from_secs(2),
        ..SupervisorConfig::default()
    };
    Orchestrator::new(connector, Arc::new(KubeTunnel::new()))
        .with_settings(settings)
        .with_supervisor(Arc::new(KubeTunnel::new()), supervisor)
}

fn harness() -> Harness {
    let mut credential = tempfile::NamedTempFile::new().unwrap();
    credential.write_all(b"apiVersion: v1\nkind: Config\ncurrent-context: test\n").unwrap();
    let config = LabConfig { credential_path: Some(credential.path().to_path_buf()), namespace: Some(NS.into()), ..Default::default() };
    let identity = WorkloadIdentity::compute(credential.path()).unwrap();
    let fake = FakeCluster::new();
    let connector = FakeConnector::new(fake.clone());
    let orch = orchestrator(Arc::new(connector.clone()));
    Harness { _credential: credential, config, identity, fake, connector, orch: Arc::new(orch) }
}

fn recorder() -> (Arc<Mutex<Vec<DeploymentProgress>>>, Arc<dyn ProgressSink>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let e = events.clone();
    let sink: Arc<dyn ProgressSink> = Arc::new(move |p: DeploymentProgress| e.lock().unwrap().push(p));
    (events, sink)
}

fn phases(events: &[DeploymentProgress]) -> Vec<DeploymentPhase> {
    let mut out: Vec<DeploymentPhase> = Vec::new();
    for e in events {
        if out.last() != Some(&e.phase) {
            out.push(e.phase);
        }
    }
    out
}

fn assert_monotonic(events: &[DeploymentProgress]) {
    let first = &events[0].attempt_id;
    let mut last = 0u8;
    for e in events {
        assert_eq!(&e.attempt_id, first);
        assert!(e.progress_percent >= last, "{} after {}", e.progress_percent, last);
        last = e.progress_percent;
    }
}

#[tokio::test]
async fn fresh_deployment_reaches_ready_with_working_tunnel() {
    let h = harness();
    let pod = h.identity.pod_name();
    h.fake.set_pod_on_create(pod_in(&pod, PodPhase::Pending));
    h.fake.push_watch(
        WatchScript::new(WatchEnd::Hang)
            .applied(Duration::ZERO, pod_in(&pod, PodPhase::Pending))
            .applied(Duration::from_millis(5), pod_in(&pod, PodPhase::Running))
            .applied(Duration::from_millis(5), ready_pod(&pod)),
    );
    let (events, sink) = recorder();
    let out = h.orch.deploy(&h.config, sink).await.expect("deploy");
    assert!(!out.reused);
    assert_eq!(out.pod_name, pod);
    assert!(out.url.starts_with("http://localhost:"), "{}", out.url);

    let events = events.lock().unwrap().clone();
    assert_eq!(
        phases(&events),
        vec![
            DeploymentPhase::Initializing,
            DeploymentPhase::ValidatingConnection,
            DeploymentPhase::CreatingManifests,
            DeploymentPhase::ApplyingManifests,
            DeploymentPhase::WaitingForPod,
            DeploymentPhase::PodReady,
            DeploymentPhase::SettingUpAccess,
            DeploymentPhase::Ready,
        ]
    );
    assert_monotonic(&events);
    let last = events.last().unwrap();
    assert_eq!(last.progress_percent, 100);
    assert_eq!(last.url.as_deref(), Some(out.url.as_str()));

    let port: u16 = out.url.rsplit(':').next().unwrap().parse().unwrap();
    let mut sock = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    sock.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    sock.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    assert_eq!(h.orch.port_forward_status().status, ForwardStatus::Running);

    let st = h.orch.status(&h.config).await.unwrap();
    assert!(st.exists && st.ready);

    assert!(h.orch.cleanup(&h.identity).await.unwrap());
    assert_eq!(h.orch.port_forward_status().status, ForwardStatus::Stopped);
    assert!(!h.fake.has_controller(NS, h.identity.as_str()));
}

#[tokio::test]
async fn ready_workload_is_reused_without_applying() {
    let h = harness();
    h.fake.put_controller(NS, ControllerInfo { name: h.identity.to_string(), deleting: false, ready_replicas: 1 });
    h.fake.put_pod(NS, ready_pod(&h.identity.pod_name()));
    let (events, sink) = recorder();
    let out = h.orch.deploy(&h.config, sink).await.expect("deploy");
    assert!(out.reused);
    assert!(h.fake.created().is_empty());
    assert_eq!(h.fake.watch_calls(), 0);
    let events = events.lock().unwrap().clone();
    assert_eq!(
        phases(&events),
        vec![
            DeploymentPhase::Initializing,
            DeploymentPhase::ValidatingConnection,
            DeploymentPhase::PodReady,
            DeploymentPhase::SettingUpAccess,
            DeploymentPhase::Ready,
        ]
    );
    h.orch.stop_port_forward().await;
}

#[tokio::test]
async fn unreachable_cluster_is_retried_then_reported() {
    let h = harness();
    h.connector.fail_with(ClusterError::Connection("dial tcp 10.0.0.1:6443: connection refused".into()));
    let (events, sink) = recorder();
    let err = h.orch.deploy(&h.config, sink).await.unwrap_err();
    assert!(matches!(err, LabError::Connection(_)), "got {:?}", err);
    let events = events.lock().unwrap().clone();
    let last = events.last().unwrap();
    assert_eq!(last.phase, DeploymentPhase::Error);
    assert!(last.error.as_deref().unwrap_or_default().contains("connection refused"));
    assert!(h.fake.deleted().is_empty());
    assert!(h.fake.created().is_empty());
}

#[tokio::test]
async fn forbidden_namespace_is_an_auth_error() {
    let h = harness();
    h.fake.push_access_error(ClusterError::Forbidden("statefulsets.apps is forbidden".into()));
    let (_events, sink) = recorder();
    let err = h.orch.deploy(&h.config, sink).await.unwrap_err();
    assert_eq!(err.kind(), "auth");
}

#[tokio::test]
async fn failed_pod_tears_down_workload() {
    let h = harness();
    let pod = h.identity.pod_name();
    h.fake.set_pod_on_create(pod_in(&pod, PodPhase::Pending));
    let mut failed = pod_in(&pod, PodPhase::Failed);
    failed.message = "OOMKilled".into();
    h.fake.push_watch(
        WatchScript::new(WatchEnd::Hang)
            .applied(Duration::ZERO, pod_in(&pod, PodPhase::Pending))
            .applied(Duration::from_millis(5), failed),
    );
    let (events, sink) = recorder();
    let err = h.orch.deploy(&h.config, sink).await.unwrap_err();
    assert_eq!(err.kind(), "pod_failed");
    assert!(err.to_string().contains("OOMKilled"), "{}", err);
    let events = events.lock().unwrap().clone();
    let last = events.last().unwrap();
    assert_eq!(last.phase, DeploymentPhase::Error);
    assert!(last.message.contains("OOMKilled"), "{}", last.message);
    assert!(last.error.as_deref().unwrap_or_default().contains("OOMKilled"));
    assert_monotonic(&events);
    let deleted = h.fake.deleted();
    assert!(deleted.contains(&format!("StatefulSet/{}", h.identity)));
    assert!(deleted.contains(&format!("Service/{}", h.identity)));
    assert_eq!(h.orch.port_forward_status().status, ForwardStatus::Stopped);
}

#[tokio::test]
async fn stuck_terminating_controller_is_reported() {
    let h = harness();
    h.fake.put_controller(NS, ControllerInfo { name: h.identity.to_string(), deleting: true, ready_replicas: 0 });
    let (_events, sink) = recorder();
    let err = h.orch.deploy(&h.config, sink).await.unwrap_err();
    assert!(matches!(err, LabError::StuckTerminating { .. }));
    assert!(h.fake.deleted().is_empty());
}

#[tokio::test]
async fn missing_namespace_fails_validation() {
    let h = harness();
    let config = LabConfig { namespace: None, ..h.config.clone() };
    let (_events, sink) = recorder();
    let err = h.orch.deploy(&config, sink).await.unwrap_err();
    assert_eq!(err.kind(), "config_invalid");
}

#[tokio::test]
async fn cancel_while_waiting_rejects_concurrent_deploy_and_cleans_up() {
    let h = harness();
    let pod = h.identity.pod_name();
    h.fake.set_pod_on_create(pod_in(&pod, PodPhase::Pending));
    h.fake.push_watch(WatchScript::new(WatchEnd::Hang).applied(Duration::ZERO, pod_in(&pod, PodPhase::Pending)));

    let mut stream = h.orch.deploy_stream(h.config.clone());
    let mut seen = Vec::new();
    while let Some(ev) = tokio::time::timeout(Duration::from_secs(3), stream.events.next()).await.expect("event") {
        let waiting = ev.phase == DeploymentPhase::WaitingForPod;
        seen.push(ev);
        if waiting {
            break;
        }
    }

    let (_events, sink) = recorder();
    let err = h.orch.deploy(&h.config, sink).await.unwrap_err();
    assert_eq!(err.kind(), "in_progress");

    assert!(stream.cancel().await);
    while let Some(ev) = stream.events.next().await {
        seen.push(ev);
    }
    let result = stream.result.await.unwrap();
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(seen.last().unwrap().phase, DeploymentPhase::Cancelled);
    assert_monotonic(&seen);
    assert!(h.fake.deleted().contains(&format!("StatefulSet/{}", h.identity)));

    // the guard is released
    h.fake.push_watch(WatchScript::new(WatchEnd::Hang).applied(Duration::ZERO, ready_pod(&pod)));
    let (_events, sink) = recorder();
    h.orch.deploy(&h.config, sink).await.expect("redeploy");
    h.orch.stop_port_forward().await;
}

/// Cluster whose creates hang for a while before reaching the fake.
#[derive(Clone)]
struct SlowCreates {
    inner: FakeCluster,
    delay: Duration,
}

#[async_trait::async_trait]
impl ClusterApi for SlowCreates {
    async fn check_access(&self, namespace: &str) -> Result<(), ClusterError> { self.inner.check_access(namespace).await }

    async fn get_controller(&self, namespace: &str, name: &str) -> Result<Option<ControllerInfo>, ClusterError> {
        self.inner.get_controller(namespace, name).await
    }

    async fn pod_status(&self, namespace: &str, pod: &str) -> Result<Option<PodSnapshot>, ClusterError> {
        self.inner.pod_status(namespace, pod).await
    }

    async fn watch_pod(&self, namespace: &str, pod: &str) -> Result<PodWatch, ClusterError> { self.inner.watch_pod(namespace, pod).await }

    async fn create(&self, namespace: &str, resource: &ResourceObject) -> Result<(), ClusterError> {
        tokio::time::sleep(self.delay).await;
        self.inner.create(namespace, resource).await
    }

    async fn delete_controller(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.inner.delete_controller(namespace, name).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.inner.delete_service(namespace, name).await
    }

    async fn open_port_stream(&self, namespace: &str, pod: &str, port: u16) -> Result<PortConnection, ClusterError> {
        self.inner.open_port_stream(namespace, pod, port).await
    }
}

#[async_trait::async_trait]
impl ClusterConnector for SlowCreates {
    async fn connect(&self, _credential_path: &Path) -> Result<Arc<dyn ClusterApi>, ClusterError> { Ok(Arc::new(self.clone())) }
}

#[tokio::test]
async fn cancel_during_apply_aborts_pending_creates() {
    let h = harness();
    let slow = SlowCreates { inner: h.fake.clone(), delay: Duration::from_secs(3) };
    let orch = Arc::new(orchestrator(Arc::new(slow)));

    let mut stream = orch.deploy_stream(h.config.clone());
    let mut before = Vec::new();
    while let Some(ev) = tokio::time::timeout(Duration::from_secs(3), stream.events.next()).await.expect("event") {
        let applying = ev.phase == DeploymentPhase::ApplyingManifests;
        before.push(ev);
        if applying {
            break;
        }
    }

    let t0 = Instant::now();
    assert!(stream.cancel().await);
    let mut after = Vec::new();
    while let Some(ev) = tokio::time::timeout(Duration::from_secs(2), stream.events.next()).await.expect("terminal event in time") {
        after.push(ev);
    }
    assert!(t0.elapsed() < Duration::from_millis(500), "cancel took {:?}", t0.elapsed());
    assert_eq!(phases(&after), vec![DeploymentPhase::Cancelled]);
    assert!(stream.result.await.unwrap().unwrap_err().is_cancelled());
    assert!(h.fake.created().is_empty());
    assert!(!h.fake.has_controller(NS, h.identity.as_str()));
}
