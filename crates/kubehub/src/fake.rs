//! In-memory [`ClusterApi`] for tests and demos.
//!
//! State lives behind a mutex so tests can inspect what was created/deleted
//! and script pod watch sessions (events with delays, then close or hang).

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use kubelab_core::{ClusterError, ControllerInfo, PodEvent, PodSnapshot};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::{ClusterApi, ClusterConnector, PodWatch, PortConnection, ResourceObject};

/// How a scripted watch session ends once its steps are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    /// Server closes the stream.
    Close,
    /// Stream stays open with no further events.
    Hang,
}

#[derive(Debug, Clone)]
pub struct WatchScript {
    pub steps: Vec<(Duration, Result<PodEvent, ClusterError>)>,
    pub end: WatchEnd,
}

impl WatchScript {
    pub fn new(end: WatchEnd) -> Self { Self { steps: Vec::new(), end } }

    /// Emit `pod` as applied after `delay`.
    pub fn applied(mut self, delay: Duration, pod: PodSnapshot) -> Self {
        self.steps.push((delay, Ok(PodEvent::Applied(pod))));
        self
    }

    pub fn error(mut self, delay: Duration, err: ClusterError) -> Self {
        self.steps.push((delay, Err(err)));
        self
    }
}

/// How forwarded port streams behave.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PortBehavior {
    /// Bytes written are echoed back.
    #[default]
    Echo,
    /// Opening the stream fails.
    Refuse(ClusterError),
    /// Stream opens, then the remote reports this error and closes.
    RemoteError(String),
}

#[derive(Default)]
struct FakeState {
    controllers: HashMap<(String, String), ControllerInfo>,
    pods: HashMap<(String, String), PodSnapshot>,
    /// Names returning 409 on create.
    conflicts: HashSet<String>,
    created: Vec<(String, String)>,
    deleted: Vec<String>,
    /// Overrides `get_controller` results in order before falling back to state.
    controller_lookups: VecDeque<Option<ControllerInfo>>,
    /// Pod to materialise when a StatefulSet is created.
    pod_on_create: Option<PodSnapshot>,
    watch_scripts: VecDeque<WatchScript>,
    access_errors: VecDeque<ClusterError>,
    create_error: Option<ClusterError>,
    ports: PortBehavior,
    watch_calls: usize,
    pod_status_calls: usize,
    port_streams_opened: usize,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

fn key(ns: &str, name: &str) -> (String, String) { (ns.to_string(), name.to_string()) }

/// A pod that is Running with all containers ready.
pub fn ready_pod(name: &str) -> PodSnapshot {
    PodSnapshot { name: name.into(), phase: kubelab_core::PodPhase::Running, ready: true, scheduled: true, ..Default::default() }
}

/// A pod with `phase`, scheduled, not ready.
pub fn pod_in(name: &str, phase: kubelab_core::PodPhase) -> PodSnapshot {
    PodSnapshot { name: name.into(), phase, scheduled: phase != kubelab_core::PodPhase::Pending, ..Default::default() }
}

impl FakeCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, FakeState> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn put_controller(&self, ns: &str, info: ControllerInfo) {
        self.lock().controllers.insert(key(ns, &info.name), info);
    }

    pub fn put_pod(&self, ns: &str, pod: PodSnapshot) {
        self.lock().pods.insert(key(ns, &pod.name), pod);
    }

    pub fn remove_pod(&self, ns: &str, name: &str) { self.lock().pods.remove(&key(ns, name)); }

    pub fn conflict_on(&self, name: &str) { self.lock().conflicts.insert(name.to_string()); }

    pub fn push_controller_lookup(&self, info: Option<ControllerInfo>) { self.lock().controller_lookups.push_back(info); }

    pub fn set_pod_on_create(&self, pod: PodSnapshot) { self.lock().pod_on_create = Some(pod); }

    pub fn push_watch(&self, script: WatchScript) { self.lock().watch_scripts.push_back(script); }

    pub fn push_access_error(&self, err: ClusterError) { self.lock().access_errors.push_back(err); }

    pub fn fail_creates(&self, err: ClusterError) { self.lock().create_error = Some(err); }

    pub fn set_ports(&self, behavior: PortBehavior) { self.lock().ports = behavior; }

    /// `(kind, name)` of every successful or conflicting create, in order.
    pub fn created(&self) -> Vec<(String, String)> { self.lock().created.clone() }

    /// `kind/name` of every delete that found something.
    pub fn deleted(&self) -> Vec<String> { self.lock().deleted.clone() }

    pub fn has_controller(&self, ns: &str, name: &str) -> bool { self.lock().controllers.contains_key(&key(ns, name)) }

    pub fn watch_calls(&self) -> usize { self.lock().watch_calls }

    pub fn pod_status_calls(&self) -> usize { self.lock().pod_status_calls }

    pub fn port_streams_opened(&self) -> usize { self.lock().port_streams_opened }

    fn apply_event(&self, ns: &str, ev: &PodEvent) {
        let mut st = self.lock();
        match ev {
            PodEvent::Applied(p) => {
                st.pods.insert(key(ns, &p.name), p.clone());
            }
            PodEvent::Deleted(p) => {
                st.pods.remove(&key(ns, &p.name));
            }
        }
    }
}

#[async_trait::async_trait]
impl ClusterApi for FakeCluster {
    async fn check_access(&self, _namespace: &str) -> Result<(), ClusterError> {
        match self.lock().access_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn get_controller(&self, namespace: &str, name: &str) -> Result<Option<ControllerInfo>, ClusterError> {
        let mut st = self.lock();
        if let Some(scripted) = st.controller_lookups.pop_front() {
            return Ok(scripted);
        }
        Ok(st.controllers.get(&key(namespace, name)).cloned())
    }

    async fn pod_status(&self, namespace: &str, pod: &str) -> Result<Option<PodSnapshot>, ClusterError> {
        let mut st = self.lock();
        st.pod_status_calls += 1;
        Ok(st.pods.get(&key(namespace, pod)).cloned())
    }

    async fn watch_pod(&self, namespace: &str, pod: &str) -> Result<PodWatch, ClusterError> {
        let (script, current) = {
            let mut st = self.lock();
            st.watch_calls += 1;
            (st.watch_scripts.pop_front(), st.pods.get(&key(namespace, pod)).cloned())
        };
        let (tx, rx) = mpsc::channel(16);
        let this = self.clone();
        let ns = namespace.to_string();
        let task = tokio::spawn(async move {
            let script = match script {
                Some(s) => s,
                None => {
                    // unscripted: like a real server, replay current state then idle
                    if let Some(p) = current {
                        let _ = tx.send(Ok(PodEvent::Applied(p))).await;
                    }
                    futures::future::pending::<()>().await;
                    return;
                }
            };
            for (delay, ev) in script.steps {
                tokio::time::sleep(delay).await;
                if let Ok(e) = &ev {
                    this.apply_event(&ns, e);
                }
                let last = ev.is_err();
                if tx.send(ev).await.is_err() || last {
                    return;
                }
            }
            if script.end == WatchEnd::Hang {
                futures::future::pending::<()>().await;
            }
        });
        Ok(PodWatch::new(rx, task))
    }

    async fn create(&self, namespace: &str, resource: &ResourceObject) -> Result<(), ClusterError> {
        let mut st = self.lock();
        if let Some(e) = st.create_error.clone() {
            return Err(e);
        }
        let name = resource.name().to_string();
        st.created.push((resource.kind().to_string(), name.clone()));
        if st.conflicts.contains(&name) {
            return Err(ClusterError::AlreadyExists(format!("{} {} already exists", resource.kind(), name)));
        }
        if let ResourceObject::StatefulSet(_) = resource {
            st.controllers.insert(key(namespace, &name), ControllerInfo { name: name.clone(), deleting: false, ready_replicas: 0 });
            if let Some(mut p) = st.pod_on_create.clone() {
                p.name = format!("{}-0", name);
                st.pods.insert(key(namespace, &p.name), p);
            }
        }
        Ok(())
    }

    async fn delete_controller(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        let mut st = self.lock();
        let existed = st.controllers.remove(&key(namespace, name)).is_some();
        st.pods.remove(&key(namespace, &format!("{}-0", name)));
        if existed {
            st.deleted.push(format!("StatefulSet/{}", name));
        }
        Ok(existed)
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<bool, ClusterError> {
        let mut st = self.lock();
        let existed = st.created.iter().any(|(k, n)| k == "Service" && n == name);
        if existed {
            st.deleted.push(format!("Service/{}", name));
        }
        Ok(existed)
    }

    async fn open_port_stream(&self, _namespace: &str, _pod: &str, _port: u16) -> Result<PortConnection, ClusterError> {
        let behavior = {
            let mut st = self.lock();
            st.port_streams_opened += 1;
            st.ports.clone()
        };
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (err_tx, err_rx) = oneshot::channel::<String>();
        match behavior {
            PortBehavior::Refuse(e) => return Err(e),
            PortBehavior::Echo => {
                tokio::spawn(async move {
                    let (mut r, mut w) = tokio::io::split(server);
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                    drop(err_tx);
                });
            }
            PortBehavior::RemoteError(msg) => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let _ = err_tx.send(msg);
                    drop(server);
                });
            }
        }
        let error = err_rx.map(|r| r.ok()).boxed();
        Ok(PortConnection { stream: Box::new(client), error })
    }
}

/// Hands out the same [`FakeCluster`] for any credential path.
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub cluster: FakeCluster,
    connect_error: Arc<Mutex<Option<ClusterError>>>,
}

impl FakeConnector {
    pub fn new(cluster: FakeCluster) -> Self { Self { cluster, connect_error: Arc::default() } }

    pub fn fail_with(&self, err: ClusterError) {
        *self.connect_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
    }
}

#[async_trait::async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, _credential_path: &Path) -> Result<Arc<dyn ClusterApi>, ClusterError> {
        if let Some(e) = self.connect_error.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(e);
        }
        Ok(Arc::new(self.cluster.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelab_core::PodPhase;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn scripted_watch_updates_pod_state() {
        let fake = FakeCluster::new();
        fake.push_watch(
            WatchScript::new(WatchEnd::Close)
                .applied(Duration::ZERO, pod_in("p-0", PodPhase::Pending))
                .applied(Duration::ZERO, ready_pod("p-0")),
        );
        let mut w = fake.watch_pod("ns", "p-0").await.unwrap();
        let mut n = 0;
        while let Some(ev) = w.rx.recv().await {
            ev.unwrap();
            n += 1;
        }
        assert_eq!(n, 2);
        let p = fake.pod_status("ns", "p-0").await.unwrap().unwrap();
        assert!(p.is_ready());
    }

    #[tokio::test]
    async fn echo_port_stream() {
        let fake = FakeCluster::new();
        let mut conn = fake.open_port_stream("ns", "p-0", 8888).await.unwrap();
        conn.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn conflicts_are_recorded_and_rejected() {
        use k8s_openapi::api::core::v1::ConfigMap;
        let fake = FakeCluster::new();
        fake.conflict_on("x-config");
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("x-config".into());
        let err = fake.create("ns", &ResourceObject::ConfigMap(cm)).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(fake.created(), vec![("ConfigMap".to_string(), "x-config".to_string())]);
    }
}
