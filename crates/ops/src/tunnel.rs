//! In-process port-forward tunnel.
//!
//! A tunnel binds `LAB_PF_BIND:local_port` (default `127.0.0.1`) and pipes
//! every accepted connection through its own cluster port-forward stream to
//! the pod. Lifecycle is reported as [`ForwardEvent`]s; the last event is
//! always `Exited` unless the task was aborted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubelab_core::{ForwardTarget, LabError, LabResult};
use kubelab_kubehub::{ClusterApi, PortConnection};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardEvent {
    /// Listening and the pod port answered.
    Ready(SocketAddr),
    Connected(SocketAddr),
    /// Diagnostic text (remote errors, accept failures).
    Stderr(String),
    Exited { code: Option<i32> },
}

/// Cancels a tunnel when dropped or consumed.
#[derive(Debug)]
pub struct CancelHandle {
    guard: Option<DropGuard>,
    done: Option<oneshot::Receiver<()>>,
}

impl CancelHandle {
    /// `done` resolves (or errors) once the tunnel has released its socket.
    pub fn new(token: CancellationToken, done: oneshot::Receiver<()>) -> Self {
        Self { guard: Some(token.drop_guard()), done: Some(done) }
    }

    pub fn cancel(mut self) { self.guard.take(); }

    /// Cancel and wait until the listener is closed.
    pub async fn shutdown(mut self) {
        self.guard.take();
        if let Some(done) = self.done.take() {
            let _ = done.await;
        }
    }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Starts tunnels. The supervisor only talks to this trait.
#[async_trait::async_trait]
pub trait TunnelLauncher: Send + Sync {
    /// Bind the local port and start forwarding. Fails with `PortInUse` when
    /// the local port is taken.
    async fn launch(&self, cluster: Arc<dyn ClusterApi>, target: &ForwardTarget) -> LabResult<StreamHandle<ForwardEvent>>;

    /// Stop tunnels started by this launcher that use the same pod port or
    /// the same local port. Returns how many were stopped.
    async fn terminate_matching(&self, target: &ForwardTarget) -> usize;
}

static NETNS_CLOSED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)network namespace\b.*\bis closed").unwrap());

/// Remote error emitted while a pod restarts; not a tunnel failure on its own.
pub fn is_netns_closed(msg: &str) -> bool { NETNS_CLOSED.is_match(msg) }

fn bind_host() -> String { std::env::var("LAB_PF_BIND").unwrap_or_else(|_| "127.0.0.1".to_string()) }

struct LiveTunnel {
    target: ForwardTarget,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Tunnel launcher backed by [`ClusterApi::open_port_stream`].
#[derive(Clone, Default)]
pub struct KubeTunnel {
    live: Arc<Mutex<HashMap<u64, LiveTunnel>>>,
    next_id: Arc<AtomicU64>,
}

impl KubeTunnel {
    pub fn new() -> Self { Self::default() }

    /// Number of tunnels currently running.
    pub fn live_count(&self) -> usize { self.live.lock().unwrap_or_else(|p| p.into_inner()).len() }
}

#[async_trait::async_trait]
impl TunnelLauncher for KubeTunnel {
    async fn launch(&self, cluster: Arc<dyn ClusterApi>, target: &ForwardTarget) -> LabResult<StreamHandle<ForwardEvent>> {
        let host = bind_host();
        let listener = match TcpListener::bind((host.as_str(), target.local_port)).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => return Err(LabError::PortInUse(target.local_port)),
            Err(e) => return Err(LabError::TunnelCrashed { code: Some(1), detail: format!("bind {}:{}: {}", host, target.local_port, e) }),
        };
        let cap = kubelab_core::env_or("LAB_PF_QUEUE_CAP", 64usize);
        let (tx, rx) = mpsc::channel(cap);
        let token = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let registry = self.live.clone();
        let t = target.clone();
        let tok = token.clone();
        // hold the registry lock so the task cannot deregister before it is registered
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        let task = tokio::spawn(async move {
            let code = run_tunnel(cluster, t.clone(), listener, tx.clone(), tok).await;
            info!(target = %t, code, "tunnel: exited");
            let _ = tx.send(ForwardEvent::Exited { code: Some(code) }).await;
            registry.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
            drop(done_tx);
        });
        live.insert(id, LiveTunnel { target: target.clone(), token: token.clone(), task });
        drop(live);
        Ok(StreamHandle { rx, cancel: CancelHandle::new(token, done_rx) })
    }

    async fn terminate_matching(&self, target: &ForwardTarget) -> usize {
        let stale: Vec<LiveTunnel> = {
            let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
            let ids: Vec<u64> = live
                .iter()
                .filter(|(_, l)| {
                    (l.target.remote_port == target.remote_port && l.target.pod_name == target.pod_name)
                        || (target.local_port != 0 && l.target.local_port == target.local_port)
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| live.remove(&id)).collect()
        };
        let n = stale.len();
        for l in stale {
            warn!(target = %l.target, "tunnel: terminating stray tunnel");
            l.token.cancel();
            if tokio::time::timeout(Duration::from_secs(2), l.task).await.is_err() {
                warn!(target = %l.target, "tunnel: stray did not exit in time");
            }
        }
        n
    }
}

async fn run_tunnel(
    cluster: Arc<dyn ClusterApi>,
    target: ForwardTarget,
    listener: TcpListener,
    tx: mpsc::Sender<ForwardEvent>,
    cancel: CancellationToken,
) -> i32 {
    // Probe once so Ready means the pod port is reachable.
    let probe = tokio::select! {
        _ = cancel.cancelled() => return 0,
        p = cluster.open_port_stream(&target.namespace, &target.pod_name, target.remote_port) => p,
    };
    match probe {
        Ok(conn) => drop(conn),
        Err(e) => {
            let _ = tx.send(ForwardEvent::Stderr(format!("unable to open {}:{}: {}", target.pod_name, target.remote_port, e))).await;
            return 1;
        }
    }

    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => {
            let _ = tx.send(ForwardEvent::Stderr(format!("listener address: {}", e))).await;
            return 1;
        }
    };
    info!(target = %target, %addr, "tunnel: forwarding");
    let _ = tx.send(ForwardEvent::Ready(addr)).await;

    let (fail_tx, mut fail_rx) = mpsc::channel::<String>(4);
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return 0,
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    let _ = tx.send(ForwardEvent::Connected(peer)).await;
                    conns.spawn(forward_connection(cluster.clone(), target.clone(), inbound, peer, tx.clone(), fail_tx.clone()));
                }
                Err(e) => {
                    let _ = tx.send(ForwardEvent::Stderr(format!("accept error: {}", e))).await;
                    return 1;
                }
            },
            Some(msg) = fail_rx.recv() => {
                let _ = tx.send(ForwardEvent::Stderr(msg)).await;
                return 1;
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
}

async fn forward_connection(
    cluster: Arc<dyn ClusterApi>,
    target: ForwardTarget,
    mut inbound: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<ForwardEvent>,
    fail_tx: mpsc::Sender<String>,
) {
    let PortConnection { mut stream, error } =
        match cluster.open_port_stream(&target.namespace, &target.pod_name, target.remote_port).await {
            Ok(c) => c,
            Err(e) => {
                let _ = fail_tx.send(format!("error forwarding port {} to pod {}: {}", target.remote_port, target.pod_name, e)).await;
                return;
            }
        };
    let copy = tokio::io::copy_bidirectional(&mut inbound, &mut stream);
    tokio::pin!(copy);
    tokio::select! {
        res = &mut copy => match res {
            Ok((up, down)) => debug!(%peer, up, down, "tunnel: connection closed"),
            Err(e) => debug!(%peer, error = %e, "tunnel: connection error"),
        },
        remote = error => match remote {
            Some(msg) if is_netns_closed(&msg) => {
                warn!(%peer, error = %msg, "tunnel: pod network namespace closed, leaving it to restart handling");
                let _ = tx.send(ForwardEvent::Stderr(msg)).await;
            }
            Some(msg) => {
                let _ = fail_tx.send(msg).await;
            }
            None => {
                let _ = copy.await;
            }
        },
    }
}
