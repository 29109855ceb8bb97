//! Port-forward supervisor: single-flight start, auto-restart with backoff,
//! observable state.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kubelab_core::{ActiveForward, ExitDecision, ForwardTarget, LabError, LabResult, PortForwardState};
use kubelab_kubehub::ClusterApi;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::tunnel::{CancelHandle, ForwardEvent, StreamHandle, TunnelLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub restart_delay: Duration,
    /// Extra delay per attempt so the old local port is released.
    pub restart_step: Duration,
    pub startup_timeout: Duration,
    /// How long a concurrent `start` waits for the one in flight.
    pub join_wait: Duration,
    pub join_poll: Duration,
    /// Restart cycles skipped for a not-ready pod before giving up.
    pub not_ready_skip_limit: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay: Duration::from_secs(5),
            restart_step: Duration::from_secs(2),
            startup_timeout: Duration::from_secs(10),
            join_wait: Duration::from_secs(15),
            join_poll: Duration::from_millis(250),
            not_ready_skip_limit: 10,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_restarts: kubelab_core::env_or("LAB_PF_MAX_RESTARTS", d.max_restarts),
            restart_delay: kubelab_core::env_millis("LAB_PF_RESTART_DELAY_MS", 5000),
            restart_step: kubelab_core::env_millis("LAB_PF_RESTART_STEP_MS", 2000),
            startup_timeout: kubelab_core::env_secs("LAB_PF_STARTUP_TIMEOUT_SECS", 10),
            ..d
        }
    }

    /// `restart_delay + attempt * restart_step`.
    pub fn restart_backoff(&self, attempt: u32) -> Duration { self.restart_delay + self.restart_step.saturating_mul(attempt) }
}

struct Active {
    target: ForwardTarget,
    cancel: Option<CancelHandle>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    state: PortForwardState,
    starting: bool,
    /// Bumped by every start/stop; tasks holding an older value must not touch state.
    generation: u64,
    active: Option<Active>,
}

struct Inner {
    cfg: SupervisorConfig,
    launcher: Arc<dyn TunnelLauncher>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<PortForwardState>,
}

/// Owns the single local tunnel for an orchestrator session. Cheap to clone.
#[derive(Clone)]
pub struct PortForwardSupervisor {
    inner: Arc<Inner>,
}

/// Resets the `starting` flag when a start attempt ends, however it ends.
struct StartingGuard {
    inner: Arc<Inner>,
}

impl Drop for StartingGuard {
    fn drop(&mut self) { self.inner.lock().starting = false; }
}

fn url_for(port: u16) -> String { format!("http://localhost:{}", port) }

fn same_target(active: Option<&ActiveForward>, target: &ForwardTarget) -> bool {
    active.map(|a| a.pod_name == target.pod_name && a.namespace == target.namespace && a.local_port == target.local_port).unwrap_or(false)
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> { self.shared.lock().unwrap_or_else(|p| p.into_inner()) }

    fn publish(&self, sh: &Shared) { self.state_tx.send_replace(sh.state.clone()); }

    /// Launch and wait for `Ready` within the startup timeout.
    async fn launch_until_ready(&self, cluster: &Arc<dyn ClusterApi>, target: &ForwardTarget) -> LabResult<(StreamHandle<ForwardEvent>, SocketAddr)> {
        let mut handle = self.launcher.launch(cluster.clone(), target).await?;
        let waited = tokio::time::timeout(self.cfg.startup_timeout, wait_ready(&mut handle.rx)).await;
        match waited {
            Ok(Ok(addr)) => Ok((handle, addr)),
            Ok(Err(e)) => {
                handle.cancel.cancel();
                Err(e)
            }
            Err(_) => {
                let StreamHandle { rx, cancel } = handle;
                drop(rx);
                cancel.shutdown().await;
                Err(LabError::TunnelStartupTimeout { port: target.local_port, after: self.cfg.startup_timeout })
            }
        }
    }
}

async fn wait_ready(rx: &mut mpsc::Receiver<ForwardEvent>) -> LabResult<SocketAddr> {
    let mut last = String::new();
    loop {
        match rx.recv().await {
            Some(ForwardEvent::Ready(addr)) => return Ok(addr),
            Some(ForwardEvent::Stderr(msg)) => {
                warn!(error = %msg, "port-forward: startup stderr");
                last = msg;
            }
            Some(ForwardEvent::Connected(_)) => {}
            Some(ForwardEvent::Exited { code }) => return Err(LabError::TunnelCrashed { code, detail: last }),
            None => return Err(LabError::TunnelCrashed { code: None, detail: last }),
        }
    }
}

/// Drain events until the tunnel exits; returns the exit code and last stderr line.
async fn monitor(rx: &mut mpsc::Receiver<ForwardEvent>) -> (Option<i32>, Option<String>) {
    let mut last = None;
    loop {
        match rx.recv().await {
            Some(ForwardEvent::Exited { code }) => return (code, last),
            Some(ForwardEvent::Stderr(msg)) => {
                warn!(error = %msg, "port-forward: stderr");
                last = Some(msg);
            }
            Some(ForwardEvent::Connected(peer)) => debug!(%peer, "port-forward: connection"),
            Some(ForwardEvent::Ready(addr)) => debug!(%addr, "port-forward: ready"),
            None => return (None, last),
        }
    }
}

enum PodCheck {
    Ready,
    Gone,
    GaveUp(String),
}

impl PortForwardSupervisor {
    pub fn new(launcher: Arc<dyn TunnelLauncher>, cfg: SupervisorConfig) -> Self {
        let state = PortForwardState::stopped(cfg.max_restarts);
        let (state_tx, _) = watch::channel(state.clone());
        let shared = Shared { state, starting: false, generation: 0, active: None };
        Self { inner: Arc::new(Inner { cfg, launcher, shared: Mutex::new(shared), state_tx }) }
    }

    pub fn config(&self) -> &SupervisorConfig { &self.inner.cfg }

    pub fn status(&self) -> PortForwardState { self.inner.lock().state.clone() }

    /// Snapshot stream of state changes.
    pub fn subscribe(&self) -> watch::Receiver<PortForwardState> { self.inner.state_tx.subscribe() }

    fn try_begin_start(&self) -> Option<StartingGuard> {
        let mut sh = self.inner.lock();
        if sh.starting {
            return None;
        }
        sh.starting = true;
        Some(StartingGuard { inner: self.inner.clone() })
    }

    /// Wait for an in-flight start. `Some(url)` when it landed on `target`.
    async fn join_in_flight(&self, target: &ForwardTarget) -> LabResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + self.inner.cfg.join_wait;
        loop {
            {
                let sh = self.inner.lock();
                if !sh.starting {
                    if sh.state.is_running() && same_target(sh.state.active_config.as_ref(), target) {
                        return Ok(sh.state.url.clone());
                    }
                    return Ok(None);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LabError::InProgress("port-forward start".into()));
            }
            tokio::time::sleep(self.inner.cfg.join_poll).await;
        }
    }

    /// Start forwarding `127.0.0.1:local_port` to the pod and supervise it.
    ///
    /// Only one start runs at a time; a concurrent caller for the same pod and
    /// port gets the in-flight attempt's URL instead of a second tunnel.
    pub async fn start(&self, cluster: Arc<dyn ClusterApi>, target: ForwardTarget) -> LabResult<String> {
        let _guard = loop {
            if let Some(g) = self.try_begin_start() {
                break g;
            }
            debug!(target = %target, "port-forward: start already in flight, waiting");
            if let Some(url) = self.join_in_flight(&target).await? {
                info!(target = %target, %url, "port-forward: joined in-flight start");
                return Ok(url);
            }
        };

        match cluster.pod_status(&target.namespace, &target.pod_name).await? {
            Some(p) if p.is_ready() => {}
            Some(p) => {
                let detail = if p.message.is_empty() { format!("phase {}", p.phase) } else { p.message.clone() };
                return Err(LabError::PodNotReady { pod: target.pod_name.clone(), detail });
            }
            None => return Err(LabError::PodNotReady { pod: target.pod_name.clone(), detail: "pod not found".into() }),
        }

        // Last stop wins: release whatever we held before rebinding.
        self.stop().await;
        let stray = self.inner.launcher.terminate_matching(&target).await;
        if stray > 0 {
            info!(target = %target, stray, "port-forward: cleaned up stray tunnels");
        }

        let generation = {
            let mut sh = self.inner.lock();
            sh.generation += 1;
            sh.state = PortForwardState::stopped(self.inner.cfg.max_restarts);
            sh.state.status = kubelab_core::ForwardStatus::Starting;
            sh.state.active_config = Some(ActiveForward::from(&target));
            sh.state.auto_restart_enabled = true;
            self.inner.publish(&sh);
            sh.generation
        };

        info!(target = %target, "port-forward: starting");
        match self.inner.launch_until_ready(&cluster, &target).await {
            Ok((handle, addr)) => {
                let url = url_for(addr.port());
                let StreamHandle { rx, cancel } = handle;
                let mut sh = self.inner.lock();
                if sh.generation != generation {
                    drop(sh);
                    cancel.cancel();
                    return Err(LabError::Cancelled);
                }
                sh.state.mark_running(url.clone());
                let task = tokio::spawn(supervise(self.inner.clone(), generation, cluster, target.clone(), rx));
                sh.active = Some(Active { target: target.clone(), cancel: Some(cancel), task: Some(task) });
                self.inner.publish(&sh);
                counter!("pf_start_ok", 1u64);
                info!(target = %target, %url, "port-forward: running");
                Ok(url)
            }
            Err(LabError::PortInUse(port)) => {
                // Most likely our own earlier tunnel from a previous session.
                let url = url_for(port);
                warn!(target = %target, %url, "port-forward: local port in use, assuming already forwarded");
                let mut sh = self.inner.lock();
                if sh.generation == generation {
                    sh.state.mark_running(url.clone());
                    sh.state.auto_restart_enabled = false;
                    self.inner.publish(&sh);
                }
                Ok(url)
            }
            Err(e) => {
                error!(target = %target, error = %e, "port-forward: start failed");
                let mut sh = self.inner.lock();
                if sh.generation == generation {
                    sh.state.auto_restart_enabled = false;
                    sh.state.mark_error(e.to_string());
                    self.inner.publish(&sh);
                }
                Err(e)
            }
        }
    }

    /// Disable auto-restart, cancel any pending restart, close the listener
    /// and live connections, reset to `Stopped`. Safe to call repeatedly.
    pub async fn stop(&self) {
        let active = {
            let mut sh = self.inner.lock();
            sh.generation += 1;
            let active = sh.active.take();
            let was = sh.state.status;
            sh.state = PortForwardState::stopped(self.inner.cfg.max_restarts);
            self.inner.publish(&sh);
            if active.is_some() || was != kubelab_core::ForwardStatus::Stopped {
                info!(prev = ?was, "port-forward: stopped");
            }
            active
        };
        if let Some(mut a) = active {
            if let Some(task) = a.task.take() {
                task.abort();
                let _ = task.await;
            }
            if let Some(cancel) = a.cancel.take() {
                cancel.shutdown().await;
            }
            debug!(target = %a.target, "port-forward: tunnel closed");
        }
    }
}

/// Watches one tunnel and applies the restart policy until it stops or gives up.
async fn supervise(inner: Arc<Inner>, generation: u64, cluster: Arc<dyn ClusterApi>, target: ForwardTarget, mut rx: mpsc::Receiver<ForwardEvent>) {
    let (mut code, mut last_err) = monitor(&mut rx).await;
    loop {
        let decision = {
            let mut sh = inner.lock();
            if sh.generation != generation {
                return;
            }
            if let Some(m) = last_err.take() {
                sh.state.last_error = Some(m);
            }
            let d = sh.state.record_exit(code);
            if d == ExitDecision::Stop {
                sh.state.active_config = None;
            }
            inner.publish(&sh);
            d
        };
        let attempt = match decision {
            ExitDecision::Stop => {
                info!(target = %target, ?code, "port-forward: tunnel exited, not restarting");
                return;
            }
            ExitDecision::GiveUp => {
                error!(target = %target, ?code, max = inner.cfg.max_restarts, "port-forward: giving up after repeated failures");
                return;
            }
            ExitDecision::Restart { attempt } => attempt,
        };
        counter!("pf_restarts", 1u64);
        let delay = inner.cfg.restart_backoff(attempt);
        warn!(target = %target, ?code, attempt, delay_ms = delay.as_millis() as u64, "port-forward: tunnel exited, scheduling restart");
        tokio::time::sleep(delay).await;

        match check_pod(&inner, &cluster, &target, delay).await {
            PodCheck::Ready => {}
            PodCheck::Gone => {
                let mut sh = inner.lock();
                if sh.generation == generation {
                    sh.state.auto_restart_enabled = false;
                    sh.state.url = None;
                    sh.state.mark_error(LabError::PodGone(target.pod_name.clone()).to_string());
                    inner.publish(&sh);
                }
                error!(target = %target, "port-forward: pod is gone, auto-restart disabled");
                return;
            }
            PodCheck::GaveUp(detail) => {
                let mut sh = inner.lock();
                if sh.generation == generation {
                    sh.state.mark_error(LabError::PodNotReady { pod: target.pod_name.clone(), detail }.to_string());
                    inner.publish(&sh);
                }
                return;
            }
        }
        if inner.lock().generation != generation {
            return;
        }

        inner.launcher.terminate_matching(&target).await;
        match inner.launch_until_ready(&cluster, &target).await {
            Ok((handle, addr)) => {
                let StreamHandle { rx: new_rx, cancel } = handle;
                let url = url_for(addr.port());
                {
                    let mut sh = inner.lock();
                    if sh.generation != generation {
                        drop(sh);
                        cancel.cancel();
                        return;
                    }
                    sh.state.mark_running(url.clone());
                    if let Some(a) = sh.active.as_mut() {
                        a.cancel = Some(cancel);
                    }
                    inner.publish(&sh);
                }
                counter!("pf_start_ok", 1u64);
                info!(target = %target, %url, attempt, "port-forward: restarted");
                rx = new_rx;
                (code, last_err) = monitor(&mut rx).await;
            }
            Err(e) => {
                warn!(target = %target, error = %e, attempt, "port-forward: restart failed");
                code = e.tunnel_exit_code();
                last_err = Some(e.to_string());
            }
        }
    }
}

/// Re-check the pod before a restart. Not-ready pods skip the cycle without
/// counting as a failure, bounded by `not_ready_skip_limit`.
async fn check_pod(inner: &Inner, cluster: &Arc<dyn ClusterApi>, target: &ForwardTarget, pause: Duration) -> PodCheck {
    let mut skipped = 0u32;
    loop {
        let detail = match cluster.pod_status(&target.namespace, &target.pod_name).await {
            Ok(Some(p)) if p.is_ready() => return PodCheck::Ready,
            Ok(None) => return PodCheck::Gone,
            Err(e) if e.is_not_found() => return PodCheck::Gone,
            Ok(Some(p)) => format!("phase {}", p.phase),
            Err(e) => e.to_string(),
        };
        skipped += 1;
        if skipped > inner.cfg.not_ready_skip_limit {
            return PodCheck::GaveUp(detail);
        }
        info!(target = %target, %detail, skipped, "port-forward: pod not ready, skipping restart cycle");
        tokio::time::sleep(pause).await;
    }
}
