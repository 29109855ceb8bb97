//! Port-forward supervisor state and the restart policy applied on tunnel exit.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ForwardStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

/// What to forward: `127.0.0.1:local_port` → `namespace/pod:remote_port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardTarget {
    pub namespace: String,
    pub pod_name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ForwardTarget {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self { namespace: namespace.into(), pod_name: pod_name.into(), local_port, remote_port }
    }
}

impl std::fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "localhost:{} -> {}/{}:{}", self.local_port, self.namespace, self.pod_name, self.remote_port)
    }
}

/// Active forward as reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveForward {
    pub namespace: String,
    pub pod_name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl From<&ForwardTarget> for ActiveForward {
    fn from(t: &ForwardTarget) -> Self {
        Self { namespace: t.namespace.clone(), pod_name: t.pod_name.clone(), local_port: t.local_port, remote_port: t.remote_port }
    }
}

/// Snapshot of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardState {
    pub status: ForwardStatus,
    pub active_config: Option<ActiveForward>,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub auto_restart_enabled: bool,
    pub restart_in_progress: bool,
    pub url: Option<String>,
    pub last_error: Option<String>,
}

/// Outcome of [`PortForwardState::record_exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Clean exit or auto-restart disabled; nothing to do.
    Stop,
    /// Schedule restart attempt number `attempt` (1-based).
    Restart { attempt: u32 },
    /// Restart budget exhausted; state is now `Error`.
    GiveUp,
}

impl PortForwardState {
    pub fn stopped(max_restarts: u32) -> Self {
        Self {
            status: ForwardStatus::Stopped,
            active_config: None,
            restart_count: 0,
            max_restarts,
            auto_restart_enabled: false,
            restart_in_progress: false,
            url: None,
            last_error: None,
        }
    }

    pub fn is_running(&self) -> bool { self.status == ForwardStatus::Running }

    /// Tunnel came up (first start or restart).
    pub fn mark_running(&mut self, url: String) {
        self.status = ForwardStatus::Running;
        self.restart_count = 0;
        self.restart_in_progress = false;
        self.url = Some(url);
        self.last_error = None;
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = ForwardStatus::Error;
        self.restart_in_progress = false;
        self.last_error = Some(message.into());
    }

    /// Apply the restart policy to a tunnel exit.
    ///
    /// Only a present, non-zero exit code while auto-restart is enabled counts
    /// as an unexpected failure. The count grows by one per restart attempt
    /// and the state moves to `Error` once `max_restarts` attempts are spent.
    pub fn record_exit(&mut self, code: Option<i32>) -> ExitDecision {
        let unexpected = matches!(code, Some(c) if c != 0);
        if !unexpected || !self.auto_restart_enabled {
            self.status = ForwardStatus::Stopped;
            self.restart_in_progress = false;
            self.url = None;
            return ExitDecision::Stop;
        }
        if self.restart_count >= self.max_restarts {
            self.url = None;
            self.mark_error(format!("port-forward failed {} times in a row (last exit code {:?})", self.restart_count + 1, code));
            return ExitDecision::GiveUp;
        }
        self.restart_count += 1;
        self.restart_in_progress = true;
        self.status = ForwardStatus::Starting;
        self.url = None;
        ExitDecision::Restart { attempt: self.restart_count }
    }
}
