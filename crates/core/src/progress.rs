//! Deployment progress events and sinks.
//!
//! Events are serializable so a UI layer can forward them as-is. The
//! [`ProgressReporter`] is what the orchestrator emits through; it keeps
//! percentages non-decreasing and swallows anything after a terminal phase.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::status::{PodLifecycle, PodPhase, PodSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentPhase {
    Initializing,
    ValidatingConnection,
    CreatingManifests,
    ApplyingManifests,
    WaitingForPod,
    PodReady,
    SettingUpAccess,
    Ready,
    Error,
    Cancelled,
}

impl DeploymentPhase {
    /// Nominal percent at phase entry.
    pub fn base_percent(&self) -> u8 {
        match self {
            DeploymentPhase::Initializing => 0,
            DeploymentPhase::ValidatingConnection => 10,
            DeploymentPhase::CreatingManifests => 20,
            DeploymentPhase::ApplyingManifests => 30,
            DeploymentPhase::WaitingForPod => 40,
            DeploymentPhase::PodReady => 80,
            DeploymentPhase::SettingUpAccess => 90,
            DeploymentPhase::Ready => 100,
            // terminal failures keep whatever percent was last reached
            DeploymentPhase::Error | DeploymentPhase::Cancelled => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentPhase::Ready | DeploymentPhase::Error | DeploymentPhase::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentPhase::Initializing => "initializing",
            DeploymentPhase::ValidatingConnection => "validating-connection",
            DeploymentPhase::CreatingManifests => "creating-manifests",
            DeploymentPhase::ApplyingManifests => "applying-manifests",
            DeploymentPhase::WaitingForPod => "waiting-for-pod",
            DeploymentPhase::PodReady => "pod-ready",
            DeploymentPhase::SettingUpAccess => "setting-up-access",
            DeploymentPhase::Ready => "ready",
            DeploymentPhase::Error => "error",
            DeploymentPhase::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentProgress {
    pub attempt_id: String,
    pub phase: DeploymentPhase,
    pub message: String,
    pub progress_percent: u8,
    pub pod_name: Option<String>,
    pub pod_status: Option<PodPhase>,
    pub url: Option<String>,
    pub error: Option<String>,
    pub timestamp_ms: i64,
}

/// Receives progress events. Implement this to route progress to a UI.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: DeploymentProgress);
}

/// Writes progress to tracing.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_progress(&self, ev: DeploymentProgress) {
        match ev.phase {
            DeploymentPhase::Error => error!(attempt = %ev.attempt_id, error = ?ev.error, "[{}%] {}", ev.progress_percent, ev.message),
            DeploymentPhase::Cancelled => warn!(attempt = %ev.attempt_id, "[{}%] {}", ev.progress_percent, ev.message),
            _ => info!(attempt = %ev.attempt_id, phase = %ev.phase, pod = ?ev.pod_name, "[{}%] {}", ev.progress_percent, ev.message),
        }
    }
}

/// Forwards progress into an unbounded channel; a closed receiver is ignored.
pub struct ChannelSink(pub tokio::sync::mpsc::UnboundedSender<DeploymentProgress>);

impl ProgressSink for ChannelSink {
    fn on_progress(&self, event: DeploymentProgress) { let _ = self.0.send(event); }
}

impl<F> ProgressSink for F
where
    F: Fn(DeploymentProgress) + Send + Sync,
{
    fn on_progress(&self, event: DeploymentProgress) { self(event) }
}

/// Per-attempt emitter enforcing ordering guarantees.
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    attempt_id: String,
    last_percent: u8,
    pod_name: Option<String>,
    finished: bool,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink, attempt_id: uuid::Uuid::new_v4().to_string(), last_percent: 0, pod_name: None, finished: false }
    }

    pub fn attempt_id(&self) -> &str { &self.attempt_id }

    pub fn is_finished(&self) -> bool { self.finished }

    pub fn set_pod(&mut self, pod: impl Into<String>) { self.pod_name = Some(pod.into()); }

    pub fn phase(&mut self, phase: DeploymentPhase, message: impl Into<String>) {
        self.emit(phase, message.into(), phase.base_percent(), None, None, None);
    }

    pub fn pod_update(&mut self, pod: &PodSnapshot) {
        let lc = PodLifecycle::of(pod);
        let message = match lc {
            PodLifecycle::Unscheduled => "waiting for the pod to be scheduled".to_string(),
            PodLifecycle::Pending => "pod scheduled, pulling image and starting containers".to_string(),
            PodLifecycle::RunningNotReady => "pod running, waiting for JupyterLab to become ready".to_string(),
            PodLifecycle::Ready => "pod is ready".to_string(),
            PodLifecycle::Failed => format!("pod failed: {}", pod.failure_reason()),
        };
        let message = if pod.message.is_empty() || lc == PodLifecycle::Failed { message } else { format!("{} ({})", message, pod.message) };
        self.pod_name = Some(pod.name.clone());
        self.emit(DeploymentPhase::WaitingForPod, message, lc.progress_percent(), Some(pod.phase), None, None);
    }

    pub fn ready(&mut self, url: &str) {
        self.emit(DeploymentPhase::Ready, format!("JupyterLab is available at {}", url), 100, Some(PodPhase::Running), Some(url.to_string()), None);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        let percent = self.last_percent;
        self.emit(DeploymentPhase::Error, message.clone(), percent, None, None, Some(message));
    }

    pub fn cancelled(&mut self) {
        let percent = self.last_percent;
        self.emit(DeploymentPhase::Cancelled, "deployment cancelled".into(), percent, None, None, None);
    }

    fn emit(
        &mut self,
        phase: DeploymentPhase,
        message: String,
        percent: u8,
        pod_status: Option<PodPhase>,
        url: Option<String>,
        error: Option<String>,
    ) {
        if self.finished {
            return;
        }
        let percent = percent.clamp(self.last_percent, 100);
        self.last_percent = percent;
        self.finished = phase.is_terminal();
        self.sink.on_progress(DeploymentProgress {
            attempt_id: self.attempt_id.clone(),
            phase,
            message,
            progress_percent: percent,
            pod_name: self.pod_name.clone(),
            pod_status,
            url,
            error,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting() -> (Arc<Mutex<Vec<DeploymentProgress>>>, Arc<dyn ProgressSink>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |ev: DeploymentProgress| s.lock().unwrap().push(ev));
        (seen, sink)
    }

    #[test]
    fn percent_never_decreases() {
        let (seen, sink) = collecting();
        let mut r = ProgressReporter::new(sink);
        r.phase(DeploymentPhase::ApplyingManifests, "apply");
        let pod = PodSnapshot { name: "p-0".into(), ..Default::default() };
        r.pod_update(&pod); // Unscheduled = 40
        r.phase(DeploymentPhase::ValidatingConnection, "late"); // 10 -> clamped
        let seen = seen.lock().unwrap();
        let pct: Vec<u8> = seen.iter().map(|e| e.progress_percent).collect();
        assert_eq!(pct, vec![30, 40, 40]);
    }

    #[test]
    fn nothing_after_terminal() {
        let (seen, sink) = collecting();
        let mut r = ProgressReporter::new(sink);
        r.phase(DeploymentPhase::Initializing, "go");
        r.cancelled();
        r.pod_update(&PodSnapshot::default());
        r.ready("http://localhost:8888");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].phase, DeploymentPhase::Cancelled);
        assert!(r.is_finished());
    }

    #[test]
    fn error_keeps_percent_and_message() {
        let (seen, sink) = collecting();
        let mut r = ProgressReporter::new(sink);
        r.phase(DeploymentPhase::WaitingForPod, "wait");
        r.error("pod failed: OOMKilled");
        let seen = seen.lock().unwrap();
        assert_eq!(seen[1].progress_percent, 40);
        assert_eq!(seen[1].error.as_deref(), Some("pod failed: OOMKilled"));
    }

    #[test]
    fn phases_serialize_kebab_case() {
        let s = serde_json::to_string(&DeploymentPhase::ValidatingConnection).unwrap();
        assert_eq!(s, "\"validating-connection\"");
        assert_eq!(DeploymentPhase::SettingUpAccess.as_str(), "setting-up-access");
    }
}
