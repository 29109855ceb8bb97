//! Pod/controller projections and the derived deployment status.

use serde::{Deserialize, Serialize};

/// Kubernetes pod phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Readiness-relevant view of a single pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodSnapshot {
    pub name: String,
    pub phase: PodPhase,
    /// True iff there is at least one container status and all report ready.
    pub ready: bool,
    /// PodScheduled condition is True.
    pub scheduled: bool,
    /// metadata.deletionTimestamp is set.
    pub deleting: bool,
    /// Pod reason/message or the first waiting/terminated container reason.
    pub message: String,
}

impl PodSnapshot {
    pub fn is_ready(&self) -> bool { self.phase == PodPhase::Running && self.ready && !self.deleting }

    pub fn lifecycle(&self) -> PodLifecycle { PodLifecycle::of(self) }

    /// Human-readable failure reason for a failed pod.
    pub fn failure_reason(&self) -> String {
        if self.message.is_empty() { "pod entered phase Failed".to_string() } else { self.message.clone() }
    }
}

/// Readiness state machine over a single pod.
///
/// `Unscheduled → Pending → RunningNotReady → Ready | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodLifecycle {
    Unscheduled,
    Pending,
    RunningNotReady,
    Ready,
    Failed,
}

impl PodLifecycle {
    pub fn of(pod: &PodSnapshot) -> Self {
        match pod.phase {
            PodPhase::Failed => PodLifecycle::Failed,
            PodPhase::Running if pod.ready && !pod.deleting => PodLifecycle::Ready,
            PodPhase::Running => PodLifecycle::RunningNotReady,
            PodPhase::Pending if pod.scheduled => PodLifecycle::Pending,
            // Succeeded means the server exited; the controller will restart it.
            PodPhase::Succeeded => PodLifecycle::Pending,
            _ => PodLifecycle::Unscheduled,
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, PodLifecycle::Ready | PodLifecycle::Failed) }

    /// Progress weight within the waiting-for-pod window (40..=75).
    pub fn progress_percent(&self) -> u8 {
        match self {
            PodLifecycle::Unscheduled => 40,
            PodLifecycle::Pending => 50,
            PodLifecycle::RunningNotReady => 65,
            PodLifecycle::Ready | PodLifecycle::Failed => 75,
        }
    }
}

/// Watch event for the pod under observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodEvent {
    Applied(PodSnapshot),
    Deleted(PodSnapshot),
}

/// Projection of the controller (StatefulSet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    pub name: String,
    pub deleting: bool,
    pub ready_replicas: i32,
}

/// Deployment snapshot consumed by the orchestrator and the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub exists: bool,
    pub pod_name: Option<String>,
    pub controller_name: Option<String>,
    pub ready: bool,
    pub phase: PodPhase,
    pub message: String,
}

impl DeploymentStatus {
    pub fn from_parts(controller: Option<&ControllerInfo>, pod: Option<&PodSnapshot>) -> Self {
        let Some(ctrl) = controller else {
            return DeploymentStatus { message: "no deployment found".into(), ..Default::default() };
        };
        let (ready, phase, pod_name, message) = match pod {
            Some(p) => {
                let message = if ctrl.deleting {
                    "terminating".to_string()
                } else if p.is_ready() {
                    "ready".to_string()
                } else if p.message.is_empty() {
                    format!("pod {}", p.phase.as_str().to_ascii_lowercase())
                } else {
                    p.message.clone()
                };
                (p.is_ready() && !ctrl.deleting, p.phase, Some(p.name.clone()), message)
            }
            None => (false, PodPhase::Unknown, None, "waiting for pod to be created".to_string()),
        };
        DeploymentStatus { exists: true, pod_name, controller_name: Some(ctrl.name.clone()), ready, phase, message }
    }
}
