//! kubelab core types: workload identity, cluster status projections,
//! port-forward state, deployment progress and the error taxonomy.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod forward;
pub mod identity;
pub mod progress;
pub mod project;
pub mod status;

pub use config::{GitConfig, Hardware, LabConfig};
pub use error::{ClusterError, LabError, LabResult};
pub use forward::{ActiveForward, ExitDecision, ForwardStatus, ForwardTarget, PortForwardState};
pub use identity::WorkloadIdentity;
pub use progress::{ChannelSink, DeploymentPhase, DeploymentProgress, LogSink, ProgressReporter, ProgressSink};
pub use status::{ControllerInfo, DeploymentStatus, PodEvent, PodLifecycle, PodPhase, PodSnapshot};

pub mod prelude {
    pub use super::{
        ClusterError, DeploymentPhase, DeploymentProgress, DeploymentStatus, ForwardTarget, LabConfig, LabError,
        LabResult, PodEvent, PodPhase, PodSnapshot, PortForwardState, ProgressSink, WorkloadIdentity,
    };
}

/// Label applied to every resource kubelab creates.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kubelab";

/// Port JupyterLab listens on inside the pod.
pub const JUPYTER_PORT: u16 = 8888;

/// ConfigMap key (and file name) of the JupyterLab server config.
pub const JUPYTER_CONFIG_FILE: &str = "jupyter_lab_config.py";

/// Read an env var and parse it, falling back to `default` when unset or invalid.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

/// Like [`env_or`] but for millisecond durations.
pub fn env_millis(key: &str, default_ms: u64) -> std::time::Duration {
    std::time::Duration::from_millis(env_or(key, default_ms))
}

/// Like [`env_or`] but for second durations.
pub fn env_secs(key: &str, default_secs: u64) -> std::time::Duration {
    std::time::Duration::from_secs(env_or(key, default_secs))
}
