//! Error taxonomy.
//!
//! `ClusterError` is built once at the cluster client boundary from the
//! client library's error type; everything downstream matches on variants.
//! `LabError` is what orchestration surfaces to callers.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classified cluster API failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("connection: {0}")]
    Connection(String),
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("client config: {0}")]
    Config(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ClusterError::AlreadyExists(_)) }
    pub fn is_retryable(&self) -> bool { matches!(self, ClusterError::Connection(_)) }

    /// Map an HTTP-style status code and message into a variant.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            404 => ClusterError::NotFound(message),
            409 => ClusterError::AlreadyExists(message),
            401 | 403 => ClusterError::Forbidden(message),
            // gateway/timeouts from an apiserver proxy behave like transport errors
            502..=504 => ClusterError::Connection(message),
            _ => ClusterError::Api { code, message },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cluster unreachable: {0}")]
    Connection(String),
    #[error("permission denied: {0} (check that the credential may manage pods, statefulsets, services, secrets and configmaps in this namespace)")]
    Auth(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cluster api error ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("pod {pod} is not ready: {detail}")]
    PodNotReady { pod: String, detail: String },
    #[error("statefulset {name} is stuck terminating; delete it manually (kubectl delete statefulset {name} --grace-period=0 --force) and try again")]
    StuckTerminating { name: String },
    #[error("pod {pod} failed: {reason}")]
    PodFailed { pod: String, reason: String },
    #[error("timed out after {}s waiting for {what}", after.as_secs())]
    Timeout { what: String, after: Duration },
    #[error("watch interrupted: {0}")]
    WatchInterrupted(String),
    #[error("port-forward on local port {port} did not come up within {}s", after.as_secs())]
    TunnelStartupTimeout { port: u16, after: Duration },
    #[error("port-forward exited unexpectedly (code {code:?}): {detail}")]
    TunnelCrashed { code: Option<i32>, detail: String },
    #[error("pod {0} no longer exists")]
    PodGone(String),
    #[error("local port {0} is already in use")]
    PortInUse(u16),
    #[error("{0} already in progress")]
    InProgress(String),
    #[error("cancelled")]
    Cancelled,
    #[error("manifest: {0}")]
    Manifest(String),
}

pub type LabResult<T> = Result<T, LabError>;

impl LabError {
    /// Short machine-friendly tag, used for metrics labels and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            LabError::ConfigInvalid(_) => "config_invalid",
            LabError::Io { .. } => "io",
            LabError::Connection(_) => "connection",
            LabError::Auth(_) => "auth",
            LabError::AlreadyExists(_) => "already_exists",
            LabError::NotFound(_) => "not_found",
            LabError::Api { .. } => "api",
            LabError::PodNotReady { .. } => "pod_not_ready",
            LabError::StuckTerminating { .. } => "stuck_terminating",
            LabError::PodFailed { .. } => "pod_failed",
            LabError::Timeout { .. } => "timeout",
            LabError::WatchInterrupted(_) => "watch_interrupted",
            LabError::TunnelStartupTimeout { .. } => "tunnel_startup_timeout",
            LabError::TunnelCrashed { .. } => "tunnel_crashed",
            LabError::PodGone(_) => "pod_gone",
            LabError::PortInUse(_) => "port_in_use",
            LabError::InProgress(_) => "in_progress",
            LabError::Cancelled => "cancelled",
            LabError::Manifest(_) => "manifest",
        }
    }

    pub fn is_cancelled(&self) -> bool { matches!(self, LabError::Cancelled) }

    /// Exit code reported for a tunnel that failed to (re)start with this error.
    pub fn tunnel_exit_code(&self) -> Option<i32> {
        match self {
            LabError::TunnelCrashed { code, .. } => *code,
            LabError::TunnelStartupTimeout { .. } => Some(124),
            LabError::PortInUse(_) => Some(98),
            LabError::Cancelled => Some(0),
            _ => Some(1),
        }
    }
}

impl From<ClusterError> for LabError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotFound(m) => LabError::NotFound(m),
            ClusterError::AlreadyExists(m) => LabError::AlreadyExists(m),
            ClusterError::Forbidden(m) => LabError::Auth(m),
            ClusterError::Connection(m) => LabError::Connection(m),
            ClusterError::Api { code, message } => LabError::Api { code, message },
            ClusterError::Config(m) => LabError::ConfigInvalid(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_variants() {
        assert!(ClusterError::from_status(404, "x").is_not_found());
        assert!(ClusterError::from_status(409, "x").is_conflict());
        assert_eq!(ClusterError::from_status(403, "no"), ClusterError::Forbidden("no".into()));
        assert!(ClusterError::from_status(503, "x").is_retryable());
        assert_eq!(ClusterError::from_status(422, "bad"), ClusterError::Api { code: 422, message: "bad".into() });
    }

    #[test]
    fn forbidden_becomes_auth_with_hint() {
        let e: LabError = ClusterError::Forbidden("pods is forbidden".into()).into();
        assert_eq!(e.kind(), "auth");
        assert!(e.to_string().contains("check that the credential"));
    }

    #[test]
    fn tunnel_exit_codes() {
        assert_eq!(LabError::PortInUse(8888).tunnel_exit_code(), Some(98));
        assert_eq!(LabError::TunnelCrashed { code: None, detail: String::new() }.tunnel_exit_code(), None);
        assert_eq!(
            LabError::TunnelStartupTimeout { port: 1, after: Duration::from_secs(10) }.tunnel_exit_code(),
            Some(124)
        );
    }
}
