//! kubelab kubehub – the cluster client boundary.
//!
//! Everything that talks to the Kubernetes API goes through [`ClusterApi`].
//! [`KubeCluster`] is the kube-rs implementation; [`fake::FakeCluster`] is an
//! in-memory one for tests. Errors leave this crate already classified as
//! [`ClusterError`], so callers never look at `kube::Error` or error text.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kubelab_core::{ClusterError, ControllerInfo, PodEvent, PodSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod client;
pub mod fake;
pub mod resolver;
pub mod retry;

pub use client::{classify, KubeCluster, KubeConnector};
pub use resolver::{ExplicitNamespace, KubeconfigNamespace, NamespaceResolver};
pub use retry::{RetryError, RetryPolicy};

/// A declarative resource to submit. Kinds are limited to what the
/// Jupyter workload needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceObject {
    ConfigMap(ConfigMap),
    Secret(Secret),
    Service(Service),
    StatefulSet(StatefulSet),
}

impl ResourceObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceObject::ConfigMap(_) => "ConfigMap",
            ResourceObject::Secret(_) => "Secret",
            ResourceObject::Service(_) => "Service",
            ResourceObject::StatefulSet(_) => "StatefulSet",
        }
    }

    pub fn name(&self) -> &str {
        let meta = match self {
            ResourceObject::ConfigMap(o) => &o.metadata,
            ResourceObject::Secret(o) => &o.metadata,
            ResourceObject::Service(o) => &o.metadata,
            ResourceObject::StatefulSet(o) => &o.metadata,
        };
        meta.name.as_deref().unwrap_or("")
    }

    /// JSON form with `apiVersion`/`kind` set, for rendering.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            ResourceObject::ConfigMap(o) => serde_json::to_value(o),
            ResourceObject::Secret(o) => serde_json::to_value(o),
            ResourceObject::Service(o) => serde_json::to_value(o),
            ResourceObject::StatefulSet(o) => serde_json::to_value(o),
        }
    }
}

impl std::fmt::Display for ResourceObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}/{}", self.kind(), self.name()) }
}

/// Live watch on a single pod. The channel closes when the server ends the
/// stream; an `Err` item is always the last one.
pub struct PodWatch {
    pub rx: mpsc::Receiver<Result<PodEvent, ClusterError>>,
    task: Option<JoinHandle<()>>,
}

impl PodWatch {
    pub fn new(rx: mpsc::Receiver<Result<PodEvent, ClusterError>>, task: JoinHandle<()>) -> Self {
        Self { rx, task: Some(task) }
    }

    /// Abort the underlying watch connection.
    pub fn cancel(&mut self) {
        if let Some(t) = self.task.take() {
            t.abort();
        }
    }
}

impl Drop for PodWatch {
    fn drop(&mut self) { self.cancel(); }
}

/// Byte stream to a pod port.
pub trait PortStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

impl<T> PortStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

/// One forwarded connection to a pod port.
pub struct PortConnection {
    pub stream: Box<dyn PortStream>,
    /// Resolves with the remote error text, or `None` once the forward closes cleanly.
    pub error: BoxFuture<'static, Option<String>>,
}

/// Cluster operations used by the reconciler, watcher and tunnel.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Cheap authenticated call proving the namespace is reachable.
    async fn check_access(&self, namespace: &str) -> Result<(), ClusterError>;

    /// StatefulSet by name; `None` on 404.
    async fn get_controller(&self, namespace: &str, name: &str) -> Result<Option<ControllerInfo>, ClusterError>;

    /// Pod by name; `None` on 404.
    async fn pod_status(&self, namespace: &str, pod: &str) -> Result<Option<PodSnapshot>, ClusterError>;

    async fn watch_pod(&self, namespace: &str, pod: &str) -> Result<PodWatch, ClusterError>;

    async fn create(&self, namespace: &str, resource: &ResourceObject) -> Result<(), ClusterError>;

    /// Returns false when there was nothing to delete.
    async fn delete_controller(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    async fn open_port_stream(&self, namespace: &str, pod: &str, port: u16) -> Result<PortConnection, ClusterError>;
}

/// Builds a [`ClusterApi`] from a credential file.
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, credential_path: &Path) -> Result<Arc<dyn ClusterApi>, ClusterError>;
}
