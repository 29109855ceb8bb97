use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use kubelab_core::project::{project_controller, project_pod};
use kubelab_core::{ClusterError, ControllerInfo, PodEvent, PodSnapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{ClusterApi, ClusterConnector, PodWatch, PortConnection, ResourceObject};

/// Classify a kube-rs error. This is the only place that inspects `kube::Error`.
pub fn classify(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) => ClusterError::from_status(ae.code, ae.message),
        kube::Error::HyperError(e) => ClusterError::Connection(e.to_string()),
        kube::Error::Service(e) => ClusterError::Connection(e.to_string()),
        kube::Error::ReadEvents(e) => ClusterError::Connection(e.to_string()),
        kube::Error::Auth(e) => ClusterError::Forbidden(e.to_string()),
        kube::Error::InferConfig(e) => ClusterError::Config(e.to_string()),
        other => ClusterError::Api { code: 0, message: other.to_string() },
    }
}

fn to_snapshot<T: Serialize>(obj: &T, project: fn(&serde_json::Value) -> PodSnapshot) -> PodSnapshot {
    let raw = serde_json::to_value(obj).unwrap_or(serde_json::Value::Null);
    project(&raw)
}

fn controller_info(sts: &StatefulSet) -> ControllerInfo {
    let raw = serde_json::to_value(sts).unwrap_or(serde_json::Value::Null);
    project_controller(&raw)
}

fn watch_queue_cap() -> usize { kubelab_core::env_or("LAB_WATCH_QUEUE_CAP", 64usize) }

/// kube-rs backed cluster client, scoped to one credential.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Build a client from an explicit kubeconfig file.
    pub async fn from_kubeconfig(path: &Path, connect_timeout: Duration) -> Result<Self, ClusterError> {
        let kc = Kubeconfig::read_from(path).map_err(|e| ClusterError::Config(e.to_string()))?;
        let mut config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::Config(e.to_string()))?;
        config.connect_timeout = Some(connect_timeout);
        let client = Client::try_from(config).map_err(classify)?;
        Ok(Self { client })
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create_typed<K>(&self, namespace: &str, obj: &K) -> Result<(), ClusterError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        self.api::<K>(namespace).create(&PostParams::default(), obj).await.map(|_| ()).map_err(classify)
    }

    async fn delete_typed<K>(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        match self.api::<K>(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e) {
                ClusterError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn check_access(&self, namespace: &str) -> Result<(), ClusterError> {
        let started = Instant::now();
        self.api::<Pod>(namespace).list(&ListParams::default().limit(1)).await.map_err(classify)?;
        debug!(ns = %namespace, took_ms = started.elapsed().as_millis(), "cluster: access ok");
        Ok(())
    }

    async fn get_controller(&self, namespace: &str, name: &str) -> Result<Option<ControllerInfo>, ClusterError> {
        let sts = self.api::<StatefulSet>(namespace).get_opt(name).await.map_err(classify)?;
        Ok(sts.as_ref().map(controller_info))
    }

    async fn pod_status(&self, namespace: &str, pod: &str) -> Result<Option<PodSnapshot>, ClusterError> {
        let p = self.api::<Pod>(namespace).get_opt(pod).await.map_err(classify)?;
        Ok(p.as_ref().map(|p| to_snapshot(p, project_pod)))
    }

    async fn watch_pod(&self, namespace: &str, pod: &str) -> Result<PodWatch, ClusterError> {
        let api = self.api::<Pod>(namespace);
        let wp = WatchParams::default().fields(&format!("metadata.name={}", pod)).timeout(290);
        let (tx, rx) = mpsc::channel(watch_queue_cap());
        let pod_name = pod.to_string();
        let task = tokio::spawn(async move {
            let stream = match api.watch(&wp, "0").await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(Err(classify(e))).await;
                    return;
                }
            };
            info!(pod = %pod_name, "watch: start");
            futures::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                let ev = match item {
                    Ok(WatchEvent::Added(p)) | Ok(WatchEvent::Modified(p)) => Ok(PodEvent::Applied(to_snapshot(&p, project_pod))),
                    Ok(WatchEvent::Deleted(p)) => Ok(PodEvent::Deleted(to_snapshot(&p, project_pod))),
                    Ok(WatchEvent::Bookmark(_)) => continue,
                    Ok(WatchEvent::Error(e)) => Err(ClusterError::from_status(e.code, e.message)),
                    Err(e) => Err(classify(e)),
                };
                let last = ev.is_err();
                if tx.send(ev).await.is_err() || last {
                    break;
                }
            }
            debug!(pod = %pod_name, "watch: stream ended");
        });
        Ok(PodWatch::new(rx, task))
    }

    async fn create(&self, namespace: &str, resource: &ResourceObject) -> Result<(), ClusterError> {
        match resource {
            ResourceObject::ConfigMap(o) => self.create_typed(namespace, o).await,
            ResourceObject::Secret(o) => self.create_typed(namespace, o).await,
            ResourceObject::Service(o) => self.create_typed(namespace, o).await,
            ResourceObject::StatefulSet(o) => self.create_typed(namespace, o).await,
        }
    }

    async fn delete_controller(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.delete_typed::<StatefulSet>(namespace, name).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.delete_typed::<Service>(namespace, name).await
    }

    async fn open_port_stream(&self, namespace: &str, pod: &str, port: u16) -> Result<PortConnection, ClusterError> {
        let mut pf = self.api::<Pod>(namespace).portforward(pod, &[port]).await.map_err(classify)?;
        let stream = pf
            .take_stream(port)
            .ok_or_else(|| ClusterError::Connection(format!("port-forward to {}:{} returned no stream", pod, port)))?;
        let error_rx = pf.take_error(port);
        let pod_name = pod.to_string();
        let error = async move {
            let msg = match error_rx {
                Some(rx) => rx.await,
                None => None,
            };
            if let Some(m) = &msg {
                warn!(pod = %pod_name, port, error = %m, "port-forward: remote error");
            }
            // the forwarder lives as long as this future
            drop(pf);
            msg
        }
        .boxed();
        Ok(PortConnection { stream: Box::new(stream), error })
    }
}

/// Connects with [`KubeCluster::from_kubeconfig`].
#[derive(Debug, Clone)]
pub struct KubeConnector {
    pub connect_timeout: Duration,
}

impl Default for KubeConnector {
    fn default() -> Self { Self { connect_timeout: kubelab_core::env_secs("LAB_CONNECT_TIMEOUT_SECS", 10) } }
}

#[async_trait::async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, credential_path: &Path) -> Result<Arc<dyn ClusterApi>, ClusterError> {
        let cluster = KubeCluster::from_kubeconfig(credential_path, self.connect_timeout).await?;
        Ok(Arc::new(cluster))
    }
}
