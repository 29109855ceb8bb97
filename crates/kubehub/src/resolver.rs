//! Namespace resolution strategies.

use kube::config::{KubeConfigOptions, Kubeconfig};
use kubelab_core::{LabConfig, LabError};

/// Decides which namespace a deployment goes into.
#[async_trait::async_trait]
pub trait NamespaceResolver: Send + Sync {
    async fn resolve(&self, config: &LabConfig) -> Result<String, LabError>;
}

/// Default: the namespace from the config, or an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitNamespace;

#[async_trait::async_trait]
impl NamespaceResolver for ExplicitNamespace {
    async fn resolve(&self, config: &LabConfig) -> Result<String, LabError> {
        match config.namespace.as_deref().map(str::trim) {
            Some(ns) if !ns.is_empty() => Ok(ns.to_string()),
            _ => Err(LabError::ConfigInvalid("no namespace configured".into())),
        }
    }
}

/// Falls back to the current context's namespace in the credential file
/// (`default` when the context sets none). An explicit namespace still wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeconfigNamespace;

#[async_trait::async_trait]
impl NamespaceResolver for KubeconfigNamespace {
    async fn resolve(&self, config: &LabConfig) -> Result<String, LabError> {
        if let Ok(ns) = ExplicitNamespace.resolve(config).await {
            return Ok(ns);
        }
        let path = config.credential_path()?;
        let kc = Kubeconfig::read_from(path).map_err(|e| LabError::ConfigInvalid(e.to_string()))?;
        let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .map_err(|e| LabError::ConfigInvalid(e.to_string()))?;
        Ok(cfg.default_namespace)
    }
}
