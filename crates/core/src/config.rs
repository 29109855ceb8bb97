//! Deployment configuration as supplied by the credential/config loader.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{LabError, JUPYTER_CONFIG_FILE};

pub const DEFAULT_IMAGE: &str = "jupyter/base-notebook:latest";

/// Container env var names the apiserver accepts.
static ENV_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[-._a-zA-Z][-._a-zA-Z0-9]*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hardware {
    /// Kubernetes quantity, e.g. `"1"` or `"500m"`.
    pub cpu: String,
    /// Kubernetes quantity, e.g. `"2Gi"`.
    pub memory: String,
    pub gpu: u32,
    /// Persistent volume size; no volume claim when unset.
    pub storage: Option<String>,
}

impl Default for Hardware {
    fn default() -> Self { Self { cpu: "1".into(), memory: "2Gi".into(), gpu: 0, storage: None } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    pub repository: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LabConfig {
    pub credential_path: Option<PathBuf>,
    pub namespace: Option<String>,
    pub image: Option<String>,
    pub hardware: Hardware,
    pub git: Option<GitConfig>,
    pub environment: BTreeMap<String, String>,
}

impl LabConfig {
    pub fn credential_path(&self) -> Result<&Path, LabError> {
        match self.credential_path.as_deref() {
            Some(p) if !p.as_os_str().is_empty() => Ok(p),
            _ => Err(LabError::ConfigInvalid("no cluster credential (kubeconfig) path configured".into())),
        }
    }

    pub fn image(&self) -> &str { self.image.as_deref().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_IMAGE) }

    /// Cheap sanity checks run before touching the cluster.
    pub fn validate(&self) -> Result<(), LabError> {
        self.credential_path()?;
        if self.hardware.cpu.trim().is_empty() || self.hardware.memory.trim().is_empty() {
            return Err(LabError::ConfigInvalid("hardware cpu and memory must be set".into()));
        }
        if let Some(g) = &self.git {
            if g.repository.trim().is_empty() {
                return Err(LabError::ConfigInvalid("git repository must not be empty".into()));
            }
        }
        for k in self.environment.keys() {
            if !ENV_NAME.is_match(k) {
                return Err(LabError::ConfigInvalid(format!("invalid environment variable name {:?}", k)));
            }
            // shares the ConfigMap with the server config
            if k == JUPYTER_CONFIG_FILE {
                return Err(LabError::ConfigInvalid(format!("environment variable name {:?} is reserved", k)));
            }
        }
        Ok(())
    }
}
