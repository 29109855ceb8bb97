//! Workload identity derived from the cluster credential file.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::LabError;

const PREFIX: &str = "jupyter-";
const HASH_CHARS: usize = 12;

/// Stable workload name: `jupyter-` + the first 12 hex chars of sha256(credential bytes).
///
/// Used as the StatefulSet/Service name and as the correlation key for
/// watches and polls. Identical bytes (whitespace and line endings included)
/// always produce the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadIdentity(String);

impl WorkloadIdentity {
    /// Read the credential file and derive the identity from its contents.
    pub fn compute(credential_path: &Path) -> Result<Self, LabError> {
        let bytes = std::fs::read(credential_path)
            .map_err(|source| LabError::Io { path: credential_path.to_path_buf(), source })?;
        Ok(Self::from_bytes(&bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let digest = hex::encode(Sha256::digest(bytes));
        Self(format!("{}{}", PREFIX, &digest[..HASH_CHARS]))
    }

    /// Wrap an existing name (e.g. one typed by the user for `cleanup`).
    pub fn from_name(name: impl Into<String>) -> Self { Self(name.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    /// StatefulSets name their single replica `<name>-0`.
    pub fn pod_name(&self) -> String { format!("{}-0", self.0) }

    pub fn service_name(&self) -> String { self.0.clone() }

    pub fn config_map_name(&self) -> String { format!("{}-config", self.0) }

    pub fn secret_name(&self) -> String { format!("{}-git", self.0) }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl AsRef<str> for WorkloadIdentity {
    fn as_ref(&self) -> &str { &self.0 }
}
