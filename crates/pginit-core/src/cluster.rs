//! Description of one PostgreSQL cluster as handed over by the reconciler.
//!
//! The reconciler owns the Kubernetes objects; this engine only needs the
//! handful of fields below. They arrive as JSON so that the rendering entry
//! point can be driven from a mounted file.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for loading a cluster description.
#[derive(Debug)]
pub enum ClusterError {
    /// The description could not be read.
    Io(std::io::Error),
    /// The description is not valid JSON or has the wrong shape.
    Parse(serde_json::Error),
    /// The description parsed but cannot describe a real cluster.
    Invalid(String),
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::Io(e) => write!(f, "I/O error: {}", e),
            ClusterError::Parse(e) => write!(f, "invalid cluster description: {}", e),
            ClusterError::Invalid(msg) => write!(f, "invalid cluster description: {}", msg),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(e)
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Parse(e)
    }
}

/// Cluster fields consumed by the configuration generators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cluster {
    /// PostgreSQL major version, e.g. `16`.
    pub postgres_version: u32,
    pub port: u16,
    /// A dedicated WAL volume is mounted at `/pgwal`.
    pub wal_volume: bool,
    /// A dedicated temporary-file volume is mounted at `/pgtmp`.
    pub temp_volume: bool,
    /// Names of tablespace volumes mounted under `/tablespaces`.
    pub tablespaces: Vec<String>,
    /// Command that prints the transparent data encryption key.
    pub encryption_key_command: Option<String>,
    /// Parameter overrides from the cluster spec.
    pub parameters: BTreeMap<String, Value>,
    /// Raw `pg_hba.conf` lines from the cluster spec.
    pub hba: Vec<String>,
    /// Patroni dynamic configuration supplied by the user.
    pub patroni: Option<Value>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            postgres_version: 0,
            port: 5432,
            wal_volume: false,
            temp_volume: false,
            tablespaces: Vec::new(),
            encryption_key_command: None,
            parameters: BTreeMap::new(),
            hba: Vec::new(),
            patroni: None,
        }
    }
}

impl Cluster {
    /// Parses a cluster description from JSON.
    pub fn from_json(content: &str) -> Result<Self, ClusterError> {
        let cluster: Cluster = serde_json::from_str(content)?;
        cluster.validate()?;
        Ok(cluster)
    }

    /// Reads and parses a cluster description file.
    pub fn from_file(path: &Path) -> Result<Self, ClusterError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Whether a non-empty TDE key command is configured.
    pub fn has_encryption_key_command(&self) -> bool {
        self.encryption_key_command
            .as_deref()
            .is_some_and(|cmd| !cmd.trim().is_empty())
    }

    /// Rejects descriptions that cannot belong to a real cluster, such as
    /// tablespace names that are not a single path component.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.postgres_version == 0 {
            return Err(ClusterError::Invalid(
                "postgresVersion must be set".to_string(),
            ));
        }
        for name in &self.tablespaces {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(ClusterError::Invalid(format!(
                    "tablespace name {:?} is not a single path component",
                    name
                )));
            }
        }
        Ok(())
    }
}
