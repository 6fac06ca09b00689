use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::control_plane::ControlPlane;
use crate::structs::{HostCandidate, RepositoryKey, StorageRepositoryInfo};

/// Host and SR metrics read once at the start of a run. Every admission
/// decision of that run is made against the same snapshot.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct PoolSnapshot {
    pub hosts: Vec<HostCandidate>,
    pub repositories: Vec<StorageRepositoryInfo>,
    pub default_repository: Option<String>,
}

impl PoolSnapshot {
    pub async fn capture<P: ControlPlane>(plane: &P) -> Result<Self> {
        let hosts = plane.hosts().await.context("failed to list hosts")?;
        let repositories = plane
            .storage_repositories()
            .await
            .context("failed to list storage repositories")?;
        let default_repository = plane
            .default_storage_repository()
            .await
            .context("failed to read the pool default storage repository")?;
        debug!(
            "captured pool snapshot: {} hosts, {} storage repositories",
            hosts.len(),
            repositories.len()
        );
        Ok(PoolSnapshot {
            hosts,
            repositories,
            default_repository,
        })
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("invalid pool snapshot")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("can't read pool snapshot {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn repository(&self, key: &RepositoryKey) -> Option<&StorageRepositoryInfo> {
        let name = match key {
            RepositoryKey::Default => self.default_repository.as_deref()?,
            RepositoryKey::Named(name) => name.as_str(),
        };
        self.repositories.iter().find(|sr| sr.name == name)
    }
}
