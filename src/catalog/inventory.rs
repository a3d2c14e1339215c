use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::station::InventoryStation;
use crate::error::{DlTdvmsError, StateError};

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// A seismic network known to the portal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Somewhere the full network and station lists can be read from
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn networks(&self) -> Result<Vec<Network>>;

    async fn stations(&self, networks: &[String]) -> Result<Vec<InventoryStation>>;
}

/// Inventory source that keeps a JSON copy of each list on disk.
///
/// The portal's station list changes rarely, so repeated runs of the same
/// campaign reuse `networks.json` and `stations.json` from the cache directory
/// unless `refresh` is set.
pub struct CachedInventory<S> {
    inner: S,
    dir: PathBuf,
    refresh: bool,
}

impl<S: InventorySource> CachedInventory<S> {
    pub fn new(inner: S, dir: impl Into<PathBuf>, refresh: bool) -> Self {
        Self {
            inner,
            dir: dir.into(),
            refresh,
        }
    }

    fn networks_path(&self) -> PathBuf {
        self.dir.join("networks.json")
    }

    fn stations_path(&self) -> PathBuf {
        self.dir.join("stations.json")
    }
}

#[async_trait]
impl<S: InventorySource> InventorySource for CachedInventory<S> {
    async fn networks(&self) -> Result<Vec<Network>> {
        let path = self.networks_path();
        if !self.refresh {
            if let Some(cached) = read_cache(&path)? {
                return Ok(cached);
            }
        }
        let networks = self.inner.networks().await?;
        write_cache(&path, &networks)?;
        Ok(networks)
    }

    /// The cache always holds every known network, so the requested
    /// subset is filtered by the resolver rather than here.
    async fn stations(&self, networks: &[String]) -> Result<Vec<InventoryStation>> {
        let path = self.stations_path();
        if !self.refresh {
            if let Some(cached) = read_cache(&path)? {
                return Ok(cached);
            }
        }
        let stations = self.inner.stations(networks).await?;
        write_cache(&path, &stations)?;
        Ok(stations)
    }
}

fn read_cache<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read(path).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match serde_json::from_slice(&content) {
        Ok(value) => {
            tracing::debug!("Using cached inventory: {}", path.display());
            Ok(Some(value))
        }
        Err(e) => {
            tracing::warn!("Ignoring unreadable inventory cache {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

fn write_cache<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let io_err = |source: std::io::Error| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let json = serde_json::to_vec_pretty(value).map_err(|source| StateError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
