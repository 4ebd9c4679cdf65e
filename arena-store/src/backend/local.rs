//! Single-file JSON backend.
//!
//! The whole graph lives in one pretty-printed JSON document. Every write
//! serializes the full graph into its own sibling temp file and renames it
//! over the target, so a concurrent reader sees either the old or the new
//! file. Bootstrap hard-links a complete empty graph into place, which fails
//! if the file already exists: it never overwrites a committed write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{AtomicBackendStats, Backend, BackendStats};
use crate::config::BackendKind;
use crate::error::{Result, StoreError};
use crate::schema::{normalize, Collection, Graph};

/// Backend persisting the graph as one JSON file.
pub struct LocalFileBackend {
    path: PathBuf,
    stats: AtomicBackendStats,
}

impl LocalFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stats: AtomicBackendStats::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A temp file name no other write uses.
    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "db.json".into());
        name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        self.path.with_file_name(name)
    }

    async fn write_temp(&self, bytes: &[u8]) -> Result<PathBuf> {
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(StoreError::io(&temp))?;
        Ok(temp)
    }

    /// Create the file holding the empty graph, unless it exists by now.
    async fn bootstrap(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StoreError::io(parent))?;
        }
        let temp = self.write_temp(&serde_json::to_vec_pretty(&Graph::empty())?).await?;
        let linked = tokio::fs::hard_link(&temp, &self.path).await;
        let _ = tokio::fs::remove_file(&temp).await;
        match linked {
            Ok(()) => {
                self.stats.write();
                log::info!("Initialized empty store at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                log::debug!("Store at {} was created concurrently", self.path.display());
                Ok(())
            }
            Err(e) => Err(StoreError::io(&self.path)(e)),
        }
    }

    async fn load(&self) -> Result<Graph> {
        self.stats.read();
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.bootstrap().await?;
                tokio::fs::read(&self.path)
                    .await
                    .map_err(StoreError::io(&self.path))?
            }
            Err(e) => return Err(StoreError::io(&self.path)(e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Graph::empty());
        }
        let raw: Value = serde_json::from_slice(&bytes)?;
        Ok(normalize(raw))
    }

    async fn persist(&self, graph: &Graph) -> Result<()> {
        self.stats.write();
        let bytes = serde_json::to_vec_pretty(graph)?;
        let temp = self.write_temp(&bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::io(&self.path)(e));
        }
        log::debug!("Wrote {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn read_all(&self) -> Result<Graph> {
        self.load().await
    }

    async fn read_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        let mut graph = self.load().await?;
        Ok(graph.take(collection))
    }

    async fn write_all(&self, graph: &Graph, _changed: &[Collection]) -> Result<()> {
        self.persist(graph).await
    }

    async fn replace_collection(&self, collection: Collection, records: &[Value]) -> Result<()> {
        let mut graph = self.load().await?;
        graph.set(collection, records.to_vec());
        self.persist(&graph).await
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}
