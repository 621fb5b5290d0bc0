// src/storage.rs

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact `{0}` not found")]
    NotFound(String),
    #[error("i/o failure at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed part payload: {0}")]
    MalformedPart(String),
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.into(),
        source,
    }
}

/// Connector to the graph database holding pedestrian artifacts and their
/// relationships. The core only ever sees this trait; the production
/// connector lives outside the repo.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn store(&self, id: &str, artifact: Vec<u8>) -> Result<(), StorageError>;

    /// Fails with [`StorageError::NotFound`] if the id was never stored.
    async fn retrieve(&self, id: &str) -> Result<Vec<u8>, StorageError>;

    async fn record_relationship(
        &self,
        id_a: &str,
        id_b: &str,
        value: f64,
    ) -> Result<(), StorageError>;
}

/// In-process graph store for local runs and tests.
pub struct InMemoryGraphStore {
    artifacts: DashMap<String, Vec<u8>>,
    relationships: DashMap<(String, String), f64>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            artifacts: DashMap::new(),
            relationships: DashMap::new(),
        }
    }

    pub fn relationship(&self, id_a: &str, id_b: &str) -> Option<f64> {
        self.relationships
            .get(&(id_a.to_string(), id_b.to_string()))
            .map(|v| *v)
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn store(&self, id: &str, artifact: Vec<u8>) -> Result<(), StorageError> {
        self.artifacts.insert(id.to_string(), artifact);
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        self.artifacts
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn record_relationship(
        &self,
        id_a: &str,
        id_b: &str,
        value: f64,
    ) -> Result<(), StorageError> {
        self.relationships
            .insert((id_a.to_string(), id_b.to_string()), value);
        Ok(())
    }
}

const MANIFEST_FILE: &str = "_manifest.json";

/// Per-task manifest, written when the first part arrives. Declares how many
/// parts the task fans into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartManifest {
    pub expected_parts: usize,
    pub declared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDirSummary {
    pub parts: usize,
    pub bytes: u64,
}

/// Durable part storage on a local directory tree, one directory per task.
/// Stands in for the distributed filesystem the cluster deployment uses;
/// the completion tracker only relies on create/overwrite, directory
/// summaries, and recursive delete.
pub struct LocalPartStore {
    root: PathBuf,
}

impl LocalPartStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    pub fn archive_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{task_id}.pack"))
    }

    pub async fn archive_exists(&self, task_id: &str) -> bool {
        fs::try_exists(self.archive_path(task_id)).await.unwrap_or(false)
    }

    /// Write one part, overwriting any previous delivery of the same part.
    pub async fn write_part(
        &self,
        task_id: &str,
        part_id: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        let path = dir.join(part_id);
        fs::write(&path, bytes).await.map_err(|e| io_err(&path, e))
    }

    /// Persist the declared part count if no earlier arrival declared one.
    /// Returns the manifest in effect.
    pub async fn declare(
        &self,
        task_id: &str,
        expected_parts: usize,
    ) -> Result<PartManifest, StorageError> {
        if let Some(existing) = self.manifest(task_id).await? {
            return Ok(existing);
        }
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        let manifest = PartManifest {
            expected_parts,
            declared_at: Utc::now(),
        };
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StorageError::MalformedPart(e.to_string()))?;
        fs::write(&path, json).await.map_err(|e| io_err(&path, e))?;
        Ok(manifest)
    }

    pub async fn manifest(&self, task_id: &str) -> Result<Option<PartManifest>, StorageError> {
        let path = self.task_dir(task_id).join(MANIFEST_FILE);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::MalformedPart(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Scan the task directory and count the parts stored so far. The
    /// completion decision is recomputed from this summary on every arrival,
    /// never from an in-memory counter.
    pub async fn summarize(&self, task_id: &str) -> Result<TaskDirSummary, StorageError> {
        let dir = self.task_dir(task_id);
        let mut summary = TaskDirSummary { parts: 0, bytes: 0 };
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summary),
            Err(e) => return Err(io_err(&dir, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir, e))? {
            if entry.file_name() == MANIFEST_FILE {
                continue;
            }
            let meta = entry.metadata().await.map_err(|e| io_err(entry.path(), e))?;
            if meta.is_file() {
                summary.parts += 1;
                summary.bytes += meta.len();
            }
        }
        Ok(summary)
    }

    /// All stored parts, name-sorted for deterministic packing.
    pub async fn read_parts(&self, task_id: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let dir = self.task_dir(task_id);
        let mut parts = Vec::new();
        let mut entries = fs::read_dir(&dir).await.map_err(|e| io_err(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == MANIFEST_FILE {
                continue;
            }
            let bytes = fs::read(entry.path())
                .await
                .map_err(|e| io_err(entry.path(), e))?;
            parts.push((name, bytes));
        }
        parts.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(parts)
    }

    /// Write the packed archive atomically (temp file + rename).
    pub async fn write_archive(&self, task_id: &str, bytes: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_err(&self.root, e))?;
        let tmp = self.root.join(format!("{task_id}.pack.tmp"));
        fs::write(&tmp, bytes).await.map_err(|e| io_err(&tmp, e))?;
        let path = self.archive_path(task_id);
        fs::rename(&tmp, &path).await.map_err(|e| io_err(&path, e))
    }

    /// Reclaim the intermediate per-part storage.
    pub async fn remove_task(&self, task_id: &str) -> Result<(), StorageError> {
        let dir = self.task_dir(task_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir, e)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
