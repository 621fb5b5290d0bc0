// src/tracker.rs

use async_trait::async_trait;
use tracing::{debug, info};

use crate::codec;
use crate::envelope::TaskEnvelope;
use crate::stage::ResultSink;
use crate::storage::{LocalPartStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanInStatus {
    /// Parts are still missing.
    Pending { stored: usize, expected: usize },
    /// This delivery completed the task and the finalize action ran.
    Finalized { parts: usize },
    /// The task was finalized by an earlier delivery; this one was a no-op.
    AlreadyFinalized,
}

/// Accumulates the N partial results of one task, N declared by the first
/// part received. Every part is stored durably on arrival; completion is
/// recomputed by scanning durable storage rather than counting in memory,
/// so a crashed-and-restarted tracker picks up exactly where the directory
/// tree says it was. The cost is one scan per arrival, and the scan can race
/// when two parts of one task land on two workers at once — finalize is
/// idempotent precisely so that race stays harmless.
pub struct FanInTracker {
    store: LocalPartStore,
}

impl FanInTracker {
    pub fn new(store: LocalPartStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LocalPartStore {
        &self.store
    }

    /// Store one part and re-derive completion. Re-delivering a part the
    /// store already holds overwrites it in place and never changes the
    /// count.
    pub async fn deliver(
        &self,
        task_id: &str,
        part_id: &str,
        expected_parts: usize,
        bytes: &[u8],
    ) -> Result<FanInStatus, StorageError> {
        if self.store.archive_exists(task_id).await {
            debug!(task_id, part_id, "part re-delivered after finalize, ignoring");
            return Ok(FanInStatus::AlreadyFinalized);
        }

        let manifest = self.store.declare(task_id, expected_parts).await?;
        self.store.write_part(task_id, part_id, bytes).await?;

        let summary = self.store.summarize(task_id).await?;
        if summary.parts < manifest.expected_parts {
            debug!(
                task_id,
                stored = summary.parts,
                expected = manifest.expected_parts,
                "task still waiting for parts"
            );
            return Ok(FanInStatus::Pending {
                stored: summary.parts,
                expected: manifest.expected_parts,
            });
        }

        self.finalize(task_id).await?;
        Ok(FanInStatus::Finalized {
            parts: summary.parts,
        })
    }

    /// Pack every stored part into one compressed block-chain archive and
    /// reclaim the intermediate directory. Safe to run more than once: an
    /// existing archive short-circuits.
    async fn finalize(&self, task_id: &str) -> Result<(), StorageError> {
        if self.store.archive_exists(task_id).await {
            return Ok(());
        }

        let parts = self.store.read_parts(task_id).await?;
        let names: Vec<&str> = parts.iter().map(|(name, _)| name.as_str()).collect();
        let index = serde_json::to_vec(&names)
            .map_err(|e| StorageError::MalformedPart(e.to_string()))?;

        let mut chain = Vec::new();
        for (_, bytes) in parts.iter().rev() {
            chain = codec::prepend(bytes, &chain).to_vec();
        }
        chain = codec::prepend(&index, &chain).to_vec();

        self.store
            .write_archive(task_id, &codec::compress(&chain))
            .await?;
        self.store.remove_task(task_id).await?;
        info!(task_id, parts = parts.len(), "task archived");
        Ok(())
    }
}

/// Read a packed archive back into named parts.
pub fn unpack_archive(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
    let chain = codec::decompress(bytes).map_err(|e| StorageError::MalformedPart(e.to_string()))?;
    let blocks = codec::split_all(&chain).map_err(|e| StorageError::MalformedPart(e.to_string()))?;
    let Some((index, parts)) = blocks.split_first() else {
        return Err(StorageError::MalformedPart("archive has no index".into()));
    };
    let names: Vec<String> = serde_json::from_slice(index)
        .map_err(|e| StorageError::MalformedPart(e.to_string()))?;
    if names.len() != parts.len() {
        return Err(StorageError::MalformedPart(format!(
            "index lists {} parts, archive holds {}",
            names.len(),
            parts.len()
        )));
    }
    Ok(names
        .into_iter()
        .zip(parts.iter().map(|b| b.to_vec()))
        .collect())
}

/// Terminal persistence collaborator for stage workers: results of nodes
/// with no successors land here. The part id is derived from the terminal
/// node, and the declared total is the number of leaves in the task's plan.
pub struct TrackerSink {
    tracker: FanInTracker,
}

impl TrackerSink {
    pub fn new(tracker: FanInTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &FanInTracker {
        &self.tracker
    }
}

#[async_trait]
impl ResultSink for TrackerSink {
    async fn deliver(&self, envelope: &TaskEnvelope, result: &[u8]) -> Result<(), StorageError> {
        let task_id = envelope.task_id().to_string();
        let part_id = format!("node-{}", envelope.current_node_id());
        let expected = envelope.plan().leaves().len();
        let status = self
            .tracker
            .deliver(&task_id, &part_id, expected, result)
            .await?;
        debug!(task_id, part_id, ?status, "terminal result stored");
        Ok(())
    }
}
