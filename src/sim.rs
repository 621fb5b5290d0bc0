// src/sim.rs
//
// Stand-ins for the vision algorithms, which live outside this repo. They
// produce plausible randomized results so the whole pipeline can run and be
// tested without a GPU in sight.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use uuid::Uuid;

use crate::stage::{StageAlgorithm, StageError};
use crate::storage::GraphStore;
use crate::topics::TopicRegistry;

pub const TRACKING_CHANNEL: &str = "pedestrian-tracking";
pub const ATTR_CHANNEL: &str = "pedestrian-attr";
pub const REID_CHANNEL: &str = "pedestrian-reid";
pub const FEED_CHANNEL: &str = "artifact-feed";

/// Register every channel the simulated stages consume.
pub fn register_channels(registry: &TopicRegistry) {
    for channel in [TRACKING_CHANNEL, ATTR_CHANNEL, REID_CHANNEL, FEED_CHANNEL] {
        registry.register(channel);
    }
}

fn to_result(value: serde_json::Value, stage: &str) -> Result<Vec<u8>, StageError> {
    serde_json::to_vec(&value).map_err(|e| StageError::new(stage, e.to_string()))
}

/// Tracks pedestrians in a video named by the payload.
pub struct FakeTracking {
    max_tracklets: usize,
}

impl FakeTracking {
    pub fn new(max_tracklets: usize) -> Self {
        Self {
            max_tracklets: max_tracklets.max(1),
        }
    }
}

#[async_trait]
impl StageAlgorithm for FakeTracking {
    fn name(&self) -> &str {
        "fake-tracking"
    }

    async fn process(&self, _task_id: Uuid, payload: &[u8]) -> Result<Vec<u8>, StageError> {
        let video = String::from_utf8_lossy(payload).to_string();
        let mut rng = rand::rng();
        let tracklets: Vec<_> = (0..rng.random_range(1..=self.max_tracklets))
            .map(|id| {
                json!({
                    "id": id,
                    "start_frame": rng.random_range(0..3_000u32),
                    "bounding_boxes": rng.random_range(1..64u32),
                })
            })
            .collect();
        to_result(json!({ "video": video, "tracklets": tracklets }), self.name())
    }
}

/// Recognizes wearable attributes on whatever tracklets it is handed.
pub struct FakeAttrRecognizer;

#[async_trait]
impl StageAlgorithm for FakeAttrRecognizer {
    fn name(&self) -> &str {
        "fake-attr-recognizer"
    }

    async fn process(&self, _task_id: Uuid, _payload: &[u8]) -> Result<Vec<u8>, StageError> {
        let mut rng = rand::rng();
        let genders = ["male", "female", "unknown"];
        let colors = ["black", "white", "red", "blue", "green"];
        to_result(
            json!({
                "gender": genders[rng.random_range(0..genders.len())],
                "upper_color": colors[rng.random_range(0..colors.len())],
                "lower_color": colors[rng.random_range(0..colors.len())],
                "carrying_bag": rng.random_bool(0.5),
            }),
            self.name(),
        )
    }
}

/// Ranks gallery pedestrians against the task's subject and records the
/// similarity edge in the graph store.
pub struct FakeReId {
    graph: Arc<dyn GraphStore>,
    gallery_size: usize,
}

impl FakeReId {
    pub fn new(graph: Arc<dyn GraphStore>, gallery_size: usize) -> Self {
        Self {
            graph,
            gallery_size: gallery_size.max(1),
        }
    }
}

#[async_trait]
impl StageAlgorithm for FakeReId {
    fn name(&self) -> &str {
        "fake-reid"
    }

    async fn process(&self, task_id: Uuid, _payload: &[u8]) -> Result<Vec<u8>, StageError> {
        let mut ranking: Vec<usize> = (0..self.gallery_size).collect();
        let (best, similarity): (usize, f64) = {
            let mut rng = rand::rng();
            let best = rng.random_range(0..self.gallery_size);
            let similarity = rng.random_range(0.5..1.0);
            (best, similarity)
        };
        ranking.swap(0, best);

        self.graph
            .record_relationship(&task_id.to_string(), &format!("gallery-{best}"), similarity)
            .await
            .map_err(|e| StageError::new(self.name(), e.to_string()))?;

        to_result(json!({ "ranking": ranking, "top_similarity": similarity }), self.name())
    }
}

/// Feeds a stored artifact back into the pipeline: the payload names it as
/// `"<video>:<tracklet>"`, the result is the artifact itself.
pub struct ArtifactFeed {
    graph: Arc<dyn GraphStore>,
}

impl ArtifactFeed {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl StageAlgorithm for ArtifactFeed {
    fn name(&self) -> &str {
        "artifact-feed"
    }

    async fn process(&self, _task_id: Uuid, payload: &[u8]) -> Result<Vec<u8>, StageError> {
        let id = String::from_utf8_lossy(payload).trim().to_string();
        self.graph
            .retrieve(&id)
            .await
            .map_err(|e| StageError::new(self.name(), e.to_string()))
    }
}

/// Preload the graph store with a handful of retrievable artifacts, the way
/// a populated deployment would already have them.
pub async fn seed_gallery(graph: &dyn GraphStore) -> Result<(), crate::storage::StorageError> {
    for tracklet in [12, 34, 56] {
        let id = format!("video123:{tracklet}");
        let artifact = serde_json::to_vec(&json!({
            "video": "video123",
            "tracklet": tracklet,
            "frames": 42,
        }))
        .map_err(|e| crate::storage::StorageError::MalformedPart(e.to_string()))?;
        graph.store(&id, artifact).await?;
    }
    Ok(())
}
