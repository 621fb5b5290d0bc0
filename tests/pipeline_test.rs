// tests/pipeline_test.rs
//
// End-to-end routing over the in-process broker: envelopes fan out through
// a branching plan, terminal results fan back in through the completion
// tracker, and the archive appears once every part is stored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use walkway::broker::{Broker, InMemoryBroker};
use walkway::codec;
use walkway::envelope::TaskEnvelope;
use walkway::plan::{ExecutionPlan, StageNode};
use walkway::sim;
use walkway::stage::{StageAlgorithm, StageError, StageWorker};
use walkway::storage::LocalPartStore;
use walkway::topics::TopicRegistry;
use walkway::tracker::{FanInTracker, TrackerSink, unpack_archive};

/// Deterministic stage algorithm: stamps its name onto the incoming payload.
struct Stamp(&'static str);

#[async_trait]
impl StageAlgorithm for Stamp {
    fn name(&self) -> &str {
        self.0
    }

    async fn process(&self, _task_id: Uuid, payload: &[u8]) -> Result<Vec<u8>, StageError> {
        Ok(format!("{}({})", self.0, String::from_utf8_lossy(payload)).into_bytes())
    }
}

fn branching_plan() -> ExecutionPlan {
    ExecutionPlan::new(vec![
        StageNode::new(0, "track", vec![1, 2]),
        StageNode::new(1, "attr", vec![]),
        StageNode::new(2, "reid", vec![]),
    ])
    .unwrap()
}

async fn broker_with(channels: &[&str]) -> Arc<InMemoryBroker> {
    let registry = TopicRegistry::new(1);
    for channel in channels {
        registry.register(channel);
    }
    let broker = InMemoryBroker::new();
    registry.ensure_all(broker.as_ref()).await.unwrap();
    broker
}

fn sink_in(dir: &std::path::Path) -> Arc<TrackerSink> {
    Arc::new(TrackerSink::new(FanInTracker::new(LocalPartStore::new(dir))))
}

async fn wait_for_archive(store: &LocalPartStore, task_id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !store.archive_exists(task_id).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task should archive in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn branch_node_fans_out_to_both_successors() {
    let broker = broker_with(&["track", "attr", "reid"]).await;
    let mut attr_tap = broker.subscribe("attr", "tap").await.unwrap();
    let mut reid_tap = broker.subscribe("reid", "tap").await.unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let worker = Arc::new(StageWorker::new(
        "track",
        Arc::new(Stamp("track")),
        broker.clone(),
        sink_in(tmp.path()),
    ));
    let handle = worker.start().await.unwrap();

    let envelope = TaskEnvelope::new(branching_plan(), 0, b"video123".to_vec()).unwrap();
    let task_id = envelope.task_id();
    broker
        .publish(
            "track",
            envelope.routing_key().as_deref(),
            &codec::encode(&envelope),
        )
        .await
        .unwrap();

    for (tap, expected_node) in [(&mut attr_tap, 1u32), (&mut reid_tap, 2u32)] {
        let record = tokio::time::timeout(Duration::from_secs(5), tap.next())
            .await
            .expect("successor should receive a copy")
            .unwrap();
        let forwarded = codec::decode(&record.value).unwrap();
        assert_eq!(forwarded.task_id(), task_id);
        assert_eq!(forwarded.current_node_id(), expected_node);
        assert_eq!(forwarded.payload(), b"track(video123)");
        assert!(forwarded.plan().is_executed(0).unwrap());
        assert!(!forwarded.plan().is_executed(expected_node).unwrap());
    }

    handle.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn full_pipeline_fans_in_and_archives() {
    let broker = broker_with(&["track", "attr", "reid"]).await;
    let tmp = tempfile::tempdir().unwrap();
    let sink = sink_in(tmp.path());

    let mut handles = Vec::new();
    for stage in ["track", "attr", "reid"] {
        let worker = Arc::new(StageWorker::new(
            stage,
            Arc::new(Stamp(stage)),
            broker.clone(),
            sink.clone(),
        ));
        handles.push(worker.start().await.unwrap());
    }

    let envelope = TaskEnvelope::new(branching_plan(), 0, b"video123".to_vec()).unwrap();
    let task_id = envelope.task_id().to_string();
    broker
        .publish("track", Some(&task_id), &codec::encode(&envelope))
        .await
        .unwrap();

    let store = sink.tracker().store();
    wait_for_archive(store, &task_id).await;

    let packed = tokio::fs::read(store.archive_path(&task_id)).await.unwrap();
    let parts = unpack_archive(&packed).unwrap();
    assert_eq!(
        parts,
        vec![
            ("node-1".to_string(), b"attr(track(video123))".to_vec()),
            ("node-2".to_string(), b"reid(track(video123))".to_vec()),
        ]
    );
    // intermediate per-part storage reclaimed
    assert_eq!(store.summarize(&task_id).await.unwrap().parts, 0);

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_plan_archives_one_part() {
    let broker = broker_with(&["track"]).await;
    let tmp = tempfile::tempdir().unwrap();
    let sink = sink_in(tmp.path());

    let worker = Arc::new(StageWorker::new(
        "track",
        Arc::new(Stamp("track")),
        broker.clone(),
        sink.clone(),
    ));
    let handle = worker.start().await.unwrap();

    let plan = ExecutionPlan::new(vec![StageNode::new(0, "track", vec![])]).unwrap();
    let envelope = TaskEnvelope::new(plan, 0, b"clip7".to_vec()).unwrap();
    let task_id = envelope.task_id().to_string();
    broker
        .publish("track", Some(&task_id), &codec::encode(&envelope))
        .await
        .unwrap();

    let store = sink.tracker().store();
    wait_for_archive(store, &task_id).await;
    let parts = unpack_archive(&tokio::fs::read(store.archive_path(&task_id)).await.unwrap());
    assert_eq!(
        parts.unwrap(),
        vec![("node-0".to_string(), b"track(clip7)".to_vec())]
    );

    handle.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn linear_route_string_traverses_every_hop() {
    let broker = broker_with(&["track", "attr", "reid"]).await;
    let tmp = tempfile::tempdir().unwrap();
    let sink = sink_in(tmp.path());

    let mut handles = Vec::new();
    for stage in ["track", "attr", "reid"] {
        let worker = Arc::new(StageWorker::new(
            stage,
            Arc::new(Stamp(stage)),
            broker.clone(),
            sink.clone(),
        ));
        handles.push(worker.start().await.unwrap());
    }

    // legacy convention: a linear plan parsed straight from a route string
    let plan = ExecutionPlan::from_route("track|attr|reid", walkway::plan::ROUTE_DELIM).unwrap();
    let envelope = TaskEnvelope::new(plan, 0, b"video9".to_vec()).unwrap();
    let task_id = envelope.task_id().to_string();
    assert_eq!(envelope.routing_key().as_deref(), Some("track|attr|reid"));

    broker
        .publish(
            "track",
            envelope.routing_key().as_deref(),
            &codec::encode(&envelope),
        )
        .await
        .unwrap();

    let store = sink.tracker().store();
    wait_for_archive(store, &task_id).await;
    let parts = unpack_archive(&tokio::fs::read(store.archive_path(&task_id)).await.unwrap());
    assert_eq!(
        parts.unwrap(),
        vec![("node-2".to_string(), b"reid(attr(track(video9)))".to_vec())]
    );

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn simulated_stages_run_the_preset_pipeline() {
    let registry = TopicRegistry::new(1);
    sim::register_channels(&registry);
    let broker = InMemoryBroker::new();
    registry.ensure_all(broker.as_ref()).await.unwrap();

    let graph = Arc::new(walkway::storage::InMemoryGraphStore::new());
    sim::seed_gallery(graph.as_ref()).await.unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let sink = sink_in(tmp.path());

    let stages: Vec<(&str, Arc<dyn StageAlgorithm>)> = vec![
        (sim::TRACKING_CHANNEL, Arc::new(sim::FakeTracking::new(4))),
        (sim::ATTR_CHANNEL, Arc::new(sim::FakeAttrRecognizer)),
        (sim::REID_CHANNEL, Arc::new(sim::FakeReId::new(graph.clone(), 8))),
    ];
    let mut handles = Vec::new();
    for (channel, algorithm) in stages {
        let worker = Arc::new(StageWorker::new(channel, algorithm, broker.clone(), sink.clone()));
        handles.push(worker.start().await.unwrap());
    }

    let plan = ExecutionPlan::new(vec![
        StageNode::new(0, sim::TRACKING_CHANNEL, vec![1, 2]),
        StageNode::new(1, sim::ATTR_CHANNEL, vec![]),
        StageNode::new(2, sim::REID_CHANNEL, vec![]),
    ])
    .unwrap();
    let envelope = TaskEnvelope::new(plan, 0, b"video123".to_vec()).unwrap();
    let task_id = envelope.task_id().to_string();
    broker
        .publish(sim::TRACKING_CHANNEL, Some(&task_id), &codec::encode(&envelope))
        .await
        .unwrap();

    let store = sink.tracker().store();
    wait_for_archive(store, &task_id).await;

    let packed = tokio::fs::read(store.archive_path(&task_id)).await.unwrap();
    let parts = unpack_archive(&packed).unwrap();
    assert_eq!(parts.len(), 2);
    let attrs: serde_json::Value = serde_json::from_slice(&parts[0].1).unwrap();
    assert!(attrs.get("gender").is_some());

    for handle in handles {
        handle.abort();
    }
}
