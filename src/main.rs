use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::task::JoinHandle;
use tracing::info;

use walkway::broker::{Broker, InMemoryBroker};
use walkway::codec;
use walkway::config::PropertyCenter;
use walkway::envelope::TaskEnvelope;
use walkway::logger::init_tracing;
use walkway::plan::{ExecutionPlan, StageNode};
use walkway::resource::process_cache;
use walkway::sim::{self, ArtifactFeed, FakeAttrRecognizer, FakeReId, FakeTracking};
use walkway::stage::{StageAlgorithm, StageWorker};
use walkway::storage::{InMemoryGraphStore, LocalPartStore};
use walkway::topics::TopicRegistry;
use walkway::tracker::{FanInTracker, TrackerSink, unpack_archive};

#[derive(Parser, Debug)]
#[command(
    name = "walkway",
    about = "Self-routing video pedestrian analytics pipeline",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the stage workers and wait for tasks
    Run(RunArgs),

    /// Publish a preset task and wait for its archive
    Submit(SubmitArgs),

    /// Show the registered channel table
    Topics,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Properties file to load before the environment
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Log every forwarded ack
    #[arg(long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Which preset task to publish
    #[arg(value_enum)]
    preset: Preset,

    /// Task argument (video id, or `<video>:<tracklet>` for retrieval presets)
    #[arg(long)]
    arg: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Seconds to wait for the task archive before giving up
    #[arg(long, default_value = "15")]
    timeout: u64,
}

/// Canned tasks for exercising the pipeline by hand.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    /// Track pedestrians, archive the tracklets
    TrackOnly,
    /// Track, then recognize attributes and re-identify in parallel
    TrackAndRecogAttr,
    /// Retrieve a stored tracklet and recognize attributes on it
    RecogAttrOnly,
}

fn preset_task(preset: Preset, arg: Option<String>) -> anyhow::Result<TaskEnvelope> {
    let (nodes, payload) = match preset {
        Preset::TrackOnly => (
            vec![StageNode::new(0, sim::TRACKING_CHANNEL, vec![])],
            arg.unwrap_or_else(|| "video123".to_string()),
        ),
        Preset::TrackAndRecogAttr => (
            vec![
                StageNode::new(0, sim::TRACKING_CHANNEL, vec![1, 2]),
                StageNode::new(1, sim::ATTR_CHANNEL, vec![]),
                StageNode::new(2, sim::REID_CHANNEL, vec![]),
            ],
            arg.unwrap_or_else(|| "video123".to_string()),
        ),
        Preset::RecogAttrOnly => (
            vec![
                StageNode::new(0, sim::FEED_CHANNEL, vec![1]),
                StageNode::new(1, sim::ATTR_CHANNEL, vec![]),
            ],
            arg.unwrap_or_else(|| "video123:12".to_string()),
        ),
    };
    let plan = ExecutionPlan::new(nodes)?;
    Ok(TaskEnvelope::new(plan, 0, payload.into_bytes())?)
}

struct Pipeline {
    broker: Arc<InMemoryBroker>,
    sink: Arc<TrackerSink>,
    workers: Vec<JoinHandle<()>>,
}

/// Bring up the whole pipeline in this process: registry, broker channels,
/// seeded graph store, completion tracker and one worker per stage.
async fn start_pipeline(properties: &PropertyCenter) -> anyhow::Result<Pipeline> {
    let registry = TopicRegistry::new(properties.partitions);
    sim::register_channels(&registry);

    let broker = InMemoryBroker::new();
    registry.ensure_all(broker.as_ref()).await?;

    let graph = process_cache().get_or_create(InMemoryGraphStore::new);
    sim::seed_gallery(graph.as_ref()).await?;

    let tracker = FanInTracker::new(LocalPartStore::new(&properties.metadata_dir));
    let sink = Arc::new(TrackerSink::new(tracker));

    let stages: Vec<(&str, Arc<dyn StageAlgorithm>)> = vec![
        (sim::TRACKING_CHANNEL, Arc::new(FakeTracking::new(8))),
        (sim::ATTR_CHANNEL, Arc::new(FakeAttrRecognizer)),
        (sim::REID_CHANNEL, Arc::new(FakeReId::new(graph.clone(), 16))),
        (sim::FEED_CHANNEL, Arc::new(ArtifactFeed::new(graph.clone()))),
    ];

    let mut workers = Vec::with_capacity(stages.len());
    for (channel, algorithm) in stages {
        let worker = Arc::new(
            StageWorker::new(channel, algorithm, broker.clone(), sink.clone())
                .verbose(properties.verbose),
        );
        workers.push(worker.start().await?);
    }

    info!(properties = %properties, "pipeline started");
    Ok(Pipeline {
        broker,
        sink,
        workers,
    })
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref())?;
    let mut properties = PropertyCenter::load(args.env_file.as_deref());
    properties.verbose |= args.verbose;

    let pipeline = start_pipeline(&properties).await?;
    info!("workers consuming; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    for worker in &pipeline.workers {
        worker.abort();
    }
    info!("shut down {} workers", pipeline.workers.len());
    Ok(())
}

async fn submit(args: SubmitArgs) -> anyhow::Result<()> {
    let _guard = init_tracing(&args.log_level, None)?;
    let properties = PropertyCenter::load(args.env_file.as_deref());

    let pipeline = start_pipeline(&properties).await?;
    let envelope = preset_task(args.preset, args.arg)?;
    let task_id = envelope.task_id().to_string();

    let ack = pipeline
        .broker
        .publish(
            envelope.current_channel()?,
            envelope.routing_key().as_deref(),
            &codec::encode(&envelope),
        )
        .await?;
    info!(
        task = %task_id,
        channel = %ack.channel,
        partition = ack.partition,
        offset = ack.offset,
        "task submitted"
    );

    let store = pipeline.sink.tracker().store();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout);
    while !store.archive_exists(&task_id).await {
        if tokio::time::Instant::now() >= deadline {
            bail!("task {task_id} did not finish within {}s", args.timeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let packed = tokio::fs::read(store.archive_path(&task_id)).await?;
    let parts = unpack_archive(&packed)?;
    println!("task {task_id} archived with {} parts:", parts.len());
    for (name, bytes) in parts {
        println!("  {name}: {}", String::from_utf8_lossy(&bytes));
    }

    for worker in &pipeline.workers {
        worker.abort();
    }
    Ok(())
}

fn topics(properties: &PropertyCenter) {
    let registry = TopicRegistry::new(properties.partitions);
    sim::register_channels(&registry);
    println!("registered channels:");
    for name in registry.names() {
        let partitions = registry.partitions(&name).unwrap_or(1);
        println!("  {name} ({partitions} partitions)");
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Submit(args) => submit(args).await,
        Commands::Topics => {
            topics(&PropertyCenter::load(None));
            Ok(())
        }
    }
}
