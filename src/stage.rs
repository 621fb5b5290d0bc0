// src/stage.rs

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{Ack, Broker, PublishError, Subscription};
use crate::codec;
use crate::envelope::TaskEnvelope;
use crate::plan::PlanError;
use crate::storage::StorageError;

/// Failure of the pluggable algorithm behind a stage. Propagated to the
/// consume loop, which relies on broker redelivery; algorithms must
/// therefore be safe to repeat.
#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {reason}")]
pub struct StageError {
    stage: String,
    reason: String,
}

impl StageError {
    pub fn new(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

/// Everything that can go wrong while routing one envelope.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The vision algorithm bound to a stage. Opaque to the router: it sees the
/// previous stage's payload and returns its own result bytes.
#[async_trait]
pub trait StageAlgorithm: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, task_id: Uuid, payload: &[u8]) -> Result<Vec<u8>, StageError>;
}

/// Terminal persistence collaborator: receives the result of a node with no
/// successors, exactly once per handled envelope.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, envelope: &TaskEnvelope, result: &[u8]) -> Result<(), StorageError>;
}

/// The generic per-stage loop. One worker binds one channel to one
/// algorithm: receive, decode, invoke, mark the node executed, then fan the
/// result out to every successor channel — or hand it to the sink when the
/// plan ends here.
pub struct StageWorker {
    channel: String,
    algorithm: Arc<dyn StageAlgorithm>,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn ResultSink>,
    verbose: bool,
}

impl StageWorker {
    pub fn new(
        channel: impl Into<String>,
        algorithm: Arc<dyn StageAlgorithm>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            channel: channel.into(),
            algorithm,
            broker,
            sink,
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subscribe this worker's channel and spawn its consume loop.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>, PublishError> {
        let group = format!("{}-worker", self.channel);
        let subscription = self.broker.subscribe(&self.channel, &group).await?;
        Ok(tokio::spawn(async move { self.run(subscription).await }))
    }

    /// Consume until the subscription closes. A record that fails to decode
    /// is unrecoverable for this message: logged and dropped. Any other
    /// failure is logged and left to broker redelivery — every step here is
    /// safe to repeat.
    pub async fn run(&self, mut subscription: Box<dyn Subscription>) {
        info!(channel = %self.channel, stage = self.algorithm.name(), "stage worker consuming");
        while let Some(record) = subscription.next().await {
            let envelope = match codec::decode(&record.value) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        channel = %record.channel,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "dropping undecodable envelope"
                    );
                    continue;
                }
            };
            if let Err(e) = self.handle_envelope(envelope).await {
                error!(
                    channel = %record.channel,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "stage failed, awaiting redelivery"
                );
            }
        }
    }

    /// Route one decoded envelope. Returns the acks of every forwarded copy;
    /// an empty list means the result went to the terminal sink.
    pub async fn handle_envelope(
        &self,
        mut envelope: TaskEnvelope,
    ) -> Result<Vec<Ack>, RouteError> {
        let result = self
            .algorithm
            .process(envelope.task_id(), envelope.payload())
            .await?;

        envelope.mark_current_executed()?;
        let successors = envelope
            .plan()
            .successors(envelope.current_node_id())?
            .to_vec();

        if successors.is_empty() {
            self.sink.deliver(&envelope, &result).await?;
            return Ok(Vec::new());
        }

        let mut acks = Vec::with_capacity(successors.len());
        for successor in successors {
            let mut forward = envelope.clone();
            forward.advance(successor)?;
            forward.set_payload(result.clone());

            let key = forward.routing_key();
            let channel = forward.current_channel()?.to_string();
            let ack = self
                .broker
                .publish(&channel, key.as_deref(), &codec::encode(&forward))
                .await?;
            if self.verbose {
                info!(
                    task = %forward.task_id(),
                    channel = %ack.channel,
                    partition = ack.partition,
                    offset = ack.offset,
                    "forwarded to successor"
                );
            }
            acks.push(ack);
        }
        Ok(acks)
    }
}
