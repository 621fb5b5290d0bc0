// src/envelope.rs

use uuid::Uuid;

use crate::plan::{ExecutionPlan, PlanError, ROUTE_DELIM};

/// The mutable unit traveling between hops: a task id stable across all
/// hops, the full plan, the node the envelope is currently addressed to, and
/// the previous stage's result as opaque bytes.
///
/// Created at submission, rewritten at every hop, gone once a terminal node
/// hands its result to the persistence collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
    task_id: Uuid,
    plan: ExecutionPlan,
    current_node_id: u32,
    payload: Vec<u8>,
}

impl TaskEnvelope {
    /// Mint a new task addressed at `entry`. Fails if `entry` is not in the plan.
    pub fn new(plan: ExecutionPlan, entry: u32, payload: Vec<u8>) -> Result<Self, PlanError> {
        Self::from_parts(Uuid::new_v4(), plan, entry, payload)
    }

    pub fn from_parts(
        task_id: Uuid,
        plan: ExecutionPlan,
        current_node_id: u32,
        payload: Vec<u8>,
    ) -> Result<Self, PlanError> {
        plan.node(current_node_id)?;
        Ok(Self {
            task_id,
            plan,
            current_node_id,
            payload,
        })
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn current_node_id(&self) -> u32 {
        self.current_node_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn current_channel(&self) -> Result<&str, PlanError> {
        self.plan.channel_of(self.current_node_id)
    }

    pub fn mark_current_executed(&mut self) -> Result<(), PlanError> {
        self.plan.mark_executed(self.current_node_id)
    }

    /// Re-address the envelope at a successor for the next hop.
    pub fn advance(&mut self, successor: u32) -> Result<(), PlanError> {
        self.plan.node(successor)?;
        self.current_node_id = successor;
        Ok(())
    }

    /// The remaining routing descriptor under the legacy string convention,
    /// carried in the message key by a subset of producers.
    pub fn routing_key(&self) -> Option<String> {
        self.plan.remaining_route(self.current_node_id, ROUTE_DELIM).ok()
    }
}
