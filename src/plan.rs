// src/plan.rs

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::{algo::is_cyclic_directed, graph::DiGraph};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Delimiter of the legacy linear route-string convention (`"track|attr|save"`).
pub const ROUTE_DELIM: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no node {0} in plan")]
    NodeNotFound(u32),
    #[error("node {node} appears more than once in the plan")]
    DuplicateNode { node: u32 },
    #[error("node {node} lists successor {successor}, which is not in the plan")]
    DanglingSuccessor { node: u32, successor: u32 },
    #[error("route string has no segments")]
    EmptyRoute,
}

/// One stage of a task's traversal: bound to a channel, pointing at the
/// nodes that receive this stage's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageNode {
    id: u32,
    channel: String,
    successors: Vec<u32>,
    executed: bool,
}

impl StageNode {
    pub fn new(id: u32, channel: impl Into<String>, successors: Vec<u32>) -> Self {
        Self {
            id,
            channel: channel.into(),
            successors,
            executed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Ordered successor ids. The order determines publish order, not
    /// delivery order across channels.
    pub fn successors(&self) -> &[u32] {
        &self.successors
    }

    pub fn executed(&self) -> bool {
        self.executed
    }
}

/// The DAG of stage nodes describing one task's intended traversal.
///
/// Built once at task submission and carried inside every envelope of the
/// task. Structurally immutable after construction; the only mutation is the
/// per-node `executed` flag, and that flag lives in the in-memory copy held
/// for one message, never in a distributed commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    nodes: BTreeMap<u32, StageNode>,
}

impl ExecutionPlan {
    /// Validate and build a plan. Dangling successor references and duplicate
    /// ids fail fast, before any dispatch. A cycle is reported with a warning
    /// but not rejected: the planner is trusted, and a cyclic plan routes
    /// forever (documented risk).
    pub fn new(nodes: Vec<StageNode>) -> Result<Self, PlanError> {
        let mut map = BTreeMap::new();
        for node in nodes {
            let id = node.id;
            if map.insert(id, node).is_some() {
                return Err(PlanError::DuplicateNode { node: id });
            }
        }
        for node in map.values() {
            for &successor in &node.successors {
                if !map.contains_key(&successor) {
                    return Err(PlanError::DanglingSuccessor {
                        node: node.id,
                        successor,
                    });
                }
            }
        }

        let plan = Self { nodes: map };
        if plan.has_cycle() {
            warn!("execution plan contains a cycle; tasks on it will re-visit nodes unboundedly");
        }
        Ok(plan)
    }

    /// Build a linear plan from the legacy delimiter-separated route string.
    /// Node ids are assigned in hop order starting at 0.
    pub fn from_route(route: &str, delim: char) -> Result<Self, PlanError> {
        let segments: Vec<&str> = route.split(delim).filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(PlanError::EmptyRoute);
        }
        let last = segments.len() - 1;
        let nodes = segments
            .iter()
            .enumerate()
            .map(|(i, channel)| {
                let successors = if i == last { vec![] } else { vec![i as u32 + 1] };
                StageNode::new(i as u32, *channel, successors)
            })
            .collect();
        Self::new(nodes)
    }

    pub fn node(&self, id: u32) -> Result<&StageNode, PlanError> {
        self.nodes.get(&id).ok_or(PlanError::NodeNotFound(id))
    }

    pub fn channel_of(&self, id: u32) -> Result<&str, PlanError> {
        Ok(self.node(id)?.channel())
    }

    pub fn successors(&self, id: u32) -> Result<&[u32], PlanError> {
        Ok(self.node(id)?.successors())
    }

    /// Idempotent: marking an already-executed node is a no-op.
    pub fn mark_executed(&mut self, id: u32) -> Result<(), PlanError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(PlanError::NodeNotFound(id))?;
        node.executed = true;
        Ok(())
    }

    pub fn is_executed(&self, id: u32) -> Result<bool, PlanError> {
        Ok(self.node(id)?.executed())
    }

    /// Nodes with no successors. Their results leave the pipeline through the
    /// terminal persistence collaborator, so this is also the number of parts
    /// the fan-in tracker expects for a task on this plan.
    pub fn leaves(&self) -> Vec<u32> {
        self.nodes
            .values()
            .filter(|n| n.successors.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Render the forward chain from `from` back into the legacy route-string
    /// form: the current hop's channel followed by every hop reachable while
    /// exactly one successor remains. Stops at a branch or a leaf.
    pub fn remaining_route(&self, from: u32, delim: char) -> Result<String, PlanError> {
        let mut segments = vec![self.node(from)?.channel().to_string()];
        let mut visited = HashSet::from([from]);
        let mut current = from;
        loop {
            let successors = self.successors(current)?;
            if successors.len() != 1 || !visited.insert(successors[0]) {
                break;
            }
            current = successors[0];
            segments.push(self.node(current)?.channel().to_string());
        }
        Ok(segments.join(&delim.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn has_cycle(&self) -> bool {
        let mut graph: DiGraph<u32, ()> = DiGraph::new();
        let mut index_of = HashMap::new();
        for &id in self.nodes.keys() {
            index_of.insert(id, graph.add_node(id));
        }
        for node in self.nodes.values() {
            for successor in &node.successors {
                graph.add_edge(index_of[&node.id], index_of[successor], ());
            }
        }
        is_cyclic_directed(&graph)
    }
}
