//! Flows: supervised containers of connected stages.
//!
//! A [`Flow`] owns a set of stages, the connections among them, and the
//! connections that expose internal stage ports as flow outputs. A flow
//! is itself a [`Stage`], so flows compose. All intra-flow traffic is
//! published on subjects of the form
//! `flow.<flowID>.stage.<stageID>.port.<portID>`.

mod coordinator;


use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use fxhash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;

use crate::msg::Addr;
use crate::pubsub::PubSub;
use crate::stage::{Stage, StageChans, StageCore, StageError};
use crate::subject::{is_valid_token, DELIMITER, WILDCARD_ANY};
use crate::supervisor::RetryPolicy;

/// Builds the publish subject for a stage port inside a flow.
#[must_use]
pub fn stage_subject(flow: &str, stage: &str, port: &str) -> String {
    format!("flow.{flow}.stage.{stage}.port.{port}")
}

/// Recovers `(stage, port)` from an intra-flow publish subject.
fn stage_port_from_subject(subject: &str) -> Option<(String, String)> {
    let tokens: Vec<&str> = subject.split(DELIMITER).collect();
    match tokens.as_slice() {
        ["flow", _, "stage", stage, "port", port] => {
            Some(((*stage).to_string(), (*port).to_string()))
        }
        _ => None,
    }
}

/// A directed connection between two addresses.
///
/// Stage connections route one stage's output port to another stage's
/// input port. Flow connections route an internal stage's output port to
/// an externally visible address on the enclosing flow; there, either
/// field of `to` may be the wildcard `*`, meaning "carry through the
/// corresponding field of the emitter's address".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Source address.
    pub from: Addr,
    /// Destination address.
    pub to: Addr,
}

impl Connection {
    /// Creates a connection.
    #[must_use]
    pub fn new(from: Addr, to: Addr) -> Self {
        Self { from, to }
    }

    /// A connection from an address to itself, exposing a stage output as
    /// a flow output under the same address.
    #[must_use]
    pub fn self_conn(addr: Addr) -> Self {
        Self {
            from: addr.clone(),
            to: addr,
        }
    }
}

/// Errors from flow construction.
///
/// All validation happens in [`Flow::new`]; a failed construction starts
/// no tasks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// Two stages share an id.
    #[error("duplicate stage id: {0:?}")]
    DuplicateStage(String),

    /// A stage carries the flow's own id; a flow cannot contain itself.
    #[error("stage id {0:?} collides with the flow id")]
    StageIsFlow(String),

    /// A flow or stage id is not usable as a subject token.
    #[error("invalid identifier {0:?}: must be a single subject token")]
    InvalidIdentifier(String),

    /// A port name is not usable in a subject.
    #[error("invalid port in connection endpoint {0}")]
    InvalidPort(Addr),

    /// A stage connection endpoint names a stage the flow does not contain.
    #[error("stage connection references unknown stage: {0}")]
    UnknownStage(Addr),

    /// A flow connection source names a stage the flow does not contain.
    #[error("flow connection source references unknown stage: {0}")]
    UnknownFlowSource(Addr),

    /// The stage connections contain a cycle involving the named stage.
    #[error("stage connections contain a cycle involving {0:?}")]
    CycleDetected(String),
}

/// A named, supervised collection of connected stages.
pub struct Flow {
    core: StageCore,
    pubsub: Arc<PubSub>,
    stages: Vec<Box<dyn Stage>>,
    /// Stage ids in topological order of the stage connections; drives
    /// the shutdown drain.
    stage_order: Vec<String>,
    stage_conns: Vec<Connection>,
    flow_conns: Vec<Connection>,
    policy: RetryPolicy,
}

impl Flow {
    /// Validates and assembles a flow. No tasks are started; wiring
    /// happens when the flow is served.
    ///
    /// # Errors
    ///
    /// Returns a [`FlowError`] if any id is not a subject token, stage
    /// ids collide (with each other or the flow), a connection references
    /// an unknown stage, or the stage connections contain a cycle.
    pub fn new(
        id: impl Into<String>,
        pubsub: Arc<PubSub>,
        stages: Vec<Box<dyn Stage>>,
        stage_conns: Vec<Connection>,
        flow_conns: Vec<Connection>,
    ) -> Result<Self, FlowError> {
        let id = id.into();
        if !is_valid_token(&id) {
            return Err(FlowError::InvalidIdentifier(id));
        }

        let mut ids = FxHashSet::default();
        for stage in &stages {
            let sid = stage.id().to_string();
            if !is_valid_token(&sid) {
                return Err(FlowError::InvalidIdentifier(sid));
            }
            if sid == id {
                return Err(FlowError::StageIsFlow(sid));
            }
            if !ids.insert(sid.clone()) {
                return Err(FlowError::DuplicateStage(sid));
            }
        }

        for conn in &stage_conns {
            for addr in [&conn.from, &conn.to] {
                if !ids.contains(addr.stage.as_str()) {
                    return Err(FlowError::UnknownStage(addr.clone()));
                }
            }
            // The source port becomes a subscription pattern token, so a
            // wildcard is meaningful there; the destination is literal.
            if !is_valid_token(&conn.from.port) && conn.from.port != WILDCARD_ANY {
                return Err(FlowError::InvalidPort(conn.from.clone()));
            }
            if !is_valid_token(&conn.to.port) {
                return Err(FlowError::InvalidPort(conn.to.clone()));
            }
        }

        for conn in &flow_conns {
            if !ids.contains(conn.from.stage.as_str()) {
                return Err(FlowError::UnknownFlowSource(conn.from.clone()));
            }
            if !is_valid_token(&conn.from.port) && conn.from.port != WILDCARD_ANY {
                return Err(FlowError::InvalidPort(conn.from.clone()));
            }
            for field in [&conn.to.stage, &conn.to.port] {
                if !is_valid_token(field) && field != WILDCARD_ANY {
                    return Err(FlowError::InvalidPort(conn.to.clone()));
                }
            }
        }

        let stage_order = topological_order(&stages, &stage_conns)?;

        Ok(Self {
            core: StageCore::new(id),
            pubsub,
            stages,
            stage_order,
            stage_conns,
            flow_conns,
            policy: RetryPolicy::default(),
        })
    }

    /// Overrides the restart policy applied to this flow's stages.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The ids of the flow's stages in the order they are drained.
    #[must_use]
    pub fn stage_ids(&self) -> &[String] {
        &self.stage_order
    }
}

#[async_trait]
impl Stage for Flow {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn connect(&mut self, chans: StageChans) {
        self.core.connect(chans);
    }

    async fn serve(&mut self, ctx: CancellationToken) -> Result<(), StageError> {
        let Some(input) = self.core.take_input() else {
            return Err(StageError::NotConnected);
        };
        let Some(output) = self.core.take_output() else {
            return Err(StageError::NotConnected);
        };
        let trace = self.core.take_trace();

        let stages = std::mem::take(&mut self.stages);
        coordinator::run(coordinator::Config {
            flow_id: self.core.id().to_string(),
            pubsub: Arc::clone(&self.pubsub),
            stages,
            stage_order: self.stage_order.clone(),
            stage_conns: self.stage_conns.clone(),
            flow_conns: self.flow_conns.clone(),
            flow_input: input,
            flow_output: output,
            flow_trace: trace,
            policy: self.policy.clone(),
        }, ctx)
        .await
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.core.id())
            .field("stages", &self.stage_order)
            .field("stage_conns", &self.stage_conns.len())
            .field("flow_conns", &self.flow_conns.len())
            .finish_non_exhaustive()
    }
}

/// Kahn's algorithm over the stage-connection graph; sorted queues make
/// the order deterministic.
fn topological_order(
    stages: &[Box<dyn Stage>],
    conns: &[Connection],
) -> Result<Vec<String>, FlowError> {
    let mut in_degree: FxHashMap<&str, usize> = FxHashMap::default();
    let mut successors: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for stage in stages {
        in_degree.entry(stage.id()).or_insert(0);
    }
    for conn in conns {
        // Parallel edges between the same pair count once.
        let entry = successors.entry(conn.from.stage.as_str()).or_default();
        if !entry.contains(&conn.to.stage.as_str()) {
            entry.push(conn.to.stage.as_str());
            *in_degree.entry(conn.to.stage.as_str()).or_insert(0) += 1;
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter_map(|(id, deg)| (*deg == 0).then_some(*id))
        .collect();
    ready.sort_unstable();
    let mut queue: VecDeque<&str> = ready.into();

    let mut order = Vec::with_capacity(stages.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        let mut unblocked = Vec::new();
        for next in successors.get(id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    unblocked.push(*next);
                }
            }
        }
        unblocked.sort_unstable();
        queue.extend(unblocked);
    }

    if order.len() < stages.len() {
        let ordered: FxHashSet<&str> = order.iter().map(String::as_str).collect();
        let stuck = stages
            .iter()
            .map(|s| s.id())
            .find(|id| !ordered.contains(id))
            .unwrap_or_default();
        return Err(FlowError::CycleDetected(stuck.to_string()));
    }
    Ok(order)
}
