//! Runtime wiring between a flow's stages and its pub/sub bus.
//!
//! The coordinator does not interpret messages; it plumbs stage output
//! channels onto publish subjects, publish subjects onto stage input
//! channels, and the flow's own input/output channels onto both. Startup
//! order matters: every subscription is installed before the first pump
//! starts, so no message can be published before its subscribers exist.
//!
//! Shutdown is strictly ordered: stop ingress, then tear stages down in
//! topological order — cancel the subscriptions feeding a stage, close
//! its input, join it, then join its pumps so everything it emitted
//! drains through still-live downstream subscriptions — and only then
//! close the flow's own output and trace channels.

use std::sync::Arc;

use fxhash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::msg::{Inbound, Message, Outbound};
use crate::pubsub::{PubSub, SubscriptionGuard};
use crate::stage::{Stage, StageChans, StageError, TraceEvent, DEFAULT_CHANNEL_CAPACITY};
use crate::subject::WILDCARD_ANY;
use crate::supervisor::{supervise, RetryPolicy};

use super::{stage_port_from_subject, stage_subject, Connection};

/// Everything the coordinator needs to run one flow.
pub(super) struct Config {
    pub flow_id: String,
    pub pubsub: Arc<PubSub>,
    pub stages: Vec<Box<dyn Stage>>,
    pub stage_order: Vec<String>,
    pub stage_conns: Vec<Connection>,
    pub flow_conns: Vec<Connection>,
    pub flow_input: mpsc::Receiver<Inbound>,
    pub flow_output: mpsc::Sender<Outbound>,
    pub flow_trace: Option<mpsc::Sender<TraceEvent>>,
    pub policy: RetryPolicy,
}

/// Runs the flow to completion. See the module docs for the startup and
/// shutdown ordering this enforces.
pub(super) async fn run(config: Config, ctx: CancellationToken) -> Result<(), StageError> {
    let Config {
        flow_id,
        pubsub,
        stages,
        stage_order,
        stage_conns,
        flow_conns,
        mut flow_input,
        flow_output,
        flow_trace,
        policy,
    } = config;

    // -- Wire stage channels. Stages get a trace channel only when the
    // flow itself has one; otherwise nothing would drain them.
    let mut stage_inputs: FxHashMap<String, mpsc::Sender<Inbound>> = FxHashMap::default();
    let mut outputs: Vec<(String, mpsc::Receiver<Outbound>)> = Vec::new();
    let mut traces: Vec<(String, mpsc::Receiver<TraceEvent>)> = Vec::new();
    let mut wired: Vec<Box<dyn Stage>> = Vec::with_capacity(stages.len());
    for mut stage in stages {
        let (chans, handles) = StageChans::bounded(DEFAULT_CHANNEL_CAPACITY, flow_trace.is_some());
        stage.connect(chans);
        let sid = stage.id().to_string();
        stage_inputs.insert(sid.clone(), handles.input);
        outputs.push((sid.clone(), handles.output));
        if let Some(trace_rx) = handles.trace {
            traces.push((sid, trace_rx));
        }
        wired.push(stage);
    }

    // -- Stage-to-stage subscriptions. Each handler captures its own
    // connection and the destination's input sender.
    let mut stage_subs: FxHashMap<String, Vec<SubscriptionGuard>> = FxHashMap::default();
    for conn in &stage_conns {
        let subject = stage_subject(&flow_id, &conn.from.stage, &conn.from.port);
        let Some(input) = stage_inputs.get(&conn.to.stage) else {
            // Connections are validated against the stage set at
            // construction.
            continue;
        };
        let input = input.clone();
        let to = conn.to.clone();
        let guard = pubsub
            .subscribe(&subject, move |_subject: String, msg: Message| {
                let input = input.clone();
                let to = to.clone();
                async move {
                    if input.send(msg.to(to)).await.is_err() {
                        tracing::warn!("destination stage stopped; dropping message");
                    }
                }
            })
            .map_err(StageError::permanent)?;
        stage_subs
            .entry(conn.to.stage.clone())
            .or_default()
            .push(guard);
    }

    // -- Stage-to-flow-output subscriptions. A `*` in the destination is
    // substituted per message from the emitter's subject.
    let mut flow_subs: Vec<SubscriptionGuard> = Vec::new();
    for conn in &flow_conns {
        let subject = stage_subject(&flow_id, &conn.from.stage, &conn.from.port);
        let out = flow_output.clone();
        let to = conn.to.clone();
        let guard = pubsub
            .subscribe(&subject, move |subject: String, msg: Message| {
                let out = out.clone();
                let mut to = to.clone();
                async move {
                    if to.stage == WILDCARD_ANY || to.port == WILDCARD_ANY {
                        if let Some((stage, port)) = stage_port_from_subject(&subject) {
                            if to.stage == WILDCARD_ANY {
                                to.stage = stage;
                            }
                            if to.port == WILDCARD_ANY {
                                to.port = port;
                            }
                        }
                    }
                    if out.send(Outbound::new(msg, to)).await.is_err() {
                        tracing::warn!("flow output closed; dropping message");
                    }
                }
            })
            .map_err(StageError::permanent)?;
        flow_subs.push(guard);
    }

    // -- Output pumps: drain each stage's output channel onto its
    // subject. These run until the stage drops its output sender.
    let mut out_pumps: FxHashMap<String, JoinHandle<()>> = FxHashMap::default();
    for (sid, mut rx) in outputs {
        let pubsub = Arc::clone(&pubsub);
        let flow_id = flow_id.clone();
        out_pumps.insert(
            sid,
            tokio::spawn(async move {
                while let Some(out) = rx.recv().await {
                    let subject = stage_subject(&flow_id, &out.addr.stage, &out.addr.port);
                    if let Err(err) = pubsub.publish(&subject, out.msg).await {
                        tracing::warn!(error = %err, subject, "stage emitted unpublishable address");
                    }
                }
            }),
        );
    }

    // -- Trace pumps: forward stage trace events onto the flow's trace
    // channel. `traces` is empty when the flow has no trace channel.
    let mut trace_pumps: FxHashMap<String, JoinHandle<()>> = FxHashMap::default();
    for (sid, mut rx) in traces {
        let Some(out) = flow_trace.clone() else {
            break;
        };
        trace_pumps.insert(
            sid,
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let _ = out.send(event).await;
                }
            }),
        );
    }

    // Cancelled when the parent context cancels, or explicitly on
    // permanent failure to stop ingress and siblings.
    let local = ctx.child_token();

    // -- Flow-input pump. Started only after all subscriptions above are
    // installed, so early emissions cannot be lost.
    let pump_inputs = stage_inputs.clone();
    let pump_token = local.clone();
    let mut input_pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = flow_input.recv() => match maybe {
                    Some(inbound) => match pump_inputs.get(&inbound.addr.stage) {
                        Some(tx) => {
                            if tx.send(inbound).await.is_err() {
                                tracing::warn!("stage input closed; dropping message");
                            }
                        }
                        None => {
                            tracing::warn!(stage = %inbound.addr.stage, "inbound message for unknown stage");
                        }
                    },
                    None => break,
                },
                () = pump_token.cancelled() => break,
            }
        }
    });

    // -- Stage supervisors, one task per stage. A permanent failure is
    // signalled so the flow can react before joining everything.
    let (fail_tx, mut fail_rx) = mpsc::channel::<String>(wired.len().max(1));
    let mut stage_tasks: FxHashMap<String, JoinHandle<Result<(), StageError>>> =
        FxHashMap::default();
    for mut stage in wired {
        let token = local.child_token();
        let policy = policy.clone();
        let fail_tx = fail_tx.clone();
        let sid = stage.id().to_string();
        let task_sid = sid.clone();
        stage_tasks.insert(
            sid,
            tokio::spawn(async move {
                let result = supervise(stage.as_mut(), token, &policy).await;
                if result.is_err() {
                    let _ = fail_tx.send(task_sid).await;
                }
                result
                // The stage drops here, closing its output and trace
                // channels so the pumps can finish draining.
            }),
        );
    }
    drop(fail_tx);

    // -- Wait for an exit trigger: permanent stage failure, all stages
    // done, or ingress ending (flow input closed, or context cancelled —
    // `local` is a child token, so cancellation stops the pump too).
    tokio::select! {
        maybe = fail_rx.recv() => {
            if let Some(sid) = maybe {
                tracing::error!(flow = %flow_id, stage = %sid, "stage failed permanently; stopping flow");
            }
            local.cancel();
            let _ = (&mut input_pump).await;
        }
        _ = &mut input_pump => {}
    }

    // -- Drain, in topological order of the stage connections: upstream
    // stages quiesce first and their emissions flow through the
    // still-subscribed downstream stages.
    let mut result: Result<(), StageError> = Ok(());
    for sid in &stage_order {
        if let Some(guards) = stage_subs.remove(sid) {
            drop(guards);
        }
        drop(stage_inputs.remove(sid));
        if let Some(task) = stage_tasks.remove(sid) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(join_err) => {
                    if result.is_ok() {
                        result = Err(StageError::permanent(format!(
                            "stage {sid} task failed: {join_err}"
                        )));
                    }
                }
            }
        }
        if let Some(pump) = out_pumps.remove(sid) {
            let _ = pump.await;
        }
        if let Some(pump) = trace_pumps.remove(sid) {
            let _ = pump.await;
        }
    }

    // Flow-output subscriptions stay live until every publisher has
    // drained; only now do the flow's own channels close.
    drop(flow_subs);
    drop(flow_output);
    drop(flow_trace);

    result
}
