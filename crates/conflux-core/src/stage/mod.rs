//! The stage contract: identity, channel wiring, and the serve loop.
//!
//! A stage processes [`Inbound`] messages from its input channel and emits
//! [`Outbound`] messages on its output channel; an optional trace channel
//! carries [`TraceEvent`]s for external observers. [`StageCore`] is the
//! embeddable base that owns the channels and provides the send/trace
//! helpers; every trace emission is a no-op when no trace channel is
//! configured.

use std::error::Error;
use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::msg::{Addr, Inbound, Message, MessageId, Outbound};

/// Default capacity for stage input/output/trace channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// A record of message processing emitted on a stage's trace channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TraceEvent {
    /// Recorded immediately before a message is sent by a stage. `parent`
    /// is `None` for root messages.
    Send {
        /// Emission time.
        time: SystemTime,
        /// The parent message, if the sent message was derived.
        parent: Option<MessageId>,
        /// The message being sent.
        msg: Message,
    },
    /// Recorded immediately after a message is received by a stage.
    Recv {
        /// Receipt time.
        time: SystemTime,
        /// The received message's id.
        id: MessageId,
    },
    /// The message was processed successfully.
    Succeeded {
        /// Completion time.
        time: SystemTime,
        /// The processed message's id.
        id: MessageId,
    },
    /// Processing the message failed; the stage itself keeps running.
    Failed {
        /// Failure time.
        time: SystemTime,
        /// The failed message's id.
        id: MessageId,
        /// Description of the failure.
        error: String,
    },
    /// A merge node was minted, grouping several messages as the parents
    /// of later derivations.
    Merge {
        /// Creation time.
        time: SystemTime,
        /// The real messages being grouped.
        parents: Vec<MessageId>,
        /// The merge node's id.
        id: MessageId,
    },
}

/// Failure modes of a stage's serve loop.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Unexpected failure; the supervisor restarts the stage with backoff.
    #[error("transient stage failure: {0}")]
    Transient(#[source] Box<dyn Error + Send + Sync>),

    /// Permanent failure; the supervisor stops the flow.
    #[error("permanent stage failure: {0}")]
    Permanent(#[source] Box<dyn Error + Send + Sync>),

    /// `serve` was called on a stage that was never connected.
    #[error("stage was never connected")]
    NotConnected,
}

impl StageError {
    /// Wraps an error as a restartable failure.
    pub fn transient(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Transient(err.into())
    }

    /// Wraps an error as a do-not-restart failure.
    pub fn permanent(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns `true` if the supervisor must not restart the stage.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_) | Self::NotConnected)
    }
}

/// The stage's output channel has closed; the runtime is tearing the flow
/// down and the stage should exit cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stage output channel closed")]
pub struct OutputClosed;

/// The stage-side ends of a stage's channels, supplied once via
/// [`Stage::connect`].
pub struct StageChans {
    /// Receive end for input messages. Closure signals graceful shutdown.
    pub input: mpsc::Receiver<Inbound>,
    /// Send end for output messages.
    pub output: mpsc::Sender<Outbound>,
    /// Optional send end for trace events.
    pub trace: Option<mpsc::Sender<TraceEvent>>,
}

/// The far ends of a stage's channels, kept by whoever wired the stage
/// (the flow coordinator, or a test harness).
pub struct StageHandles {
    /// Send end feeding the stage's input.
    pub input: mpsc::Sender<Inbound>,
    /// Receive end draining the stage's output.
    pub output: mpsc::Receiver<Outbound>,
    /// Receive end draining the stage's trace events, if wired.
    pub trace: Option<mpsc::Receiver<TraceEvent>>,
}

impl StageChans {
    /// Creates a bounded channel set, returning the stage side and the
    /// coordinator side.
    #[must_use]
    pub fn bounded(capacity: usize, with_trace: bool) -> (Self, StageHandles) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (trace_tx, trace_rx) = if with_trace {
            let (tx, rx) = mpsc::channel(capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        (
            Self {
                input: in_rx,
                output: out_tx,
                trace: trace_tx,
            },
            StageHandles {
                input: in_tx,
                output: out_rx,
                trace: trace_rx,
            },
        )
    }
}

/// A unit of message processing inside a flow.
///
/// Implementations usually embed a [`StageCore`] and delegate `id` and
/// `connect` to it.
#[async_trait]
pub trait Stage: Send {
    /// Stable identifier, unique within the enclosing flow. Stage ids are
    /// human-readable and are embedded in publish subjects, so they must
    /// be valid subject tokens.
    fn id(&self) -> &str;

    /// Supplies the stage's channels. Called at most once, before the
    /// first `serve`; not repeated across restarts.
    fn connect(&mut self, chans: StageChans);

    /// Runs the stage until `ctx` is cancelled, the input channel closes
    /// (graceful shutdown), or a failure occurs.
    ///
    /// Returning `Ok` means done, do not restart. A
    /// [`StageError::Transient`] asks the supervisor for a restart with
    /// backoff; [`StageError::Permanent`] stops the flow. The supervisor
    /// may call `serve` again after a transient failure — the stage keeps
    /// its channels. A stage that cannot tolerate channel reuse must
    /// return a permanent error.
    async fn serve(&mut self, ctx: CancellationToken) -> Result<(), StageError>;
}

/// Embeddable stage base: identity, channels, and emission helpers.
pub struct StageCore {
    id: String,
    input: Option<mpsc::Receiver<Inbound>>,
    output: Option<mpsc::Sender<Outbound>>,
    trace: Option<mpsc::Sender<TraceEvent>>,
}

impl StageCore {
    /// Creates an unconnected core with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: None,
            output: None,
            trace: None,
        }
    }

    /// The stage id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Installs the channels.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn connect(&mut self, chans: StageChans) {
        assert!(
            self.output.is_none(),
            "stage {:?}: connect called twice",
            self.id
        );
        self.input = Some(chans.input);
        self.output = Some(chans.output);
        self.trace = chans.trace;
    }

    /// Returns `true` once `connect` has been called. Stages that are
    /// served without being connected should fail fast with
    /// [`StageError::NotConnected`].
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.output.is_some()
    }

    /// Receives the next input message; `None` when the input channel has
    /// closed (or was never connected).
    pub async fn recv(&mut self) -> Option<Inbound> {
        match self.input.as_mut() {
            Some(input) => input.recv().await,
            None => None,
        }
    }

    /// Takes the input receiver out of the core. Used by coordinators that
    /// pump the input themselves (a flow is a stage whose input is routed
    /// to its children).
    pub fn take_input(&mut self) -> Option<mpsc::Receiver<Inbound>> {
        self.input.take()
    }

    /// A clone of the output sender, if connected.
    #[must_use]
    pub fn output_sender(&self) -> Option<mpsc::Sender<Outbound>> {
        self.output.clone()
    }

    /// Takes the output sender out of the core, closing the stage's output
    /// once every clone is gone.
    pub fn take_output(&mut self) -> Option<mpsc::Sender<Outbound>> {
        self.output.take()
    }

    /// A clone of the trace sender, if one was configured.
    #[must_use]
    pub fn trace_sender(&self) -> Option<mpsc::Sender<TraceEvent>> {
        self.trace.clone()
    }

    /// Takes the trace sender out of the core.
    pub fn take_trace(&mut self) -> Option<mpsc::Sender<TraceEvent>> {
        self.trace.take()
    }

    /// Emits `msg` on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`OutputClosed`] once the output channel has no receiver;
    /// stages should treat this as a signal to exit cleanly.
    pub async fn send(&self, msg: Message, port: &str) -> Result<(), OutputClosed> {
        let Some(output) = &self.output else {
            return Err(OutputClosed);
        };
        output
            .send(Outbound::new(msg, Addr::new(self.id.as_str(), port)))
            .await
            .map_err(|_| OutputClosed)
    }

    /// Derives a child of `parent` carrying `data`, records the `Send`
    /// trace event, then emits the child on `port` — in that order, so no
    /// observer sees a child before its trace edge.
    ///
    /// # Errors
    ///
    /// Returns [`OutputClosed`] once the output channel has no receiver.
    pub async fn trace_send(
        &self,
        parent: &Message,
        data: Value,
        port: &str,
    ) -> Result<(), OutputClosed> {
        let child = parent.child(data);
        self.emit_trace(TraceEvent::Send {
            time: SystemTime::now(),
            parent: Some(parent.id().clone()),
            msg: child.clone(),
        })
        .await;
        self.send(child, port).await
    }

    /// Records receipt of the message with `id`.
    pub async fn trace_recv(&self, id: &MessageId) {
        self.emit_trace(TraceEvent::Recv {
            time: SystemTime::now(),
            id: id.clone(),
        })
        .await;
    }

    /// Records successful processing of the message with `id`.
    pub async fn trace_succeeded(&self, id: &MessageId) {
        self.emit_trace(TraceEvent::Succeeded {
            time: SystemTime::now(),
            id: id.clone(),
        })
        .await;
    }

    /// Records a per-message failure. The stage keeps running.
    pub async fn trace_failed(&self, id: &MessageId, error: impl fmt::Display) {
        self.emit_trace(TraceEvent::Failed {
            time: SystemTime::now(),
            id: id.clone(),
            error: error.to_string(),
        })
        .await;
    }

    /// Mints a merge node grouping `parents` and records it. The returned
    /// id can be used with [`Message::with_id`] to emit under the merge
    /// node.
    ///
    /// # Panics
    ///
    /// Panics if `parents` is empty.
    pub async fn trace_merge(&self, parents: Vec<MessageId>) -> MessageId {
        assert!(!parents.is_empty(), "merge must have at least one parent");
        let id = MessageId::new();
        self.emit_trace(TraceEvent::Merge {
            time: SystemTime::now(),
            parents,
            id: id.clone(),
        })
        .await;
        id
    }

    /// Sends a trace event if a trace channel is configured; otherwise a
    /// no-op. A send failure means the observer is gone, which is not the
    /// stage's problem.
    async fn emit_trace(&self, event: TraceEvent) {
        if let Some(trace) = &self.trace {
            let _ = trace.send(event).await;
        }
    }
}

impl fmt::Debug for StageCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageCore")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("traced", &self.trace.is_some())
            .finish()
    }
}
