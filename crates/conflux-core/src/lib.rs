//! # Conflux Core
//!
//! The core dataflow runtime. A [`Flow`](flow::Flow) executes a directed
//! graph of [`Stage`](stage::Stage)s that exchange [`Message`](msg::Message)s
//! through typed, named ports. Routing between stages is subject-based
//! pub/sub; supervision restarts failed stages with backoff; trace events
//! let an external observer reconstruct message provenance.
//!
//! ## Components
//!
//! - [`subject`] — tokenised subject matcher with `*`/`>` wildcards and a
//!   bounded match-result cache
//! - [`pubsub`] — synchronous fan-out publish/subscribe over the matcher
//! - [`msg`] — immutable messages, addresses, envelopes, and the XOR
//!   completion-token algebra
//! - [`lineage`] — append-only provenance DAG with one-level merge nodes
//! - [`stage`] — the stage contract, channel wiring, and trace helpers
//! - [`supervisor`] — restart-with-backoff policy for stages
//! - [`flow`] — the coordinator that wires stages to pub/sub and manages
//!   ordered startup and shutdown
//!
//! ## Example
//!
//! ```rust,ignore
//! use conflux_core::{Flow, Connection, Addr, PubSub};
//!
//! let pubsub = Arc::new(PubSub::new());
//! let mut flow = Flow::new("pipeline", pubsub, stages, stage_conns, flow_conns)?;
//! let (chans, handles) = StageChans::bounded(128, false);
//! flow.connect(chans);
//! tokio::spawn(async move { flow.serve(token).await });
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod flow;
pub mod lineage;
pub mod msg;
pub mod pubsub;
pub mod stage;
pub mod subject;
pub mod supervisor;

pub use flow::{stage_subject, Connection, Flow, FlowError};
pub use msg::{token::TokenBag, token::TokenId, token::TokenValue, Addr, Inbound, Message, MessageId, Outbound};
pub use pubsub::{PubSub, SubscriptionGuard};
pub use stage::{OutputClosed, Stage, StageChans, StageCore, StageError, StageHandles, TraceEvent};
pub use subject::{Pattern, Subject, SubjectError};
pub use supervisor::RetryPolicy;
