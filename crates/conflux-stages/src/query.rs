//! A stage that runs a compiled filter expression over each message.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use conflux_core::{OutputClosed, Stage, StageChans, StageCore, StageError};

use crate::filter::{FilterError, Program};

/// JSON-shaped configuration for [`Query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// The filter expression to compile.
    pub filter: String,
    /// Per-message processing bound, in milliseconds. Must be positive.
    #[serde(rename = "timeoutMillis")]
    pub timeout_millis: u64,
}

/// Errors from query stage construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryConfigError {
    /// The filter expression does not compile.
    #[error("query filter: {0}")]
    Filter(#[from] FilterError),

    /// The filter expression is empty.
    #[error("query filter must not be empty")]
    EmptyFilter,

    /// The timeout is zero.
    #[error("timeoutMillis must be greater than zero")]
    NonPositiveTimeout,
}

/// Per-message failure reasons, reported on the trace channel.
#[derive(Debug, thiserror::Error)]
enum QueryError {
    #[error("filter evaluation failed: {0}")]
    Eval(#[from] FilterError),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs a filter over each inbound message's payload and emits one child
/// message per result on the `out` port.
///
/// The filter is compiled once at construction. Each message is processed
/// under `min(ctx, timeout)`: evaluation errors and timeouts become
/// `Failed` trace events (with no `Succeeded`) and the stage moves on —
/// per-message failures never kill the stage.
pub struct Query {
    core: StageCore,
    program: Program,
    timeout: Duration,
}

impl Query {
    /// Compiles `filter` and creates the stage.
    ///
    /// # Errors
    ///
    /// Returns [`QueryConfigError`] if the filter is empty or does not
    /// compile, or if the timeout is zero.
    pub fn new(
        id: impl Into<String>,
        filter: &str,
        timeout: Duration,
    ) -> Result<Self, QueryConfigError> {
        if filter.trim().is_empty() {
            return Err(QueryConfigError::EmptyFilter);
        }
        if timeout.is_zero() {
            return Err(QueryConfigError::NonPositiveTimeout);
        }
        Ok(Self {
            core: StageCore::new(id),
            program: Program::compile(filter)?,
            timeout,
        })
    }

    /// Creates the stage from its JSON-shaped config.
    ///
    /// # Errors
    ///
    /// Returns [`QueryConfigError`] under the same conditions as
    /// [`Query::new`].
    pub fn from_config(id: impl Into<String>, config: &QueryConfig) -> Result<Self, QueryConfigError> {
        Self::new(id, &config.filter, Duration::from_millis(config.timeout_millis))
    }

    /// The compiled filter's source expression.
    #[must_use]
    pub fn filter(&self) -> &str {
        self.program.source()
    }
}

#[async_trait]
impl Stage for Query {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn connect(&mut self, chans: StageChans) {
        self.core.connect(chans);
    }

    async fn serve(&mut self, ctx: CancellationToken) -> Result<(), StageError> {
        if !self.core.is_connected() {
            return Err(StageError::NotConnected);
        }
        loop {
            tokio::select! {
                maybe = self.core.recv() => match maybe {
                    Some(inbound) => {
                        let id = inbound.msg.id().clone();
                        self.core.trace_recv(&id).await;
                        match self.program.eval(inbound.msg.data()) {
                            Err(err) => {
                                self.core.trace_failed(&id, QueryError::from(err)).await;
                            }
                            Ok(results) => {
                                // Emission counts against the per-message
                                // bound: a downstream stall past the
                                // timeout fails this message, not the
                                // stage.
                                let emit = async {
                                    for result in results {
                                        self.core.trace_send(&inbound.msg, result, "out").await?;
                                    }
                                    Ok::<(), OutputClosed>(())
                                };
                                // Bounded by min(ctx, timeout).
                                tokio::select! {
                                    res = tokio::time::timeout(self.timeout, emit) => match res {
                                        Ok(Ok(())) => self.core.trace_succeeded(&id).await,
                                        Ok(Err(OutputClosed)) => return Ok(()),
                                        Err(_) => {
                                            self.core
                                                .trace_failed(&id, QueryError::Timeout(self.timeout))
                                                .await;
                                        }
                                    },
                                    () = ctx.cancelled() => return Ok(()),
                                }
                            }
                        }
                    }
                    None => return Ok(()),
                },
                () = ctx.cancelled() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use conflux_core::{Addr, Message, TraceEvent};

    use super::*;

    fn query(filter: &str) -> Query {
        Query::new("q", filter, Duration::from_millis(250)).unwrap()
    }

    #[tokio::test]
    async fn emits_one_child_per_result() {
        let mut stage = query(".[]");
        let (chans, mut handles) = StageChans::bounded(8, true);
        stage.connect(chans);

        let ctx = CancellationToken::new();
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { stage.serve(ctx).await }
        });

        let msg = Message::new(json!([1, 2]));
        handles
            .input
            .send(msg.clone().to(Addr::new("q", "in")))
            .await
            .unwrap();

        let first = handles.output.recv().await.unwrap();
        let second = handles.output.recv().await.unwrap();
        assert_eq!(first.msg.data(), &json!(1));
        assert_eq!(second.msg.data(), &json!(2));
        assert_eq!(first.addr, Addr::new("q", "out"));
        assert_ne!(first.msg.id(), second.msg.id());

        let trace = handles.trace.as_mut().unwrap();
        assert!(matches!(trace.recv().await.unwrap(), TraceEvent::Recv { .. }));
        assert!(matches!(trace.recv().await.unwrap(), TraceEvent::Send { .. }));
        assert!(matches!(trace.recv().await.unwrap(), TraceEvent::Send { .. }));
        assert!(matches!(
            trace.recv().await.unwrap(),
            TraceEvent::Succeeded { .. }
        ));

        drop(handles.input);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn evaluation_errors_fail_the_message_not_the_stage() {
        let mut stage = query(".[]");
        let (chans, mut handles) = StageChans::bounded(8, true);
        stage.connect(chans);

        let ctx = CancellationToken::new();
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { stage.serve(ctx).await }
        });

        // A number cannot be iterated: Failed, no Succeeded.
        handles
            .input
            .send(Message::new(json!(3)).to(Addr::new("q", "in")))
            .await
            .unwrap();
        // The stage keeps serving: the next message still goes through.
        handles
            .input
            .send(Message::new(json!([7])).to(Addr::new("q", "in")))
            .await
            .unwrap();

        let out = handles.output.recv().await.unwrap();
        assert_eq!(out.msg.data(), &json!(7));

        let trace = handles.trace.as_mut().unwrap();
        assert!(matches!(trace.recv().await.unwrap(), TraceEvent::Recv { .. }));
        let failed = trace.recv().await.unwrap();
        match failed {
            TraceEvent::Failed { error, .. } => assert!(error.contains("cannot iterate")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(matches!(trace.recv().await.unwrap(), TraceEvent::Recv { .. }));

        drop(handles.input);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_emission_times_out_and_fails_the_message() {
        let mut stage = Query::new("q", ".[]", Duration::from_millis(50)).unwrap();
        // Output capacity 1: the second result cannot be emitted while
        // nobody drains the channel.
        let (chans, mut handles) = StageChans::bounded(1, true);
        stage.connect(chans);

        let ctx = CancellationToken::new();
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { stage.serve(ctx).await }
        });

        handles
            .input
            .send(Message::new(json!([1, 2, 3])).to(Addr::new("q", "in")))
            .await
            .unwrap();

        let trace = handles.trace.as_mut().unwrap();
        assert!(matches!(trace.recv().await.unwrap(), TraceEvent::Recv { .. }));
        assert!(matches!(trace.recv().await.unwrap(), TraceEvent::Send { .. }));
        // The first Send sits in the full output channel; with the second
        // blocked past the timeout the message fails.
        loop {
            match trace.recv().await.unwrap() {
                TraceEvent::Send { .. } => {}
                TraceEvent::Failed { error, .. } => {
                    assert!(error.contains("timed out"));
                    break;
                }
                other => panic!("expected Send or Failed, got {other:?}"),
            }
        }

        drop(handles.input);
        task.await.unwrap().unwrap();
        drop(handles.output);
    }

    #[tokio::test]
    async fn halt_like_empty_result_is_clean() {
        let mut stage = query(".[]");
        let (chans, mut handles) = StageChans::bounded(8, true);
        stage.connect(chans);

        let ctx = CancellationToken::new();
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { stage.serve(ctx).await }
        });

        // An empty array produces no results and still succeeds.
        handles
            .input
            .send(Message::new(json!([])).to(Addr::new("q", "in")))
            .await
            .unwrap();
        let trace = handles.trace.as_mut().unwrap();
        assert!(matches!(trace.recv().await.unwrap(), TraceEvent::Recv { .. }));
        assert!(matches!(
            trace.recv().await.unwrap(),
            TraceEvent::Succeeded { .. }
        ));

        drop(handles.input);
        task.await.unwrap().unwrap();
    }

    #[test]
    fn construction_validates_config() {
        assert!(matches!(
            Query::new("q", "", Duration::from_millis(10)),
            Err(QueryConfigError::EmptyFilter)
        ));
        assert!(matches!(
            Query::new("q", ".", Duration::ZERO),
            Err(QueryConfigError::NonPositiveTimeout)
        ));
        assert!(matches!(
            Query::new("q", "not a filter", Duration::from_millis(10)),
            Err(QueryConfigError::Filter(_))
        ));

        let config: QueryConfig =
            serde_json::from_value(json!({"filter": ".[]", "timeoutMillis": 250})).unwrap();
        let stage = Query::from_config("q", &config).unwrap();
        assert_eq!(stage.filter(), ".[]");
    }
}
