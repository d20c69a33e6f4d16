//! A stage that suspends each message for a fixed duration.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use conflux_core::{Stage, StageChans, StageCore, StageError};

/// JSON-shaped configuration for [`Delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Delay applied to each message, in milliseconds.
    pub millis: u64,
}

/// Delays each inbound message by a fixed duration, then re-emits its
/// data as a child message on the `out` port.
///
/// Inputs are serialised: the stage sleeps one message at a time, so
/// output order equals input order.
pub struct Delay {
    core: StageCore,
    duration: Duration,
}

impl Delay {
    /// Creates a delay stage.
    pub fn new(id: impl Into<String>, duration: Duration) -> Self {
        Self {
            core: StageCore::new(id),
            duration,
        }
    }

    /// Creates a delay stage from its JSON-shaped config.
    pub fn from_config(id: impl Into<String>, config: DelayConfig) -> Self {
        Self::new(id, Duration::from_millis(config.millis))
    }

    /// The configured delay.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[async_trait]
impl Stage for Delay {
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
                        self.core.trace_recv(inbound.msg.id()).await;
                        tracing::debug!(stage = self.core.id(), delay = ?self.duration, "delaying message");
                        tokio::select! {
                            () = tokio::time::sleep(self.duration) => {}
                            // A cancelled context abandons the in-flight
                            // message; input-close does not, so draining
                            // flows still deliver it.
                            () = ctx.cancelled() => return Ok(()),
                        }
                        let data = inbound.msg.data().clone();
                        if self.core.trace_send(&inbound.msg, data, "out").await.is_err() {
                            return Ok(());
                        }
                        self.core.trace_succeeded(inbound.msg.id()).await;
                    }
                    None => return Ok(()),
                },
                () = ctx.cancelled() => return Ok(()),
            }
        }
    }
}
