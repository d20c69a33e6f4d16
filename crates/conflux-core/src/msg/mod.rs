//! Messages, addresses, and channel envelopes.
//!
//! A [`Message`] is an immutable `(id, data, token-bag)` triple. Identity
//! is globally unique within a flow execution; derivation mints a fresh id
//! and copies the parent's token bag (lineage itself is recorded by trace
//! events, not in the message body).

pub mod token;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use token::{TokenBag, TokenId, TokenValue};

/// Opaque unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Mints a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `(stage, port)` address inside a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    /// Stage identifier, unique within its flow.
    pub stage: String,
    /// Port name, unique within its stage.
    pub port: String,
}

impl Addr {
    /// Creates an address.
    pub fn new(stage: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.port)
    }
}

/// An immutable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    data: Value,
    #[serde(default, skip_serializing_if = "TokenBag::is_empty")]
    tokens: TokenBag,
}

impl Message {
    /// Creates a root message with a fresh identity and an empty token bag.
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            id: MessageId::new(),
            data,
            tokens: TokenBag::new(),
        }
    }

    /// Creates a message with a caller-supplied identity.
    ///
    /// Used when a stage emits a message under a previously minted merge
    /// node id so that downstream observers attach it to the right
    /// lineage node.
    #[must_use]
    pub fn with_id(id: MessageId, data: Value) -> Self {
        Self {
            id,
            data,
            tokens: TokenBag::new(),
        }
    }

    /// Derives a child: fresh identity, the given data, and a copy of this
    /// message's token bag.
    #[must_use]
    pub fn child(&self, data: Value) -> Self {
        Self {
            id: MessageId::new(),
            data,
            tokens: self.tokens.clone(),
        }
    }

    /// Returns this message with `value` recorded under `id` in its token
    /// bag. Builder-style; used at split/emit points.
    #[must_use]
    pub fn with_token(mut self, id: TokenId, value: TokenValue) -> Self {
        self.tokens.insert(id, value);
        self
    }

    /// The message identity.
    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// The payload.
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// The completion-token bag.
    #[must_use]
    pub fn tokens(&self) -> &TokenBag {
        &self.tokens
    }

    /// Wraps this message with the input port it is arriving on.
    #[must_use]
    pub fn to(self, addr: Addr) -> Inbound {
        Inbound { msg: self, addr }
    }
}

/// A message together with the stage/port address it is arriving on, so a
/// stage knows the port of arrival. Never appears on the wire; exists only
/// on in-process channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    /// The message.
    pub msg: Message,
    /// The destination `(stage, port)`.
    pub addr: Addr,
}

/// A message together with the stage/port address it is being emitted
/// from, so the coordinator knows the port of departure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    /// The message.
    pub msg: Message,
    /// The source `(stage, port)`.
    pub addr: Addr,
}

impl Outbound {
    /// Wraps a message with its departure address.
    #[must_use]
    pub fn new(msg: Message, addr: Addr) -> Self {
        Self { msg, addr }
    }
}
