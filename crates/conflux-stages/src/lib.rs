//! Example stages for the conflux runtime.
//!
//! These exercise the [`conflux_core::Stage`] contract end to end:
//!
//! - [`Delay`](delay::Delay) suspends each message for a fixed duration,
//!   preserving order.
//! - [`Query`](query::Query) runs a compiled filter expression over each
//!   message's JSON payload and emits one child per result.
//!
//! Both are configured from JSON-shaped config structs, the shape a flow
//! definition would carry.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod delay;
pub mod filter;
pub mod query;

pub use delay::{Delay, DelayConfig};
pub use filter::{FilterError, Program};
pub use query::{Query, QueryConfig, QueryConfigError};
