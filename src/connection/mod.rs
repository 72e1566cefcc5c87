//! The durable control-bus connection.
//!
//! [`ConnectionSet`] tracks every currently open peer link and owns one
//! dedicated writer task per link; [`DurableConnection`] is the
//! reconnect-forever supervisor that reads lines, dispatches them, and
//! re-establishes the transport after every failure.

mod set;
mod supervisor;

pub use set::ConnectionSet;
pub use supervisor::{DurableConnection, ReconnectPolicy};
