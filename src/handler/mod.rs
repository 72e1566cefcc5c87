//! Handler traits and the registry.
//!
//! Surrounding components (slideshow, display, stream control) publish their
//! readable and writable state here under stable string keys. The registry is
//! populated once at startup, frozen behind an `Arc`, and dispatched into by
//! the message bus for the rest of the process lifetime.

mod registry;
mod sink;

pub use registry::{HandlerEntry, HandlerRegistry};
pub use sink::{ErrorSink, LogSink, Op};

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::error::Result;

/// Boxed future for setter results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A writable piece of device state.
///
/// Setters are async: applying a value may touch the display, restart a
/// stream session, or kick off a download. Implemented for any
/// `Fn(Value) -> impl Future<Output = Result<()>>` closure.
pub trait Setter: Send + Sync + 'static {
    /// Apply one value to the state this setter owns.
    fn apply(&self, value: Value) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> Setter for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn apply(&self, value: Value) -> BoxFuture<'static, Result<()>> {
        Box::pin((self)(value))
    }
}

/// A readable piece of device state.
///
/// Getters are synchronous reads of current state. The optional qualifier
/// is the value carried in the `get` entry (e.g. a sub-selector); getters
/// that don't use it receive `None` or ignore it. Implemented for any
/// `Fn(Option<&Value>) -> Result<Value>` closure.
pub trait Getter: Send + Sync + 'static {
    /// Read the current value, optionally narrowed by a qualifier.
    fn read(&self, arg: Option<&Value>) -> Result<Value>;
}

impl<F> Getter for F
where
    F: Fn(Option<&Value>) -> Result<Value> + Send + Sync + 'static,
{
    fn read(&self, arg: Option<&Value>) -> Result<Value> {
        (self)(arg)
    }
}
