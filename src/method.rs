//! Method contract — what a registered handler looks like.
//!
//! DESIGN
//! ======
//! A method is anything implementing [`Method`]: it receives the named
//! arguments of a command plus a [`CallContext`] and returns a boxed future
//! resolving to a JSON value or a [`MethodError`]. Plain `async fn` items with
//! the signature `async fn(Arguments, CallContext) -> MethodResult` implement
//! the trait through a blanket impl, so they register without wrapping.
//!
//! CANCELLATION
//! ============
//! Cancellation is cooperative. The receiver keeps the [`CancelSignal`] half
//! of a linked pair and hands the [`CallContext`] half to the method. A method
//! that wants to react to cancellation selects on [`CallContext::cancelled`]
//! and returns whatever sentinel it likes; a method that ignores it is dropped
//! by the receiver after a grace period.

use std::any::Any;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;

use frames::{Arguments, ProtocolError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

/// Outcome of one method execution.
pub type MethodResult = Result<Value, MethodError>;

/// Boxed future returned by [`Method::call`].
pub type MethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send + 'static>>;

// =============================================================================
// ERRORS
// =============================================================================

/// Domain failure raised on purpose by a method body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ReceiverError {
    message: String,
}

impl ReceiverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Every way a single call can fail. The display text is what the caller
/// sees in the `result` field of the `err` status.
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    /// Raised deliberately by the method.
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
    /// Malformed command or unknown method.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A required named argument is absent.
    #[error("missing argument '{0}'")]
    MissingArgument(String),
    /// A named argument does not deserialize into the expected type.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },
    /// Any other failure reported by the method.
    #[error("{0}")]
    Failed(String),
    /// The method body panicked.
    #[error("method panicked: {0}")]
    Panicked(String),
    /// The method did not settle within the grace period after cancellation.
    #[error("call was canceled")]
    Canceled,
}

impl MethodError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Build a [`MethodError::Panicked`] from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self::Panicked(message)
    }
}

// =============================================================================
// METHOD TRAIT
// =============================================================================

/// A callable registered under a name.
pub trait Method: Send + Sync + 'static {
    /// Start one execution. Synchronous work done here, before the future is
    /// returned, runs on the receiver loop.
    fn call(&self, args: Arguments, ctx: CallContext) -> MethodFuture;
}

impl<F, Fut> Method for F
where
    F: Fn(Arguments, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    fn call(&self, args: Arguments, ctx: CallContext) -> MethodFuture {
        Box::pin(self(args, ctx))
    }
}

/// Adapt a blocking function into a [`Method`]. The body runs at dispatch
/// time and blocks the receiver loop until it returns.
pub fn sync_method<F>(f: F) -> impl Method
where
    F: Fn(Arguments) -> MethodResult + Send + Sync + 'static,
{
    move |args: Arguments, _ctx: CallContext| future::ready(f(args))
}

/// Extract and deserialize a named argument.
///
/// # Errors
///
/// [`MethodError::MissingArgument`] when `name` is absent and
/// [`MethodError::InvalidArgument`] when its value has the wrong shape.
pub fn arg<T: DeserializeOwned>(args: &Arguments, name: &str) -> Result<T, MethodError> {
    let value = args
        .get(name)
        .ok_or_else(|| MethodError::MissingArgument(name.to_owned()))?;
    serde_json::from_value(value.clone()).map_err(|e| MethodError::InvalidArgument {
        name: name.to_owned(),
        reason: e.to_string(),
    })
}

// =============================================================================
// CALL CONTEXT
// =============================================================================

/// Per-call view handed to a method.
#[derive(Clone, Debug)]
pub struct CallContext {
    uuid: Arc<str>,
    method: Arc<str>,
    cancel: watch::Receiver<bool>,
}

/// Receiver-side half of a call's cancellation pair.
#[derive(Debug)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

impl CallContext {
    /// Create a linked cancel signal and context for one call.
    #[must_use]
    pub fn pair(uuid: &str, method: &str) -> (CancelSignal, Self) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            uuid: Arc::from(uuid),
            method: Arc::from(method),
            cancel: rx,
        };
        (CancelSignal { tx }, ctx)
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolve once cancellation has been requested. Never resolves if the
    /// signal is dropped without being fired.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
        if !fired {
            future::pending::<()>().await;
        }
    }
}

impl CancelSignal {
    /// Request cancellation. Repeated calls are no-ops.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
#[path = "method_test.rs"]
mod tests;
