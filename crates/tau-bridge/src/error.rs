//! Failure payloads and runtime errors.
//!
//! A [`Failure`] is what travels through a task chain when something goes
//! wrong: it is the counterpart of a captured exception pointer. The runtime
//! never interprets it. A generated binding downcasts it at the error callback
//! to decide how to re-encode it for its own runtime.
//!
//! Errors the runtime itself raises are the thiserror enums below.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Failure - opaque, shareable failure payload
// =============================================================================

/// An opaque failure carried through a task chain.
///
/// Cloning is cheap and preserves identity: every clone of a failure compares
/// equal under [`Failure::ptr_eq`], so a failure raised three awaits deep
/// arrives at the outermost error callback as the *same* payload.
///
/// `Failure` does not implement [`std::error::Error`]; any `E: Error`
/// converts into it, so `?` works on any error type inside a task body.
#[derive(Clone)]
pub struct Failure {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl Failure {
    /// Wrap an error value.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self { inner: Arc::new(error) }
    }

    /// A failure with only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(TaskError::Message(message.into()))
    }

    /// Build a failure from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::new(TaskError::Panicked(message))
    }

    /// Borrow the underlying error.
    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }

    /// Downcast to a concrete error type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    /// True if the payload is an `E`.
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.inner.is::<E>()
    }

    /// True if both failures share the same payload allocation.
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<E> From<E> for Failure
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Failure::new(error)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Failure").field(&self.inner).finish()
    }
}

// =============================================================================
// Runtime-originated errors
// =============================================================================

/// Failures raised by the task runtime itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// A task body panicked. The panic was caught at the poll boundary.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task's outcome was already handed to its observers.
    #[error("task outcome was already delivered")]
    OutcomeTaken,

    /// A callback handle was dropped without `resume` or `error`.
    #[error("callback handle dropped without being resumed")]
    Abandoned,

    /// The task was dropped by its scheduler before it finished.
    #[error("task was dropped before completing")]
    Dropped,

    #[error("{0}")]
    Message(String),
}

/// Errors raised by the proxy cache's typed accessor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The live proxy registered under `tag` is not a `expected`.
    #[error("proxy cached under '{tag}' is not a {expected}")]
    ProxyTypeMismatch {
        tag: &'static str,
        expected: &'static str,
    },
}

// =============================================================================
// ForeignError - a failure from the other side of the boundary
// =============================================================================

/// An error raised on the far side of the boundary.
///
/// Bindings translate a foreign exception into this shape on the way in and
/// back into the foreign runtime's representation on the way out. `domain`
/// names the declared error domain; `code` is the case within it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{domain}[{code}]: {message}")]
pub struct ForeignError {
    pub domain: String,
    pub code: i32,
    pub message: String,
}

impl ForeignError {
    pub fn new(domain: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }
}
