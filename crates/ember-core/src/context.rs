//! Cooperative execution context shared by readers, flows, and coordinators.
//!
//! The context replaces ambient cancellation and exception mechanisms: errors
//! are recorded on the context rather than thrown, and long-running loops poll
//! [`ExecutionContext::is_running`] at their boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Error recorded on an [`ExecutionContext`].
///
/// Deliberately coarse: the context is a cross-component channel, so the
/// variants name the failure classes the loops dispatch on rather than any
/// one component's internals.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The executor ran out of memory while applying a command.
    #[error("out of memory while applying incoming migration data")]
    OutOfMemory,

    /// A command that requires global coordination arrived on a data stream
    /// that cannot host it.
    #[error("unsupported command during migration: {0}")]
    UnsupportedCommand(String),

    /// Transport failure on the underlying byte stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Framing violation in the journal byte stream.
    #[error("malformed journal stream: {0}")]
    Framing(String),

    /// Any other error, carried as text.
    #[error("{0}")]
    Generic(String),
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    error: Mutex<Option<ContextError>>,
}

/// Clone-shared cancellation token with an error slot.
///
/// The first reported error wins; it also cancels the context so cooperating
/// loops observe the failure at their next `is_running` poll. Cancellation
/// without an error (via [`cancel`](Self::cancel)) is not an error.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl ExecutionContext {
    /// Creates a fresh running context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while the context has neither been cancelled nor failed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the context. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Records an error and cancels the context.
    ///
    /// Only the first error is kept; later reports are dropped.
    pub fn report_error(&self, err: ContextError) {
        {
            let mut slot = self.inner.error.lock();
            if let Some(existing) = slot.as_ref() {
                tracing::debug!(first = %existing, dropped = %err, "context already failed");
            } else {
                *slot = Some(err);
            }
        }
        self.cancel();
    }

    /// Returns the recorded error, if any.
    #[must_use]
    pub fn error(&self) -> Option<ContextError> {
        self.inner.error.lock().clone()
    }

    /// Clears the error slot and resumes the context.
    ///
    /// Used when a long-lived owner re-arms the context for a new run.
    pub fn reset(&self) {
        *self.inner.error.lock() = None;
        self.inner.cancelled.store(false, Ordering::Release);
    }
}
