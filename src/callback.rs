//! One-shot completion callbacks for asynchronous session operations.
use std::fmt;

use crate::{Error, Result};

/// Callback invoked when an asynchronous operation completes.
pub type Callback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Asynchronous operations of the session, named after the events a host bridge forwards them as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`Session::init`](crate::Session::init).
    Init,
    /// [`Session::register_user`](crate::Session::register_user).
    RegisterUser,
    /// [`Session::refresh_tuning`](crate::Session::refresh_tuning).
    RefreshTuning,
    /// [`Session::notification_received`](crate::Session::notification_received).
    NotificationReceived,
}

impl Operation {
    /// Host event name.
    pub fn event_name(self) -> &'static str {
        match self {
            Operation::Init => "onSplytInitComplete",
            Operation::RegisterUser => "onSplytRegisterUserComplete",
            Operation::RefreshTuning => "onSplytRefreshComplete",
            Operation::NotificationReceived => "onSplytNotificationReceived",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Owns a callback and guarantees it is invoked exactly once.
///
/// [`Completion::complete`] consumes the completion. If a completion is dropped without being
/// completed (e.g., the worker shut down with the job still queued), the callback receives
/// [`Error::Unknown`].
pub(crate) struct Completion {
    operation: Operation,
    callback: Option<Callback>,
}

impl Completion {
    pub fn new(operation: Operation, callback: Callback) -> Completion {
        Completion {
            operation,
            callback: Some(callback),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn complete(mut self, result: Result<()>) {
        self.invoke(result);
    }

    fn invoke(&mut self, result: Result<()>) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        log::debug!(target: "splyt", operation = self.operation.event_name(); "operation completed: {:?}", result);
        // A panicking callback must not take the worker thread down with it.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(result)));
        if outcome.is_err() {
            log::error!(target: "splyt", operation = self.operation.event_name(); "completion callback panicked");
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.callback.is_some() {
            log::warn!(target: "splyt", operation = self.operation.event_name(); "operation dropped before completion");
            self.invoke(Err(Error::Unknown));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("operation", &self.operation)
            .field("pending", &self.callback.is_some())
            .finish()
    }
}
