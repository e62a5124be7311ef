//! Progress reporting, cancellation and user confirmation.

use crate::error::{Error, Result};

/// A snapshot of a long-running operation's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress<'a> {
    /// Human-readable name of the running task.
    pub task: &'a str,
    /// Units processed so far.
    pub done: u64,
    /// Total units, if known.
    pub total: Option<u64>,
}

/// Callbacks through which store operations talk to their caller.
///
/// Every method has a default so implementations only override what they need.
pub trait Handler {
    /// Receive a progress update.
    fn report(&self, _progress: &Progress<'_>) {}

    /// Whether the caller wants the running operation to stop.
    fn is_cancellation_requested(&self) -> bool {
        false
    }

    /// Ask the user a yes/no question. Non-interactive handlers answer `false`.
    fn confirm(&self, _question: &str) -> bool {
        false
    }

    /// Return `Err(Error::Canceled)` if cancellation was requested.
    fn check_cancellation(&self) -> Result<()> {
        if self.is_cancellation_requested() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

/// A handler that reports nothing, never cancels and declines every question.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentHandler;

impl Handler for SilentHandler {}
