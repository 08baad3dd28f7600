//! Error types for the buffered task runner.

use thiserror::Error;

/// Errors surfaced by [`Runner::buffer`](crate::Runner::buffer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The admission handshake did not complete within the caller's timeout.
    ///
    /// Runner state is unchanged; none of the entries were accepted.
    #[error("timed out waiting for buffer admission")]
    Timeout,

    /// The runner is shutting down and refuses new entries.
    #[error("runner is closed")]
    Closed,
}

/// Error returned when a queue cannot shrink any further.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShrinkError {
    /// The queue is already at its minimum size of one item.
    #[error("queue is already at minimum size")]
    MinimumSize,
}
