//! Error types for the coherence core
//!
//! All fallible operations in the crate return [`CoherenceError`]. Background
//! workers log and swallow recoverable errors; errors that reach the fault
//! upcall boundary are converted to a retry signal or a hard fault return.

use std::fmt;

/// Recovery hint attached to every error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Retry after a brief sleep
    RetryBackoff,
    /// Re-drive the fault from scratch
    RedriveFault,
    /// Degrade to the non-coherent path (map the raw frame)
    Degrade,
    /// Drop the offending input and continue
    Discard,
    /// No recovery possible
    Fatal,
}

/// Error kinds exposed by the coherence core
#[derive(Debug, Clone, PartialEq)]
pub enum CoherenceError {
    /// Handle/ring/replica allocation failed after retry
    OutOfResources(String),
    /// No messaging ops vector registered
    TransportUnavailable,
    /// A peer refused the transaction
    Nacked,
    /// Another writer raced, or the wait station collapsed; re-drive the fault
    RetryFault,
    /// Ring holds capacity - 1 messages; the message was not enqueued
    RingFull,
    /// Message type out of range or header malformed
    InvalidMessage(String),
    /// The action table was indexed at a declared-invalid cell
    InvariantViolation(String),
    /// Shared-window mapping or geometry problem
    Window(String),
    /// Bad configuration handed to the builder
    InvalidConfiguration(String),
}

impl fmt::Display for CoherenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoherenceError::OutOfResources(what) => write!(f, "out of resources: {}", what),
            CoherenceError::TransportUnavailable => write!(f, "no messaging ops registered"),
            CoherenceError::Nacked => write!(f, "transaction refused by peer"),
            CoherenceError::RetryFault => write!(f, "fault must be re-driven"),
            CoherenceError::RingFull => write!(f, "ring window full, message dropped"),
            CoherenceError::InvalidMessage(msg) => write!(f, "invalid message: {}", msg),
            CoherenceError::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
            CoherenceError::Window(msg) => write!(f, "shared window error: {}", msg),
            CoherenceError::InvalidConfiguration(msg) => {
                write!(f, "invalid configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for CoherenceError {}

impl CoherenceError {
    /// Create an allocation-failure error
    #[inline(always)]
    pub fn out_of_resources(what: impl Into<String>) -> Self {
        Self::OutOfResources(what.into())
    }

    /// Create a malformed-message error
    #[inline(always)]
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Create an invariant-violation error
    #[inline(always)]
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a window error
    #[inline(always)]
    pub fn window(msg: impl Into<String>) -> Self {
        Self::Window(msg.into())
    }

    /// Get recovery hint for this error
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            Self::OutOfResources(_) => RecoveryHint::RetryBackoff,
            Self::TransportUnavailable => RecoveryHint::Degrade,
            Self::Nacked | Self::RetryFault => RecoveryHint::RedriveFault,
            Self::RingFull => RecoveryHint::RetryBackoff,
            Self::InvalidMessage(_) => RecoveryHint::Discard,
            Self::InvariantViolation(_) => RecoveryHint::Discard,
            Self::Window(_) | Self::InvalidConfiguration(_) => RecoveryHint::Fatal,
        }
    }
}
