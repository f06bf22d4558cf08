//! Error types for Ferry.
//!
//! This module provides a unified error type for all Ferry operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

use crate::record::{GlobalStep, StepCode};
use crate::state::SessionState;

/// A specialized `Result` type for Ferry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Ferry.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or oversized packet bytes
    #[error("framing error: {0}")]
    Framing(String),

    /// A packet could not be built because a required field is unset
    #[error("cannot build packet: {0}")]
    PacketBuild(String),

    /// A packet was received that is not a legal successor of the current state
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        /// State the session was in
        from: SessionState,
        /// State the packet would have moved it to
        to: SessionState,
    },

    /// Block content key mismatch
    #[error("content key mismatch on block {rank}")]
    DataIntegrity {
        /// Rank of the corrupted block
        rank: u32,
    },

    /// Connection to the requested host failed and the retry budget is exhausted
    #[error("no connection to {0}")]
    NoConnection(String),

    /// Connection failed but the transfer will be retried later
    #[error("not yet connected to {0}, transfer rescheduled")]
    NotYetConnected(String),

    /// The requested host is not present in the host directory
    #[error("host '{0}' not found")]
    HostNotFound(String),

    /// The transfer rule is not present in the rule directory
    #[error("rule '{0}' not found")]
    RuleNotFound(String),

    /// A transfer record is unusable (self-request, bad mode, missing fields)
    #[error("runner configuration error: {0}")]
    RunnerConfig(String),

    /// A pre/post/error task failed
    #[error("task failed during {step:?}: {reason}")]
    Task {
        /// Phase the failing task belonged to
        step: GlobalStep,
        /// Task failure detail
        reason: String,
    },

    /// The worker pool refused a submission
    #[error("worker pool saturated, transfer rejected")]
    Backpressure,

    /// The peer refused the authentication handshake
    #[error("authentication rejected by {0}")]
    BadAuthent(String),

    /// The peer reported an error through an Error packet
    #[error("remote error {code:?}: {message}")]
    Remote {
        /// Step code reported by the peer
        code: StepCode,
        /// Human-readable message from the peer
        message: String,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// Record store error
    #[error("store error: {0}")]
    Store(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// File path escapes the configured roots
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns whether this error is recoverable (the transfer can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotYetConnected(_) | Self::Timeout(_) | Self::Backpressure
        )
    }

    /// The step code recorded on a transfer record that fails with this error.
    #[must_use]
    pub fn step_code(&self) -> StepCode {
        match self {
            Self::Framing(_) | Self::PacketBuild(_) => StepCode::TransferError,
            Self::IllegalTransition { .. } => StepCode::IncorrectCommand,
            Self::DataIntegrity { .. } => StepCode::IntegrityError,
            Self::NoConnection(_) | Self::NotYetConnected(_) => StepCode::ConnectionImpossible,
            Self::HostNotFound(_) => StepCode::NotKnownHost,
            Self::RuleNotFound(_) => StepCode::IncorrectCommand,
            Self::RunnerConfig(_) => StepCode::LoopSelfRequestedHost,
            Self::Task { .. } => StepCode::ExternalOp,
            Self::Backpressure => StepCode::Unknown,
            Self::BadAuthent(_) => StepCode::BadAuthent,
            Self::Remote { code, .. } => *code,
            Self::Timeout(_) => StepCode::Disconnection,
            Self::InvalidPath(_) => StepCode::FileNotAllowed,
            Self::Io(e) => match e.kind() {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted => StepCode::Disconnection,
                io::ErrorKind::NotFound => StepCode::FileNotFound,
                _ => StepCode::Internal,
            },
            _ => StepCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::NotYetConnected("peer".into()).is_recoverable());
        assert!(Error::Timeout(5).is_recoverable());
        assert!(!Error::NoConnection("peer".into()).is_recoverable());
        assert!(!Error::DataIntegrity { rank: 3 }.is_recoverable());
    }

    #[test]
    fn test_step_code_mapping() {
        assert_eq!(
            Error::DataIntegrity { rank: 0 }.step_code(),
            StepCode::IntegrityError
        );
        assert_eq!(
            Error::NoConnection("x".into()).step_code(),
            StepCode::ConnectionImpossible
        );
        assert_eq!(Error::Backpressure.step_code(), StepCode::Unknown);
        assert_eq!(
            Error::HostNotFound("h".into()).step_code(),
            StepCode::NotKnownHost
        );
    }
}
