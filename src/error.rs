//! Error types for circuit construction
//!
//! This module provides the error taxonomy with:
//! - Detailed error variants for each way a hop can fail
//! - Error classification (fatal vs retryable vs caller bug)
//! - Error codes for programmatic handling
//!
//! None of these are recovered inside a single hop attempt. They all
//! surface as a failed circuit with the cause attached, and the caller
//! decides whether to rebuild with fresh IDs and fresh ephemeral keys.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CircuitError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Transport errors (1xx)
    TransportFailed = 100,
    Timeout = 101,
    Cancelled = 102,

    // Protocol errors (2xx)
    MalformedCell = 200,
    ProtocolMismatch = 201,
    CircuitDestroyed = 202,
    StreamClosed = 203,

    // Security errors (4xx) - FATAL
    HandshakeVerificationFailed = 400,

    // Cryptographic errors (5xx)
    CryptoError = 500,

    // Configuration / input errors (8xx)
    ConfigError = 800,
    InvalidNode = 801,

    // Internal errors (9xx)
    InvalidState = 900,
    CircuitIdExhausted = 901,
}

/// Main error type for circuit construction
#[derive(Error, Debug, Clone)]
pub enum CircuitError {
    // ===== Transport Errors =====
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Round trip timed out")]
    Timeout,

    #[error("Circuit build cancelled")]
    Cancelled,

    // ===== Protocol Errors =====
    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Protocol mismatch: expected {expected}, got {got}")]
    ProtocolMismatch { expected: String, got: String },

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Stream closed by exit: reason={reason} ({reason_name})")]
    StreamClosed { reason: u8, reason_name: String },

    // ===== Security Errors (FATAL) =====
    #[error("Handshake verification failed: {0}")]
    HandshakeVerification(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid node: {0}")]
    InvalidNode(String),

    // ===== State Errors =====
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No free circuit ID on this connection")]
    CircuitIdExhausted,
}

impl CircuitError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            CircuitError::Transport(_) => ErrorCode::TransportFailed,
            CircuitError::Timeout => ErrorCode::Timeout,
            CircuitError::Cancelled => ErrorCode::Cancelled,

            CircuitError::MalformedCell(_) => ErrorCode::MalformedCell,
            CircuitError::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            CircuitError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            CircuitError::StreamClosed { .. } => ErrorCode::StreamClosed,

            CircuitError::HandshakeVerification(_) => ErrorCode::HandshakeVerificationFailed,

            CircuitError::Crypto(_) => ErrorCode::CryptoError,

            CircuitError::Config(_) => ErrorCode::ConfigError,
            CircuitError::InvalidNode(_) => ErrorCode::InvalidNode,

            CircuitError::InvalidState(_) => ErrorCode::InvalidState,
            CircuitError::CircuitIdExhausted => ErrorCode::CircuitIdExhausted,
        }
    }

    /// Whether this error points at tampering rather than a flaky network
    ///
    /// A path that produced one of these should be treated with suspicion;
    /// rebuilding over the same relays is the caller's call, not ours.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CircuitError::HandshakeVerification(_)
                | CircuitError::ProtocolMismatch { .. }
                | CircuitError::MalformedCell(_)
        )
    }

    /// Whether rebuilding the whole circuit (fresh ID, fresh keys) may help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CircuitError::Transport(_)
                | CircuitError::Timeout
                | CircuitError::CircuitDestroyed { .. }
                | CircuitError::CircuitIdExhausted
        )
    }

    /// Whether this error is a contract violation by the caller
    pub fn is_bug(&self) -> bool {
        matches!(self, CircuitError::InvalidState(_))
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = match reason {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
        .to_string();

        CircuitError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }

    /// Create a StreamClosed error from a RELAY_END reason
    pub fn stream_closed(reason: u8) -> Self {
        let reason_name = match reason {
            1 => "MISC",
            2 => "RESOLVEFAILED",
            3 => "CONNECTREFUSED",
            4 => "EXITPOLICY",
            5 => "DESTROY",
            6 => "DONE",
            7 => "TIMEOUT",
            8 => "NOROUTE",
            9 => "HIBERNATING",
            10 => "INTERNAL",
            11 => "RESOURCELIMIT",
            12 => "CONNRESET",
            13 => "TORPROTOCOL",
            14 => "NOTDIRECTORY",
            _ => "UNKNOWN",
        }
        .to_string();

        CircuitError::StreamClosed {
            reason,
            reason_name,
        }
    }

    /// Shorthand for a [`CircuitError::ProtocolMismatch`]
    pub fn mismatch(expected: impl ToString, got: impl ToString) -> Self {
        CircuitError::ProtocolMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

impl From<std::io::Error> for CircuitError {
    fn from(err: std::io::Error) -> Self {
        CircuitError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CircuitError {
    fn from(err: serde_json::Error) -> Self {
        CircuitError::Config(err.to_string())
    }
}
