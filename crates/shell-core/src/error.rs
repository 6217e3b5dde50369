use thiserror::Error;

use crate::engine::EngineFault;

/// Errors that can occur while driving a remote session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Deadline exceeded while retrying or waiting for readiness
    #[error("operation timed out")]
    Timeout,

    /// A cancellation flag was raised while the operation was waiting
    #[error("operation cancelled")]
    Cancelled,

    /// The session has been disconnected
    #[error("session is disconnected")]
    Disconnected,

    /// Poller or socket syscall failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The protocol engine reported a failure
    #[error("engine error ({code}): {message}")]
    Engine { code: i32, message: String },

    /// A channel read, write or close failed
    #[error("channel error ({code}): {message}")]
    Channel { code: i32, message: String },

    /// Invalid port number
    #[error("port must be a valid number between 0-65535: {0}")]
    InvalidPort(String),

    /// Invalid forwarding specification
    #[error("invalid {kind} forward spec: {message}")]
    InvalidForwardSpec { kind: String, message: String },

    /// Network binding failed
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection failed
    #[error("failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A polite close step kept reporting would-block
    #[error("channel close aborted during {step} after {attempts} attempts")]
    CloseAborted { step: &'static str, attempts: u32 },

    /// Another task panicked while holding the engine lock
    #[error("engine lock poisoned")]
    LockPoisoned,

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Create an invalid forward spec error
    pub fn invalid_forward(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidForwardSpec {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn engine(fault: EngineFault) -> Self {
        Self::Engine {
            code: fault.code,
            message: fault.message,
        }
    }

    pub fn channel(fault: EngineFault) -> Self {
        Self::Channel {
            code: fault.code,
            message: fault.message,
        }
    }

    /// True for errors that mean the deadline ran out rather than a hard failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
