//! Error types and engine status translation.

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::engine::{Engine, Status};
use crate::memory::MemoryError;

/// Result type for binding operations
pub type Result<T> = std::result::Result<T, RdError>;

/// Message for allocation failures raised without consulting the engine.
const OUT_OF_MEMORY: &str = "Out of memory.";

/// Flat classification of [`RdError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    OutOfMemory,
    InvalidParameter,
    UnrecognizedOption,
    InvalidImage,
    NoImagesAnalyzed,
    EngineFailure,
    MemoryFault,
    Host,
}

/// Errors surfaced by the binding layer.
///
/// Every variant carries its user-visible message; no partial result is ever
/// returned alongside one.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RdError {
    /// Arena allocation failed, or the engine reported exhaustion
    #[error("{message}")]
    OutOfMemory { message: String },

    /// A parameter value was rejected
    #[error("{message}")]
    InvalidParameter {
        status: Option<Status>,
        message: String,
    },

    /// Parameter keys outside the recognized set, in input order
    #[error("Unrecognized parameters: {}", .keys.join(","))]
    UnrecognizedOption { keys: Vec<String> },

    /// Zero dimensions, non-finite pixels, or a short buffer
    #[error("{message}")]
    InvalidImage { message: String },

    /// Results requested with no images submitted
    #[error("{message}")]
    NoImagesAnalyzed { message: String },

    /// Any other non-zero engine status
    #[error("{message}")]
    EngineFailure { status: Status, message: String },

    /// Engine memory could not be interpreted
    #[error("memory fault: {0}")]
    Memory(#[from] MemoryError),

    /// The host running the engine failed (trap, missing export)
    #[error("engine host error: {0}")]
    Host(String),
}

impl RdError {
    /// Local allocation failure.
    pub fn out_of_memory() -> Self {
        Self::OutOfMemory {
            message: OUT_OF_MEMORY.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::UnrecognizedOption { .. } => ErrorKind::UnrecognizedOption,
            Self::InvalidImage { .. } => ErrorKind::InvalidImage,
            Self::NoImagesAnalyzed { .. } => ErrorKind::NoImagesAnalyzed,
            Self::EngineFailure { .. } => ErrorKind::EngineFailure,
            Self::Memory(_) => ErrorKind::MemoryFault,
            Self::Host(_) => ErrorKind::Host,
        }
    }

    /// The engine status behind this error, when there is one.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::InvalidParameter { status, .. } => *status,
            Self::InvalidImage { .. } => Some(Status::INVAL),
            Self::NoImagesAnalyzed { .. } => Some(Status::NOIMG),
            Self::EngineFailure { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify a status with an already-resolved message.
    pub fn from_status(status: Status, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            Status::NOMEM => Self::OutOfMemory { message },
            Status::INVAL => Self::InvalidImage { message },
            Status::PARAM => Self::InvalidParameter {
                status: Some(status),
                message,
            },
            Status::NOIMG => Self::NoImagesAnalyzed { message },
            _ => Self::EngineFailure { status, message },
        }
    }
}

/// Translate a native status into a typed error, with the message sourced
/// from the engine.
pub fn translate<E: Engine + ?Sized>(engine: &E, status: Status) -> RdError {
    let message = match engine.error_str(status) {
        Ok(Some(message)) if !message.is_empty() => message,
        Ok(_) => fallback_message(status),
        Err(err) => {
            warn!(status = status.code(), error = %err, "engine could not describe status");
            fallback_message(status)
        }
    };
    RdError::from_status(status, message)
}

/// Return `Ok(())` for a zero status, the translated error otherwise.
pub(crate) fn check<E: Engine + ?Sized>(engine: &E, status: Status) -> Result<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(translate(engine, status))
    }
}

fn fallback_message(status: Status) -> String {
    format!("unknown error (status {})", status.code())
}
