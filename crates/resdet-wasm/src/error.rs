//! Error types for loading a guest module

use thiserror::Error;

/// Result type for host setup
pub type Result<T> = std::result::Result<T, WasmError>;

/// Failures while configuring, compiling or instantiating the guest.
///
/// Failures during engine calls surface as [`resdet::RdError::Host`] instead.
#[derive(Debug, Error)]
pub enum WasmError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile module: {0}")]
    Compile(String),

    #[error("failed to instantiate module: {0}")]
    Instantiate(String),

    #[error("module does not export `{0}` with the expected signature: {1}")]
    MissingExport(&'static str, String),

    #[error("module does not export a linear memory")]
    MissingMemory,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for WasmError {
    fn from(err: serde_json::Error) -> Self {
        WasmError::Config(err.to_string())
    }
}
