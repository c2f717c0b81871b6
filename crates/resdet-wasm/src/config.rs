//! Host configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WasmError};

/// Environment variable naming the guest module.
pub const MODULE_ENV: &str = "RESDET_WASM_MODULE";
/// Environment variable capping guest linear memory, in bytes.
pub const MAX_MEMORY_ENV: &str = "RESDET_WASM_MAX_MEMORY";

/// Where the guest lives and how much it may grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmConfig {
    /// Path to the `.wasm` module
    pub module: PathBuf,

    /// Ceiling on guest linear memory; growth past it fails like `malloc`
    #[serde(default)]
    pub max_memory_bytes: Option<usize>,

    /// Reactor initializer run once after instantiation, if exported
    #[serde(default = "default_initializer")]
    pub initializer: Option<String>,
}

fn default_initializer() -> Option<String> {
    Some("_initialize".to_string())
}

impl WasmConfig {
    pub fn new(module: impl Into<PathBuf>) -> Self {
        Self {
            module: module.into(),
            max_memory_bytes: None,
            initializer: default_initializer(),
        }
    }

    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Read `RESDET_WASM_MODULE` and `RESDET_WASM_MAX_MEMORY`.
    pub fn from_env() -> Result<Self> {
        let module = std::env::var_os(MODULE_ENV)
            .ok_or_else(|| WasmError::Config(format!("{MODULE_ENV} is not set")))?;
        let mut config = Self::new(module);

        if let Ok(max) = std::env::var(MAX_MEMORY_ENV) {
            let bytes = max
                .parse()
                .map_err(|_| WasmError::Config(format!("{MAX_MEMORY_ENV} is not a byte count: {max}")))?;
            config.max_memory_bytes = Some(bytes);
        }
        Ok(config)
    }

    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }
}
