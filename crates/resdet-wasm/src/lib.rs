//! # resdet-wasm
//!
//! Runs a wasm32 build of libresdet under wasmtime and exposes it as a
//! [`resdet::Engine`]. The guest's exported `memory`, `malloc` and `free`
//! back the [`resdet::LinearMemory`] capability.
//!
//! ```rust,no_run
//! use resdet::{ParameterOverrides, Resdet};
//! use resdet_wasm::{WasmConfig, WasmEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = WasmEngine::load(&WasmConfig::new("libresdet.wasm"))?;
//! let resdet = Resdet::new(engine);
//! let result = resdet.detect(&[1.0, 0.0, 0.0, 1.0], 1, 2, 2, None, &ParameterOverrides::new())?;
//! println!("{}", serde_json::to_string(&result)?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;

pub use config::WasmConfig;
pub use engine::WasmEngine;
pub use error::{Result, WasmError};
