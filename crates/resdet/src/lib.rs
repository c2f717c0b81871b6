//! # resdet binding layer
//!
//! Safe access to the resdet resolution detection engine across a flat
//! linear-memory boundary. The engine itself is opaque: this crate only knows
//! the shapes of what it consumes and returns.
//!
//! - **error**: engine status translation into typed errors
//! - **memory**: the linear-memory capability and single-release allocations
//! - **engine**: the engine call shapes
//! - **method**: the engine's method table
//! - **params**: sparse parameter overrides and their native marshalling
//! - **detect**: one-shot detection
//! - **analysis**: stateful sessions accumulating evidence across images
//! - **tracing**: logging setup
//!
//! An engine comes from `resdet-wasm`, which runs a wasm32 build of
//! libresdet: `Resdet::new(WasmEngine::load(&config)?)`. The `testing`
//! feature adds an in-process `MemoryEngine` over a `HeapArena`. Its scoring
//! is a stand-in for exercising this crate, not a detector.
//!
//! ## Usage
//!
//! ```rust
//! use resdet::{Engine, ParameterOverrides, Resdet};
//!
//! fn session_matches_one_shot<E: Engine>(resdet: &Resdet<E>) -> resdet::Result<bool> {
//!     let checkerboard = [1.0, 0.0, 0.0, 1.0];
//!     let once = resdet.detect(&checkerboard, 1, 2, 2, None, &ParameterOverrides::default())?;
//!
//!     let mut analysis = resdet.analysis(2, 2, None, &ParameterOverrides::default())?;
//!     analysis.analyze_image(&checkerboard)?;
//!     let matches = analysis.results()? == once;
//!     analysis.destroy()?;
//!     Ok(matches)
//! }
//! ```
//!
//! ## Concurrency
//!
//! The engine is not reentrant per session. [`Analysis`] takes `&mut self` for
//! every operation so overlapping calls on one session cannot be expressed.
//! Independent sessions share the engine value; whether they may run on
//! separate threads depends on the [`Engine`] implementation.

pub mod analysis;
pub mod client;
pub mod detect;
pub mod engine;
pub mod error;
pub mod marshal;
pub mod memory;
pub mod method;
pub mod params;
pub mod tracing;
pub mod types;

// Re-export main types at crate root
pub use analysis::Analysis;
pub use client::Resdet;
pub use engine::{Engine, MethodHandle, ResultSlots, Status};
#[cfg(any(test, feature = "testing"))]
pub use engine::MemoryEngine;
pub use error::{ErrorKind, RdError, Result};
pub use marshal::ImageBuffer;
pub use memory::{Addr, Allocation, LinearMemory, MemoryError};
#[cfg(any(test, feature = "testing"))]
pub use memory::{HeapArena, HeapConfig};
pub use method::Method;
pub use params::ParameterOverrides;
pub use types::{Resolution, Resolutions};
