//! The engine's method table.
//!
//! Methods live in engine-owned static memory. This module only reads them;
//! nothing here allocates or releases.

use serde::Serialize;
use tracing::trace;

use crate::engine::{Engine, MethodHandle};
use crate::error::Result;
use crate::marshal::{Records, MAX_METHOD_RECORDS, METHOD_STRIDE, METHOD_THRESHOLD_OFFSET};
use crate::memory::{Addr, LinearMemory};

/// A named detection heuristic and its default threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Method {
    name: String,
    threshold: f32,
    #[serde(skip)]
    handle: MethodHandle,
}

impl Method {
    /// Materialize the record at `record`.
    pub(crate) fn from_record<M: LinearMemory + ?Sized>(memory: &M, record: Addr) -> Result<Self> {
        let name = memory.read_cstr(memory.read_addr(record)?)?;
        let threshold = memory.read_f32(record.offset(METHOD_THRESHOLD_OFFSET)?)?;
        Ok(Self {
            name,
            threshold,
            handle: MethodHandle::new(record),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The engine's default sensitivity for this method.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn handle(&self) -> MethodHandle {
        self.handle
    }
}

/// Every method, in engine order.
pub fn list_methods<E: Engine + ?Sized>(engine: &E) -> Result<Vec<Method>> {
    let memory = engine.memory();
    let table = engine.methods()?;
    let records = Records::sentinel_terminated(memory, table, METHOD_STRIDE, MAX_METHOD_RECORDS)?;
    trace!(%table, count = records.len(), "method table read");

    records
        .iter()
        .map(|record| Method::from_record(memory, record?))
        .collect()
}

/// The method called exactly `name`, or `None`.
pub fn get_method<E: Engine + ?Sized>(engine: &E, name: &str) -> Result<Option<Method>> {
    let record = engine.get_method(name)?;
    if record.is_null() {
        return Ok(None);
    }
    Method::from_record(engine.memory(), record).map(Some)
}
