//! Engine call shapes.
//!
//! [`Engine`] is the seam between the binding layer and whatever actually
//! runs the detector: a wasm guest, a native library, or the in-process
//! `MemoryEngine` built with the `testing` feature. Calls mirror the native
//! ABI one-to-one. Pointers are [`Addr`]s into the engine's [`LinearMemory`];
//! out-parameters are addresses of scalar slots the caller allocated.
//! Strings cross as host strings, the way a call wrapper would convert them.
//!
//! Every call returns `Ok` with the raw native result. `Err` is reserved for
//! failures of the host itself (a trap, a missing export), which the native
//! engine has no status for.

#[cfg(any(test, feature = "testing"))]
pub mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::{Addr, LinearMemory};

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryEngine;

/// Native status code. Zero is success; negative values are negated errno.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(i32);

impl Status {
    pub const OK: Status = Status(0);
    pub const NOMEM: Status = Status(1);
    pub const INTERNAL: Status = Status(2);
    pub const INVAL: Status = Status(3);
    pub const UNSUPP: Status = Status(4);
    pub const TOOBIG: Status = Status(5);
    pub const PARAM: Status = Status(6);
    pub const NOIMG: Status = Status(7);

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// The OS error number for negative statuses.
    pub fn errno(self) -> Option<i32> {
        (self.0 < 0).then(|| -self.0)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::OK => "OK",
            Self::NOMEM => "NOMEM",
            Self::INTERNAL => "INTERNAL",
            Self::INVAL => "INVAL",
            Self::UNSUPP => "UNSUPP",
            Self::TOOBIG => "TOOBIG",
            Self::PARAM => "PARAM",
            Self::NOIMG => "NOIMG",
            _ => return write!(f, "Status({})", self.0),
        };
        f.write_str(name)
    }
}

impl From<i32> for Status {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

/// Identity of a record in the engine's static method table.
///
/// Never allocated, mutated, or released by the binding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle(Addr);

impl MethodHandle {
    pub(crate) fn new(record: Addr) -> Self {
        Self(record)
    }

    pub fn addr(self) -> Addr {
        self.0
    }
}

/// Addresses of the four out-parameters of a result query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSlots {
    /// Receives the address of the width array
    pub widths: Addr,
    /// Receives the width count
    pub width_count: Addr,
    /// Receives the address of the height array
    pub heights: Addr,
    /// Receives the height count
    pub height_count: Addr,
}

/// The native engine, by responsibility.
pub trait Engine {
    type Memory: LinearMemory + ?Sized;

    /// The address space every call below operates in.
    fn memory(&self) -> &Self::Memory;

    /// Engine version string.
    fn lib_version(&self) -> Result<String>;

    /// Search range used when none is given.
    fn default_range(&self) -> Result<u32>;

    /// Human-readable text for a status; `None` when the engine has none.
    fn error_str(&self, status: Status) -> Result<Option<String>>;

    /// Base of the sentinel-terminated method table.
    fn methods(&self) -> Result<Addr>;

    /// Record for `name`, or NULL.
    fn get_method(&self, name: &str) -> Result<Addr>;

    /// A parameter object holding engine defaults, or NULL on exhaustion.
    /// Released with [`LinearMemory::free`].
    fn alloc_default_parameters(&self) -> Result<Addr>;

    fn parameters_set_range(&self, params: Addr, range: u32) -> Result<Status>;

    fn parameters_set_threshold(&self, params: Addr, threshold: f32) -> Result<Status>;

    fn parameters_set_compression_filter(&self, params: Addr, filter: u32) -> Result<Status>;

    /// Stateless detection over `image_count` stacked frames.
    ///
    /// On success the slots hold engine-allocated arrays the caller releases.
    #[allow(clippy::too_many_arguments)]
    fn resdetect(
        &self,
        image: Addr,
        image_count: u32,
        width: u32,
        height: u32,
        slots: ResultSlots,
        method: Addr,
        params: Addr,
    ) -> Result<Status>;

    /// Open a session. Writes the status to `error_out` and returns NULL on
    /// failure.
    fn create_analysis(
        &self,
        method: Addr,
        width: u32,
        height: u32,
        params: Addr,
        error_out: Addr,
    ) -> Result<Addr>;

    /// Integrate one `width * height` frame into a session.
    fn analyze_image(&self, analysis: Addr, image: Addr) -> Result<Status>;

    /// Results accumulated so far, written to `slots` as in [`resdetect`](Self::resdetect).
    fn analysis_results(&self, analysis: Addr, slots: ResultSlots) -> Result<Status>;

    /// Release a session handle.
    fn destroy_analysis(&self, analysis: Addr) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_debug_names() {
        assert_eq!(format!("{:?}", Status::NOIMG), "NOIMG");
        assert_eq!(format!("{:?}", Status::new(-2)), "Status(-2)");
    }

    #[test]
    fn test_errno() {
        assert_eq!(Status::new(-2).errno(), Some(2));
        assert_eq!(Status::INVAL.errno(), None);
        assert!(Status::OK.is_ok());
    }
}
