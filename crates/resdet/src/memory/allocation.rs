//! Single-release ownership of an arena address.

use tracing::trace;

use crate::error::{RdError, Result};
use crate::memory::{Addr, LinearMemory};

/// An owned address in linear memory, released exactly once.
///
/// Acquired either by allocating ([`Allocation::new`]) or by adopting an
/// address the engine handed over ([`Allocation::adopt`]). Released by
/// [`Allocation::release`] or on drop, never both.
pub struct Allocation<'m, M: LinearMemory + ?Sized> {
    memory: &'m M,
    addr: Addr,
}

impl<'m, M: LinearMemory + ?Sized> Allocation<'m, M> {
    /// Allocate `size` bytes, failing with `OutOfMemory` when the arena is
    /// exhausted. The engine is not consulted for the message.
    pub fn new(memory: &'m M, size: u32) -> Result<Self> {
        match memory.alloc(size) {
            Some(addr) if !addr.is_null() => {
                trace!(%addr, size, "allocated");
                Ok(Self { memory, addr })
            }
            _ => Err(RdError::out_of_memory()),
        }
    }

    /// Allocate a zeroed 32-bit scalar slot.
    pub fn scalar(memory: &'m M) -> Result<Self> {
        let slot = Self::new(memory, 4)?;
        memory.write_u32(slot.addr, 0)?;
        Ok(slot)
    }

    /// Take ownership of an address produced by the engine. Null is accepted
    /// and releases as a no-op.
    pub fn adopt(memory: &'m M, addr: Addr) -> Self {
        Self { memory, addr }
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn memory(&self) -> &'m M {
        self.memory
    }

    /// Release now rather than at end of scope.
    pub fn release(self) {
        drop(self)
    }
}

impl<M: LinearMemory + ?Sized> Drop for Allocation<'_, M> {
    fn drop(&mut self) {
        if !self.addr.is_null() {
            trace!(addr = %self.addr, "released");
            self.memory.free(self.addr);
            self.addr = Addr::NULL;
        }
    }
}

impl<M: LinearMemory + ?Sized> std::fmt::Debug for Allocation<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation").field("addr", &self.addr).finish()
    }
}
