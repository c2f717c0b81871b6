//! Linear-memory arena capability.
//!
//! The engine runs inside a single flat 32-bit address space. Images, scratch
//! out-parameters, parameter objects and result arrays all cross the boundary
//! as addresses into that space.
//!
//! # Memory Protocol
//!
//! - [`LinearMemory::alloc`] returns `None` where the native allocator would
//!   return NULL; it never panics on exhaustion
//! - [`LinearMemory::free`] of [`Addr::NULL`] is a no-op
//! - Reads and writes are bounds-checked; address 0 is never dereferenced
//! - Scalars are little-endian, matching wasm32
//!
//! Ownership of an address is expressed with [`Allocation`], which releases
//! exactly once on drop.

mod allocation;
#[cfg(any(test, feature = "testing"))]
pub mod heap;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use allocation::Allocation;
#[cfg(any(test, feature = "testing"))]
pub use heap::{HeapArena, HeapConfig, HeapStats};

/// Upper bound on engine-owned string length read by [`LinearMemory::read_cstr`].
pub const MAX_CSTR_LENGTH: usize = 4096;

/// An address in linear memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Addr(u32);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub fn offset(self, bytes: u32) -> Result<Addr, MemoryError> {
        self.0
            .checked_add(bytes)
            .map(Addr)
            .ok_or(MemoryError::Overflow(self))
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({:#010x})", self.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Faults raised while interpreting linear memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Access past the end of the address space
    #[error("access of {len} bytes at {addr} is out of bounds (memory size {size})")]
    OutOfBounds { addr: Addr, len: usize, size: usize },

    /// Dereference of address 0
    #[error("null address dereferenced")]
    Null,

    /// Address arithmetic wrapped past 4 GiB
    #[error("address arithmetic overflowed at {0}")]
    Overflow(Addr),

    /// String without a terminator within the read limit
    #[error("string at {0} is not NUL-terminated")]
    Unterminated(Addr),

    /// Record table without a sentinel within the read limit
    #[error("record table at {addr} has no sentinel within {limit} records")]
    MissingSentinel { addr: Addr, limit: u32 },
}

/// Raw access to the engine's address space.
///
/// Implementations use interior mutability: the arena is a shared external
/// resource and every method takes `&self`.
pub trait LinearMemory {
    /// Allocate `size` bytes. `None` when the allocator is exhausted.
    fn alloc(&self, size: u32) -> Option<Addr>;

    /// Release an address returned by [`alloc`](Self::alloc) or by the engine.
    fn free(&self, addr: Addr);

    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    fn read(&self, addr: Addr, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copy `bytes` into memory starting at `addr`.
    fn write(&self, addr: Addr, bytes: &[u8]) -> Result<(), MemoryError>;

    fn read_u32(&self, addr: Addr) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&self, addr: Addr) -> Result<i32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_f32(&self, addr: Addr) -> Result<f32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    /// Read a pointer-sized (32-bit) value as an address.
    fn read_addr(&self, addr: Addr) -> Result<Addr, MemoryError> {
        self.read_u32(addr).map(Addr::new)
    }

    fn write_u32(&self, addr: Addr, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_i32(&self, addr: Addr, value: i32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_f32(&self, addr: Addr, value: f32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_addr(&self, addr: Addr, value: Addr) -> Result<(), MemoryError> {
        self.write_u32(addr, value.get())
    }

    /// Write `values` as consecutive little-endian `f32`s.
    fn write_f32_slice(&self, addr: Addr, values: &[f32]) -> Result<(), MemoryError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write(addr, &bytes)
    }

    /// Read `count` consecutive little-endian `f32`s.
    fn read_f32_slice(&self, addr: Addr, count: usize) -> Result<Vec<f32>, MemoryError> {
        let mut bytes = vec![0u8; count * 4];
        self.read(addr, &mut bytes)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Read a NUL-terminated string, replacing invalid UTF-8.
    fn read_cstr(&self, addr: Addr) -> Result<String, MemoryError> {
        if addr.is_null() {
            return Err(MemoryError::Null);
        }
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        for i in 0..MAX_CSTR_LENGTH as u32 {
            self.read(addr.offset(i)?, &mut byte)?;
            if byte[0] == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(byte[0]);
        }
        Err(MemoryError::Unterminated(addr))
    }
}

impl<M: LinearMemory + ?Sized> LinearMemory for &M {
    fn alloc(&self, size: u32) -> Option<Addr> {
        (**self).alloc(size)
    }

    fn free(&self, addr: Addr) {
        (**self).free(addr)
    }

    fn read(&self, addr: Addr, buf: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read(addr, buf)
    }

    fn write(&self, addr: Addr, bytes: &[u8]) -> Result<(), MemoryError> {
        (**self).write(addr, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_offset_overflow() {
        assert_eq!(Addr::new(8).offset(4), Ok(Addr::new(12)));
        assert_eq!(
            Addr::new(u32::MAX).offset(1),
            Err(MemoryError::Overflow(Addr::new(u32::MAX)))
        );
    }

    #[test]
    fn test_addr_display() {
        assert_eq!(Addr::new(0x40).to_string(), "0x00000040");
        assert!(Addr::NULL.is_null());
    }

    #[test]
    fn test_scalar_round_trip_through_heap() {
        let heap = HeapArena::new();
        let addr = heap.alloc(16).unwrap();
        heap.write_i32(addr, -7).unwrap();
        heap.write_f32(addr.offset(4).unwrap(), 0.55).unwrap();
        assert_eq!(heap.read_i32(addr).unwrap(), -7);
        assert_eq!(heap.read_f32(addr.offset(4).unwrap()).unwrap(), 0.55);
        heap.free(addr);
    }

    #[test]
    fn test_read_cstr() {
        let heap = HeapArena::new();
        let addr = heap.alloc(6).unwrap();
        heap.write(addr, b"zerox\0").unwrap();
        assert_eq!(heap.read_cstr(addr).unwrap(), "zerox");
        assert_eq!(heap.read_cstr(Addr::NULL), Err(MemoryError::Null));
        heap.free(addr);
    }
}
