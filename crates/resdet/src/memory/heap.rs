//! In-process heap arena.
//!
//! A growable byte vector standing in for a wasm32 linear memory, with a
//! first-fit allocator and allocation accounting. Used by [`MemoryEngine`]
//! and by tests that need to observe leaks or double releases.
//!
//! Default limits: 64 KiB initial, 64 MiB ceiling.
//!
//! [`MemoryEngine`]: crate::engine::MemoryEngine

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::memory::{Addr, LinearMemory, MemoryError};

const ALIGN: u32 = 8;
/// First usable address; keeps every allocation away from NULL.
const BASE: u32 = 16;

/// Arena sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Bytes reserved up front
    pub initial_size: u32,
    /// Ceiling the arena never grows past; allocations beyond it fail
    pub max_size: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_size: 64 * 1024,
            max_size: 64 * 1024 * 1024,
        }
    }
}

impl HeapConfig {
    pub fn new(initial_size: u32, max_size: u32) -> Self {
        Self {
            initial_size: initial_size.min(max_size),
            max_size,
        }
    }
}

/// Allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub allocations: u64,
    pub releases: u64,
    pub failed_allocations: u64,
    /// Frees of addresses that were not live (double or foreign releases)
    pub invalid_releases: u64,
    pub live_bytes: u64,
    pub peak_bytes: u64,
}

#[derive(Debug)]
struct HeapState {
    bytes: Vec<u8>,
    /// addr -> rounded size
    live: BTreeMap<u32, u32>,
    /// addr -> rounded size
    free: BTreeMap<u32, u32>,
    top: u32,
    /// Successful allocations still permitted before failures are injected
    budget: Option<u64>,
    stats: HeapStats,
}

/// A bounded, accounting linear-memory arena.
#[derive(Debug)]
pub struct HeapArena {
    config: HeapConfig,
    state: Mutex<HeapState>,
}

impl Default for HeapArena {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapArena {
    /// Create an arena with default limits.
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Create an arena with custom limits.
    pub fn with_config(config: HeapConfig) -> Self {
        let initial = config.initial_size.max(BASE) as usize;
        Self {
            config,
            state: Mutex::new(HeapState {
                bytes: vec![0; initial],
                live: BTreeMap::new(),
                free: BTreeMap::new(),
                top: BASE,
                budget: None,
                stats: HeapStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Number of addresses currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn stats(&self) -> HeapStats {
        self.state.lock().stats
    }

    /// Current size of the address space in bytes.
    pub fn size(&self) -> usize {
        self.state.lock().bytes.len()
    }

    /// Let `n` more allocations succeed, then fail every one after.
    /// `None` lifts the limit.
    pub fn fail_allocations_after(&self, n: Option<u64>) {
        self.state.lock().budget = n;
    }

    fn round(size: u32) -> Option<u32> {
        size.max(1).checked_add(ALIGN - 1).map(|s| s & !(ALIGN - 1))
    }
}

impl HeapState {
    fn take_free_block(&mut self, size: u32) -> Option<u32> {
        let (&addr, &len) = self.free.iter().find(|(_, len)| **len >= size)?;
        self.free.remove(&addr);
        if len > size {
            self.free.insert(addr + size, len - size);
        }
        Some(addr)
    }

    fn bump(&mut self, size: u32, max_size: u32) -> Option<u32> {
        let end = self.top.checked_add(size)?;
        if end > max_size {
            return None;
        }
        if end as usize > self.bytes.len() {
            let grown = (self.bytes.len() * 2).max(end as usize).min(max_size as usize);
            self.bytes.resize(grown, 0);
        }
        let addr = self.top;
        self.top = end;
        Some(addr)
    }

    /// Return a block to the free list, merged with free neighbours. A block
    /// ending at `top` lowers `top` instead.
    fn release_block(&mut self, mut addr: u32, mut size: u32) {
        if let Some((&prev, &prev_size)) = self.free.range(..addr).next_back() {
            if prev + prev_size == addr {
                self.free.remove(&prev);
                addr = prev;
                size += prev_size;
            }
        }
        let end = addr + size;
        if let Some(next_size) = self.free.remove(&end) {
            size += next_size;
        }

        if addr + size == self.top {
            self.top = addr;
        } else {
            self.free.insert(addr, size);
        }
    }

    fn check(&self, addr: Addr, len: usize) -> Result<usize, MemoryError> {
        if addr.is_null() {
            return Err(MemoryError::Null);
        }
        let start = addr.get() as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(start),
            _ => Err(MemoryError::OutOfBounds {
                addr,
                len,
                size: self.bytes.len(),
            }),
        }
    }
}

impl LinearMemory for HeapArena {
    fn alloc(&self, size: u32) -> Option<Addr> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(budget) = state.budget {
            if budget == 0 {
                state.stats.failed_allocations += 1;
                return None;
            }
            state.budget = Some(budget - 1);
        }

        let rounded = match Self::round(size) {
            Some(rounded) => rounded,
            None => {
                state.stats.failed_allocations += 1;
                return None;
            }
        };

        let addr = match state.take_free_block(rounded) {
            Some(addr) => addr,
            None => match state.bump(rounded, self.config.max_size) {
                Some(addr) => addr,
                None => {
                    state.stats.failed_allocations += 1;
                    return None;
                }
            },
        };

        let start = addr as usize;
        state.bytes[start..start + rounded as usize].fill(0);
        state.live.insert(addr, rounded);
        state.stats.allocations += 1;
        state.stats.live_bytes += u64::from(rounded);
        state.stats.peak_bytes = state.stats.peak_bytes.max(state.stats.live_bytes);
        Some(Addr::new(addr))
    }

    fn free(&self, addr: Addr) {
        if addr.is_null() {
            return;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.live.remove(&addr.get()) {
            Some(size) => {
                state.release_block(addr.get(), size);
                state.stats.releases += 1;
                state.stats.live_bytes -= u64::from(size);
            }
            None => {
                state.stats.invalid_releases += 1;
                warn!(%addr, "release of an address that is not live");
            }
        }
    }

    fn read(&self, addr: Addr, buf: &mut [u8]) -> Result<(), MemoryError> {
        let state = self.state.lock();
        let start = state.check(addr, buf.len())?;
        buf.copy_from_slice(&state.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, addr: Addr, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let start = state.check(addr, bytes.len())?;
        state.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
