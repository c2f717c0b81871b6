//! Marshalling between host values and engine memory.
//!
//! [`Records`] interprets fixed-stride arrays the engine owns; it never
//! allocates or frees. [`OutSlots`], [`ImageBuffer`] and [`copy_image`] own
//! what they allocate and release it on drop.

use tracing::trace;

use crate::engine::ResultSlots;
use crate::error::{RdError, Result};
use crate::memory::{Addr, Allocation, LinearMemory, MemoryError};
use crate::types::{Resolution, Resolutions};

/// `{ size_t index; float confidence; }` on wasm32
pub const RESOLUTION_STRIDE: u32 = 8;
const RESOLUTION_CONFIDENCE_OFFSET: u32 = 4;

/// `{ const char* name; void (*func)(void); float threshold; }` on wasm32
pub const METHOD_STRIDE: u32 = 12;
pub const METHOD_THRESHOLD_OFFSET: u32 = 8;

/// Longest method table walked before declaring the sentinel missing.
pub const MAX_METHOD_RECORDS: u32 = 256;

/// A bounds-checked view over `len` records of `stride` bytes.
#[derive(Debug, Clone, Copy)]
pub struct Records {
    base: Addr,
    stride: u32,
    len: u32,
}

impl Records {
    /// Records with a known count.
    pub fn counted(base: Addr, stride: u32, len: u32) -> Self {
        Self { base, stride, len }
    }

    /// Records ending at the first whose leading pointer is NULL. The
    /// sentinel itself is excluded.
    pub fn sentinel_terminated<M: LinearMemory + ?Sized>(
        memory: &M,
        base: Addr,
        stride: u32,
        limit: u32,
    ) -> std::result::Result<Self, MemoryError> {
        let mut len = 0;
        while len < limit {
            let record = record_addr(base, stride, len)?;
            if memory.read_addr(record)?.is_null() {
                return Ok(Self { base, stride, len });
            }
            len += 1;
        }
        Err(MemoryError::MissingSentinel { addr: base, limit })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of record `index`.
    pub fn get(&self, index: u32) -> Option<std::result::Result<Addr, MemoryError>> {
        (index < self.len).then(|| record_addr(self.base, self.stride, index))
    }

    pub fn iter(&self) -> impl Iterator<Item = std::result::Result<Addr, MemoryError>> + '_ {
        (0..self.len).map(move |i| record_addr(self.base, self.stride, i))
    }
}

fn record_addr(base: Addr, stride: u32, index: u32) -> std::result::Result<Addr, MemoryError> {
    let offset = stride
        .checked_mul(index)
        .ok_or(MemoryError::Overflow(base))?;
    base.offset(offset)
}

/// Read `count` resolution records at `base`.
pub fn read_resolutions<M: LinearMemory + ?Sized>(
    memory: &M,
    base: Addr,
    count: u32,
) -> Result<Vec<Resolution>> {
    Records::counted(base, RESOLUTION_STRIDE, count)
        .iter()
        .map(|record| {
            let record = record?;
            let index = memory.read_u32(record)?;
            let confidence = memory.read_f32(record.offset(RESOLUTION_CONFIDENCE_OFFSET)?)?;
            Ok(Resolution::new(index as usize, confidence))
        })
        .collect()
}

/// Copy pixels into a fresh arena buffer of `pixels.len() * 4` bytes.
pub fn copy_image<'m, M: LinearMemory + ?Sized>(
    memory: &'m M,
    pixels: &[f32],
) -> Result<Allocation<'m, M>> {
    let size = u32::try_from(pixels.len())
        .ok()
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(RdError::out_of_memory)?;
    // malloc(0) may legitimately return NULL
    let buffer = Allocation::new(memory, size.max(4))?;
    memory.write_f32_slice(buffer.addr(), pixels)?;
    trace!(addr = %buffer.addr(), pixels = pixels.len(), "image copied");
    Ok(buffer)
}

/// A frame-sized buffer in engine memory, written and fed repeatedly
/// without a fresh allocation per frame.
pub struct ImageBuffer<'m, M: LinearMemory + ?Sized> {
    buffer: Allocation<'m, M>,
    width: u32,
    height: u32,
}

impl<'m, M: LinearMemory + ?Sized> ImageBuffer<'m, M> {
    /// Allocate room for one `width * height` frame.
    pub fn with_dimensions(memory: &'m M, width: u32, height: u32) -> Result<Self> {
        let size = u32::try_from(u64::from(width) * u64::from(height) * 4)
            .map_err(|_| RdError::out_of_memory())?;
        let buffer = Allocation::new(memory, size.max(4))?;
        trace!(addr = %buffer.addr(), width, height, "image buffer allocated");
        Ok(Self {
            buffer,
            width,
            height,
        })
    }

    /// Replace the buffer's contents. `pixels` must fill it exactly.
    pub fn write(&self, pixels: &[f32]) -> Result<()> {
        if pixels.len() as u64 != self.len() {
            return Err(RdError::InvalidImage {
                message: format!(
                    "image buffer holds {} pixels, got {}",
                    self.len(),
                    pixels.len()
                ),
            });
        }
        self.buffer.memory().write_f32_slice(self.buffer.addr(), pixels)?;
        Ok(())
    }

    /// The buffer's current contents.
    pub fn read(&self) -> Result<Vec<f32>> {
        let len = usize::try_from(self.len()).map_err(|_| MemoryError::Overflow(self.addr()))?;
        Ok(self.buffer.memory().read_f32_slice(self.buffer.addr(), len)?)
    }

    /// Pixels per frame.
    pub fn len(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn addr(&self) -> Addr {
        self.buffer.addr()
    }

    pub fn release(self) {
        drop(self)
    }
}

impl<M: LinearMemory + ?Sized> std::fmt::Debug for ImageBuffer<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("addr", &self.addr())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// The four scalar out-parameters of a result query, each its own
/// zeroed allocation.
pub struct OutSlots<'m, M: LinearMemory + ?Sized> {
    widths: Allocation<'m, M>,
    width_count: Allocation<'m, M>,
    heights: Allocation<'m, M>,
    height_count: Allocation<'m, M>,
}

impl<'m, M: LinearMemory + ?Sized> OutSlots<'m, M> {
    /// Allocate all four slots. A failure part-way releases the ones already
    /// acquired.
    pub fn alloc(memory: &'m M) -> Result<Self> {
        Ok(Self {
            width_count: Allocation::scalar(memory)?,
            height_count: Allocation::scalar(memory)?,
            widths: Allocation::scalar(memory)?,
            heights: Allocation::scalar(memory)?,
        })
    }

    pub fn addrs(&self) -> ResultSlots {
        ResultSlots {
            widths: self.widths.addr(),
            width_count: self.width_count.addr(),
            heights: self.heights.addr(),
            height_count: self.height_count.addr(),
        }
    }

    /// Read what a successful engine call left in the slots.
    ///
    /// Both engine arrays are adopted before either is read, so every
    /// address is released exactly once whatever happens while reading.
    pub fn into_resolutions(self) -> Result<Resolutions> {
        let memory = self.widths.memory();

        let width_array = Allocation::adopt(memory, memory.read_addr(self.widths.addr())?);
        let height_array = match memory.read_addr(self.heights.addr()) {
            Ok(addr) => Allocation::adopt(memory, addr),
            Err(err) => return Err(err.into()),
        };

        let width_count = memory.read_u32(self.width_count.addr())?;
        let height_count = memory.read_u32(self.height_count.addr())?;

        let widths = read_resolutions(memory, width_array.addr(), width_count)?;
        let heights = read_resolutions(memory, height_array.addr(), height_count)?;

        trace!(widths = widths.len(), heights = heights.len(), "results read");
        Ok(Resolutions::new(widths, heights))
    }
}
