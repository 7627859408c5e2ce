//! Per-surface buffer recycling
//!
//! The pool keeps a small ring of buffers for one client surface (a single
//! buffer by default) and hands one out per frame:
//!
//! - **Reuse** a buffer that is free and large enough, in place
//! - **Replace** otherwise, with a fresh allocation from the platform
//!
//! Replacing only drops the pool's own reference. A buffer that is still
//! posted stays alive through the display path's [`PostedBuffer`] until its
//! release arrives.
//!
//! # Usage
//!
//! ```no_run
//! use axiom_graphics::buffer::{BufferPool, PixelFormat, PostedBuffer};
//! use axiom_graphics::geometry::{Size, Stride};
//! use axiom_graphics::platform::shm::{ShmPlatform, ShmSearchPath};
//! use std::sync::Arc;
//!
//! let platform = Arc::new(ShmPlatform::new(ShmSearchPath::from_env())?);
//! let mut pool = BufferPool::new(platform, PixelFormat::Argb8888, 1);
//!
//! let buffer = pool.get_buffer(Size::new(64, 64), Stride(256))?;
//! buffer.pixels().unwrap().fill(0xff);
//! let posted = PostedBuffer::new(buffer); // hand to the display path
//! drop(posted); // release: the buffer can be reused
//! # Ok::<(), axiom_graphics::error::AllocationError>(())
//! ```
//!
//! [`PostedBuffer`]: super::PostedBuffer

use log::{debug, info};
use std::sync::Arc;

use super::{PixelBuffer, PixelFormat};
use crate::error::AllocationError;
use crate::geometry::{Size, Stride};
use crate::platform::{check_geometry, NativeBufferPlatform};

/// Deepest ring a pool accepts
pub const MAX_RING_DEPTH: usize = 8;

/// Statistics about pool behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total `get_buffer` calls
    pub acquisitions: usize,
    /// Calls served by an existing buffer
    pub reuses: usize,
    /// Calls that allocated a new buffer
    pub allocations: usize,
    /// Allocations that displaced an existing slot
    pub replacements: usize,
    /// Allocation attempts that failed
    pub failures: usize,
}

impl PoolStats {
    /// Percentage of acquisitions served without allocating
    pub fn reuse_rate(&self) -> f32 {
        if self.acquisitions == 0 {
            return 0.0;
        }
        (self.reuses as f32 / self.acquisitions as f32) * 100.0
    }
}

#[derive(Debug)]
struct Slot {
    buffer: Arc<PixelBuffer>,
    last_handout: u64,
}

/// Buffer recycler for one logical surface
pub struct BufferPool {
    platform: Arc<dyn NativeBufferPlatform>,
    format: PixelFormat,
    ring_depth: usize,
    slots: Vec<Slot>,
    handouts: u64,
    stats: PoolStats,
}

impl BufferPool {
    /// Creates a pool allocating `format` buffers from `platform`.
    ///
    /// `ring_depth` is clamped to `1..=MAX_RING_DEPTH`; 1 is single
    /// buffering gated on release.
    pub fn new(
        platform: Arc<dyn NativeBufferPlatform>,
        format: PixelFormat,
        ring_depth: usize,
    ) -> Self {
        let ring_depth = ring_depth.clamp(1, MAX_RING_DEPTH);
        debug!(
            "Creating {} buffer pool: format={:?} ring_depth={}",
            platform.name(),
            format,
            ring_depth
        );
        Self {
            platform,
            format,
            ring_depth,
            slots: Vec::with_capacity(ring_depth),
            handouts: 0,
            stats: PoolStats::default(),
        }
    }

    /// Returns a buffer of at least `height × stride` bytes, marked in-use.
    ///
    /// A slot is reused when it exists, is not in use, and is large enough,
    /// checked in that order. Otherwise a new buffer is allocated; if that
    /// fails the pool is left exactly as it was.
    pub fn get_buffer(
        &mut self,
        size: Size,
        stride: Stride,
    ) -> Result<Arc<PixelBuffer>, AllocationError> {
        self.stats.acquisitions += 1;
        // Same answer warm or cold: a slot never excuses bad geometry
        let needed = match check_geometry(size, stride, self.format) {
            Ok(needed) => needed,
            Err(err) => {
                self.stats.failures += 1;
                return Err(err);
            }
        };

        let reusable = self.slots.iter().position(|slot| {
            !slot.buffer.is_in_use() && needed <= slot.buffer.extent() && slot.buffer.try_claim()
        });

        if let Some(index) = reusable {
            self.stats.reuses += 1;
            return Ok(self.hand_out(index));
        }

        let buffer = match self.platform.allocate(size, stride, self.format) {
            Ok(buffer) => Arc::new(buffer),
            Err(err) => {
                self.stats.failures += 1;
                return Err(err);
            }
        };
        // Fresh buffers are unshared, so the claim cannot lose a race.
        buffer.try_claim();
        self.stats.allocations += 1;

        let slot = Slot {
            buffer,
            last_handout: 0,
        };
        let index = if self.slots.len() < self.ring_depth {
            self.slots.push(slot);
            self.slots.len() - 1
        } else {
            let victim = self.victim();
            let old = std::mem::replace(&mut self.slots[victim], slot);
            self.stats.replacements += 1;
            debug!(
                "Replacing pooled buffer {:?} ({:?}, in_use={}) with {:?}",
                old.buffer.id(),
                old.buffer.size(),
                old.buffer.is_in_use(),
                self.slots[victim].buffer.id()
            );
            victim
        };

        info!(
            "🆕 Allocated {} buffer {:?}: {}x{} stride {}",
            self.platform.name(),
            self.slots[index].buffer.id(),
            size.width,
            size.height,
            stride.as_u32()
        );
        Ok(self.hand_out(index))
    }

    fn hand_out(&mut self, index: usize) -> Arc<PixelBuffer> {
        self.handouts += 1;
        let slot = &mut self.slots[index];
        slot.last_handout = self.handouts;
        slot.buffer.clone()
    }

    /// Slot to displace when the ring is full: a free (too small) buffer
    /// first, else the least recently handed out.
    fn victim(&self) -> usize {
        self.slots
            .iter()
            .position(|slot| !slot.buffer.is_in_use())
            .or_else(|| {
                self.slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.last_handout)
                    .map(|(index, _)| index)
            })
            .unwrap_or(0)
    }

    /// Most recently handed out buffer
    pub fn current(&self) -> Option<&Arc<PixelBuffer>> {
        self.slots
            .iter()
            .max_by_key(|slot| slot.last_handout)
            .map(|slot| &slot.buffer)
    }

    /// Number of pooled buffers currently in use
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.buffer.is_in_use()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ring_depth(&self) -> usize {
        self.ring_depth
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Drops the pool's references; posted buffers live until released
    pub fn clear(&mut self) {
        let count = self.slots.len();
        self.slots.clear();
        debug!("Cleared buffer pool ({} buffers dropped)", count);
    }
}
