//! Shared pixel buffers
//!
//! A [`PixelBuffer`] is one frame's worth of pixel memory with a geometry
//! fixed at creation. It is shared between the client that draws into it,
//! the [`BufferPool`](pool::BufferPool) that recycles it, and the display
//! path that scans it out:
//!
//! ```text
//! ┌──────────────┐ get_buffer ┌──────────────┐   post    ┌──────────────┐
//! │  BufferPool  │───────────►│    Client    │──────────►│ DisplayBuffer│
//! │ (reuse/alloc)│            │ (draw pixels)│           │ (PostedBuffer)│
//! └──────────────┘            └──────────────┘           └──────┬───────┘
//!        ▲                                                      │
//!        └──────────────── release (in-use → free) ─────────────┘
//! ```
//!
//! The in-use flag is the only state both sides touch. It is an atomic so a
//! release arriving on the display thread and a `get_buffer` on the client
//! thread can never both win.

pub mod pool;

use log::{trace, warn};
use parking_lot::{MappedMutexGuard, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::ops::Deref;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::geometry::{Size, Stride};

pub use pool::{BufferPool, PoolStats};

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// Pixel layouts understood by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 32-bit, little-endian B, G, R, A
    #[default]
    Argb8888,
    /// 32-bit, little-endian B, G, R, unused
    Xrgb8888,
    /// 32-bit, little-endian R, G, B, A
    Abgr8888,
    /// 32-bit, little-endian R, G, B, unused
    Xbgr8888,
    /// 16-bit packed 5:6:5
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Rgb565 => 2,
            _ => 4,
        }
    }

    pub fn has_alpha(&self) -> bool {
        matches!(self, PixelFormat::Argb8888 | PixelFormat::Abgr8888)
    }

    /// DRM fourcc code, as carried in IPC descriptors
    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Argb8888 => fourcc(b"AR24"),
            PixelFormat::Xrgb8888 => fourcc(b"XR24"),
            PixelFormat::Abgr8888 => fourcc(b"AB24"),
            PixelFormat::Xbgr8888 => fourcc(b"XB24"),
            PixelFormat::Rgb565 => fourcc(b"RG16"),
        }
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        [
            PixelFormat::Argb8888,
            PixelFormat::Xrgb8888,
            PixelFormat::Abgr8888,
            PixelFormat::Xbgr8888,
            PixelFormat::Rgb565,
        ]
        .into_iter()
        .find(|format| format.fourcc() == code)
    }

    /// Smallest stride that holds one row of `width` pixels
    pub fn packed_stride(&self, width: u32) -> Option<Stride> {
        width.checked_mul(self.bytes_per_pixel()).map(Stride)
    }
}

/// Backend-specific memory behind a [`PixelBuffer`]
///
/// Implementations are provided by the native platforms. Storage is released
/// (unmapped, closed, returned to the driver) when it is dropped, which
/// happens exactly once, when the last reference to the buffer goes away.
pub trait BufferStorage: Send + Sync + fmt::Debug {
    /// Host-visible mapping of the whole extent, if the memory is CPU-mappable
    fn pixels(&self) -> Option<MappedMutexGuard<'_, [u8]>>;

    /// Duplicate a handle another process can map
    fn export_fd(&self) -> io::Result<OwnedFd>;

    /// Byte offset of the first row inside the exported handle
    fn offset(&self) -> u32 {
        0
    }

    /// Platform-specific view used by display paths that scan out natively
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Process-unique buffer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        BufferId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// One frame of pixel memory with immutable geometry
pub struct PixelBuffer {
    id: BufferId,
    size: Size,
    stride: Stride,
    format: PixelFormat,
    in_use: AtomicBool,
    /// The live post of the current handout, if any
    post: Mutex<Weak<Post>>,
    storage: Box<dyn BufferStorage>,
}

impl PixelBuffer {
    /// Wrap platform storage. The buffer starts out free.
    pub fn new(
        size: Size,
        stride: Stride,
        format: PixelFormat,
        storage: Box<dyn BufferStorage>,
    ) -> Self {
        Self {
            id: BufferId::next(),
            size,
            stride,
            format,
            in_use: AtomicBool::new(false),
            post: Mutex::new(Weak::new()),
            storage,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn stride(&self) -> Stride {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes covered by the buffer's rows: `height × stride`
    pub fn extent(&self) -> usize {
        self.size.height as usize * self.stride.as_usize()
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Mapped pixel memory covering exactly [`extent`](Self::extent)
    /// bytes; `None` for device-only buffers and for mappings too short to
    /// hold every row.
    pub fn pixels(&self) -> Option<MappedMutexGuard<'_, [u8]>> {
        let extent = self.extent();
        let pixels = self.storage.pixels()?;
        if pixels.len() < extent {
            warn!(
                "Buffer {:?} maps {} bytes but its rows need {}",
                self.id,
                pixels.len(),
                extent
            );
            return None;
        }
        Some(MappedMutexGuard::map(pixels, |bytes| &mut bytes[..extent]))
    }

    pub fn export_fd(&self) -> io::Result<OwnedFd> {
        self.storage.export_fd()
    }

    pub fn offset(&self) -> u32 {
        self.storage.offset()
    }

    pub fn storage(&self) -> &dyn BufferStorage {
        self.storage.as_ref()
    }

    /// Atomically move free → in-use. Returns false if it was already in use.
    pub(crate) fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Display-path release notification: in-use → free.
    ///
    /// Returns false when the buffer was not in use; a repeated release is a
    /// no-op rather than a second free.
    pub fn signal_release(&self) -> bool {
        let released = self
            .in_use
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if released {
            trace!("Buffer {:?} released", self.id);
        } else {
            warn!("Ignoring release of buffer {:?} that is not in use", self.id);
        }
        released
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("in_use", &self.is_in_use())
            .finish()
    }
}

/// A buffer held by the display path for as long as it is posted
///
/// Holding a `PostedBuffer` keeps the memory alive independently of the
/// pool. One handout has exactly one post: clones share it, and so does a
/// second [`PostedBuffer::new`] for a buffer whose post is still alive. A
/// surface spanning two outputs may therefore post its buffer to each of
/// them. When the last holder goes away the release fires exactly once, the
/// buffer becomes free for reuse, and if the pool has already replaced it
/// the memory is destroyed right there.
#[derive(Clone)]
pub struct PostedBuffer {
    post: Arc<Post>,
}

struct Post {
    buffer: Arc<PixelBuffer>,
}

impl Drop for Post {
    fn drop(&mut self) {
        let slot = self.buffer.post.lock();
        // A post created while this one was going away owns the handout now
        if slot.upgrade().is_none() {
            self.buffer.signal_release();
        }
    }
}

impl PostedBuffer {
    pub fn new(buffer: Arc<PixelBuffer>) -> Self {
        let mut slot = buffer.post.lock();
        if let Some(post) = slot.upgrade() {
            trace!("Buffer {:?} is already posted; sharing its release", buffer.id());
            return Self { post };
        }
        if buffer.try_claim() {
            warn!(
                "Posting buffer {:?} which the pool does not consider in use",
                buffer.id()
            );
        }
        let post = Arc::new(Post {
            buffer: buffer.clone(),
        });
        *slot = Arc::downgrade(&post);
        Self { post }
    }

    pub fn buffer(&self) -> &Arc<PixelBuffer> {
        &self.post.buffer
    }

    /// Drops this holder; the release fires once no holder is left
    pub fn release(self) {}
}

impl Deref for PostedBuffer {
    type Target = PixelBuffer;

    fn deref(&self) -> &PixelBuffer {
        &self.post.buffer
    }
}

impl fmt::Debug for PostedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PostedBuffer").field(&self.post.buffer).finish()
    }
}
