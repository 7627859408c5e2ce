//! Kernel mode-setting buffers via GBM
//!
//! Buffer objects come straight from the display driver's buffer manager.
//! They are usable for rendering and scanout without ever being mapped into
//! this process, so [`PixelBuffer::pixels`] is `None` for them.

use ::gbm::{BufferObject, BufferObjectFlags, Device as GbmDevice, Format as GbmFormat};
use log::{debug, info};
use parking_lot::{MappedMutexGuard, Mutex};
use std::fmt;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use super::card::Card;
use super::{check_geometry, NativeBufferPlatform, PlatformIpcPackage, PlatformKind};
use crate::buffer::{BufferStorage, PixelBuffer, PixelFormat};
use crate::error::{AllocationError, AllocationStep};
use crate::geometry::{Size, Stride};

const SUPPORTED_FORMATS: [PixelFormat; 5] = [
    PixelFormat::Argb8888,
    PixelFormat::Xrgb8888,
    PixelFormat::Abgr8888,
    PixelFormat::Xbgr8888,
    PixelFormat::Rgb565,
];

fn gbm_format(format: PixelFormat) -> GbmFormat {
    match format {
        PixelFormat::Argb8888 => GbmFormat::Argb8888,
        PixelFormat::Xrgb8888 => GbmFormat::Xrgb8888,
        PixelFormat::Abgr8888 => GbmFormat::Abgr8888,
        PixelFormat::Xbgr8888 => GbmFormat::Xbgr8888,
        PixelFormat::Rgb565 => GbmFormat::Rgb565,
    }
}

/// The GBM device went away underneath a live buffer object
fn device_lost(err: impl fmt::Display) -> AllocationError {
    AllocationError::os(
        AllocationStep::DeviceAllocate,
        io::Error::new(io::ErrorKind::NotConnected, err.to_string()),
    )
}

/// Width to request so the driver's row pitch covers the requested stride
fn padded_width(size: Size, stride: Stride, format: PixelFormat) -> u32 {
    let stride_pixels = stride.as_u32().div_ceil(format.bytes_per_pixel());
    size.width.max(stride_pixels)
}

/// Driver-owned buffer object
pub struct GbmStorage {
    bo: Mutex<BufferObject<()>>,
    offset: u32,
}

impl fmt::Debug for GbmStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbmStorage").field("offset", &self.offset).finish_non_exhaustive()
    }
}

impl GbmStorage {
    /// Runs `f` with the underlying buffer object (e.g. to add a KMS
    /// framebuffer for it)
    pub fn with_buffer_object<R>(&self, f: impl FnOnce(&BufferObject<()>) -> R) -> R {
        f(&self.bo.lock())
    }
}

impl BufferStorage for GbmStorage {
    fn pixels(&self) -> Option<MappedMutexGuard<'_, [u8]>> {
        None
    }

    fn export_fd(&self) -> io::Result<OwnedFd> {
        self.bo
            .lock()
            .fd()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
    }

    fn offset(&self) -> u32 {
        self.offset
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// GBM-backed buffer platform
pub struct GbmPlatform {
    card: Card,
    device: Mutex<GbmDevice<Card>>,
}

impl GbmPlatform {
    /// Opens the DRM node at `path` and creates a GBM device on it
    pub fn open(path: &Path) -> Result<Self, AllocationError> {
        let card =
            Card::open(path).map_err(|source| AllocationError::os(AllocationStep::Open, source))?;
        Self::with_card(card)
    }

    pub fn with_card(card: Card) -> Result<Self, AllocationError> {
        let device = GbmDevice::new(card.clone())
            .map_err(|source| AllocationError::os(AllocationStep::DeviceAllocate, source))?;
        info!("🖥️ GBM platform ready ({})", device.backend_name());
        Ok(Self {
            card,
            device: Mutex::new(device),
        })
    }

    pub fn card(&self) -> &Card {
        &self.card
    }
}

impl NativeBufferPlatform for GbmPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Gbm
    }

    fn supported_formats(&self) -> &[PixelFormat] {
        &SUPPORTED_FORMATS
    }

    fn allocate(
        &self,
        size: Size,
        stride: Stride,
        format: PixelFormat,
    ) -> Result<PixelBuffer, AllocationError> {
        check_geometry(size, stride, format)?;

        let width = padded_width(size, stride, format);
        let bo = self
            .device
            .lock()
            .create_buffer_object::<()>(
                width,
                size.height,
                gbm_format(format),
                BufferObjectFlags::RENDERING | BufferObjectFlags::SCANOUT,
            )
            .map_err(|source| AllocationError::os(AllocationStep::DeviceAllocate, source))?;

        let driver_stride = Stride(bo.stride().map_err(device_lost)?);
        if driver_stride < stride {
            return Err(AllocationError::InvalidGeometry { size, stride, format });
        }

        let offset = bo.offset(0).map_err(device_lost)?;
        debug!(
            "GBM buffer object {}x{} {:?}: driver stride {} (requested {})",
            size.width,
            size.height,
            format,
            driver_stride.as_u32(),
            stride.as_u32()
        );
        let storage = GbmStorage {
            bo: Mutex::new(bo),
            offset,
        };
        Ok(PixelBuffer::new(size, driver_stride, format, Box::new(storage)))
    }

    fn create_ipc_package(&self) -> Result<PlatformIpcPackage, AllocationError> {
        let fd = self
            .card
            .as_fd()
            .try_clone_to_owned()
            .map_err(|source| AllocationError::os(AllocationStep::Export, source))?;
        Ok(PlatformIpcPackage {
            ipc_data: vec![PlatformKind::Gbm.ipc_tag()],
            ipc_fds: vec![fd],
        })
    }
}
