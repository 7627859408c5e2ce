//! Native buffer platforms
//!
//! A platform is the backend that actually produces pixel memory and knows
//! how another process can map it. Two backends share one capability set:
//!
//! - [`shm::ShmPlatform`]: anonymous shared-memory files, CPU-mapped
//! - [`gbm::GbmPlatform`]: buffer objects from the kernel mode-setting driver
//!
//! The backend is chosen once, when the graphics stack is configured, and
//! used through `Arc<dyn NativeBufferPlatform>` from then on.

pub mod card;
pub mod gbm;
pub mod shm;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::OwnedFd;

use crate::buffer::{PixelBuffer, PixelFormat};
use crate::error::{AllocationError, AllocationStep};
use crate::geometry::{Size, Stride};

/// Which backend to allocate buffers from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Anonymous shared memory
    #[default]
    Shm,
    /// Kernel mode-setting buffer manager
    Gbm,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Shm => "shm",
            PlatformKind::Gbm => "gbm",
        }
    }

    /// Tag word leading every platform IPC package
    pub fn ipc_tag(&self) -> i32 {
        match self {
            PlatformKind::Shm => 1,
            PlatformKind::Gbm => 2,
        }
    }
}

impl std::str::FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shm" => Ok(PlatformKind::Shm),
            "gbm" | "kms" => Ok(PlatformKind::Gbm),
            other => Err(format!("unknown buffer platform `{other}`")),
        }
    }
}

/// Everything a remote process needs to map this platform's buffers
#[derive(Debug, Default)]
pub struct PlatformIpcPackage {
    pub ipc_data: Vec<i32>,
    pub ipc_fds: Vec<OwnedFd>,
}

/// Per-buffer transferable description: handle, offset, stride, geometry
#[derive(Debug)]
pub struct BufferIpcDescriptor {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: Stride,
    pub size: Size,
    pub format: PixelFormat,
}

impl BufferIpcDescriptor {
    /// Writes the descriptor in wire order: fd, offset, stride, size, format
    pub fn pack_into(self, packer: &mut dyn BufferIpcPacker) {
        packer.pack_fd(self.fd);
        packer.pack_data(self.offset as i32);
        packer.pack_stride(self.stride);
        packer.pack_size(self.size);
        packer.pack_format(self.format);
    }

    /// Bytes a mapping of this descriptor must cover
    pub fn mapped_len(&self) -> usize {
        self.offset as usize + self.size.height as usize * self.stride.as_usize()
    }
}

/// Sink for buffer descriptors on their way over the wire
pub trait BufferIpcPacker {
    fn pack_fd(&mut self, fd: OwnedFd);
    fn pack_data(&mut self, data: i32);

    fn pack_stride(&mut self, stride: Stride) {
        self.pack_data(stride.as_u32() as i32);
    }

    fn pack_size(&mut self, size: Size) {
        self.pack_data(size.width as i32);
        self.pack_data(size.height as i32);
    }

    fn pack_format(&mut self, format: PixelFormat) {
        self.pack_data(format.fourcc() as i32);
    }
}

/// Data words and fds exactly as they travel in one message
#[derive(Debug, Default)]
pub struct WireMessage {
    pub data: Vec<i32>,
    pub fds: Vec<OwnedFd>,
}

impl BufferIpcPacker for WireMessage {
    fn pack_fd(&mut self, fd: OwnedFd) {
        self.fds.push(fd);
    }

    fn pack_data(&mut self, data: i32) {
        self.data.push(data);
    }
}

impl WireMessage {
    /// Receiving side: rebuilds a descriptor packed by
    /// [`BufferIpcDescriptor::pack_into`]
    pub fn into_descriptor(mut self) -> Option<BufferIpcDescriptor> {
        let [offset, stride, width, height, fourcc] =
            <[i32; 5]>::try_from(self.data.as_slice()).ok()?;
        if self.fds.len() != 1 || offset < 0 || stride <= 0 || width <= 0 || height <= 0 {
            return None;
        }
        Some(BufferIpcDescriptor {
            fd: self.fds.pop()?,
            offset: offset as u32,
            stride: Stride(stride as u32),
            size: Size::new(width as u32, height as u32),
            format: PixelFormat::from_fourcc(fourcc as u32)?,
        })
    }
}

/// Backend allocator for pixel buffers
pub trait NativeBufferPlatform: Send + Sync {
    fn kind(&self) -> PlatformKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn supported_formats(&self) -> &[PixelFormat];

    /// Produces a buffer covering `size.height × stride` bytes. The returned
    /// buffer is free; the pool claims it.
    fn allocate(
        &self,
        size: Size,
        stride: Stride,
        format: PixelFormat,
    ) -> Result<PixelBuffer, AllocationError>;

    /// Handles a remote process needs before it can map any buffer
    fn create_ipc_package(&self) -> Result<PlatformIpcPackage, AllocationError>;

    /// Transferable description of one buffer (never the pixel bytes)
    fn fill_ipc_descriptor(
        &self,
        buffer: &PixelBuffer,
    ) -> Result<BufferIpcDescriptor, AllocationError> {
        let fd = buffer
            .export_fd()
            .map_err(|source| AllocationError::os(AllocationStep::Export, source))?;
        Ok(BufferIpcDescriptor {
            fd,
            offset: buffer.offset(),
            stride: buffer.stride(),
            size: buffer.size(),
            format: buffer.format(),
        })
    }

    fn fill_ipc_package(
        &self,
        packer: &mut dyn BufferIpcPacker,
        buffer: &PixelBuffer,
    ) -> Result<(), AllocationError> {
        self.fill_ipc_descriptor(buffer)?.pack_into(packer);
        Ok(())
    }
}

impl fmt::Debug for dyn NativeBufferPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBufferPlatform")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Rejects geometry no backend can honour
pub(crate) fn check_geometry(
    size: Size,
    stride: Stride,
    format: PixelFormat,
) -> Result<usize, AllocationError> {
    let invalid = || AllocationError::InvalidGeometry { size, stride, format };
    if size.is_empty() {
        return Err(invalid());
    }
    let packed = format.packed_stride(size.width).ok_or_else(invalid)?;
    if stride < packed {
        return Err(invalid());
    }
    (size.height as usize).checked_mul(stride.as_usize()).ok_or_else(invalid)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_rejects_short_stride() {
        let err =
            check_geometry(Size::new(64, 64), Stride(128), PixelFormat::Argb8888).unwrap_err();
        assert!(matches!(err, AllocationError::InvalidGeometry { .. }));
        assert_eq!(
            check_geometry(Size::new(64, 64), Stride(256), PixelFormat::Argb8888).unwrap(),
            64 * 256
        );
        assert_eq!(
            check_geometry(Size::new(60, 2), Stride(256), PixelFormat::Rgb565).unwrap(),
            512
        );
    }

    #[test]
    fn test_geometry_rejects_empty_size() {
        assert!(check_geometry(Size::new(0, 10), Stride(0), PixelFormat::Argb8888).is_err());
    }

    #[test]
    fn test_wire_message_rejects_truncated_data() {
        let message = WireMessage {
            data: vec![0, 256, 64],
            fds: Vec::new(),
        };
        assert!(message.into_descriptor().is_none());
    }

    #[test]
    fn test_platform_kind_parsing() {
        assert_eq!("SHM".parse::<PlatformKind>(), Ok(PlatformKind::Shm));
        assert_eq!("kms".parse::<PlatformKind>(), Ok(PlatformKind::Gbm));
        assert!("vulkan".parse::<PlatformKind>().is_err());
    }
}
