//! Anonymous shared-memory buffers
//!
//! Buffers are unnamed files in a shared-memory capable directory, fully
//! preallocated and mapped read/write, shared. Directories are tried in a
//! fixed priority order so confined clients that cannot see every path
//! still find one:
//!
//! 1. `$XDG_RUNTIME_DIR` (what Wayland toolkits use)
//! 2. `/dev/shm`
//! 3. `/tmp`
//!
//! The order is part of the backend's contract. It is resolved once, when the
//! platform is created, and the result is kept on the platform instance.

use log::{debug, info, warn};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use super::{check_geometry, NativeBufferPlatform, PlatformIpcPackage, PlatformKind};
use crate::buffer::{BufferStorage, PixelBuffer, PixelFormat};
use crate::error::{AllocationError, AllocationStep};
use crate::geometry::{Size, Stride};

/// Environment variable naming the per-user runtime directory
pub const RUNTIME_DIR_ENV: &str = "XDG_RUNTIME_DIR";

/// Directories tried after the runtime directory, in order
pub const FALLBACK_DIRECTORIES: [&str; 2] = ["/dev/shm", "/tmp"];

const UNLINKED_TEMPLATE: &str = "axiom-buffer-XXXXXX";

const SUPPORTED_FORMATS: [PixelFormat; 5] = [
    PixelFormat::Argb8888,
    PixelFormat::Xrgb8888,
    PixelFormat::Abgr8888,
    PixelFormat::Xbgr8888,
    PixelFormat::Rgb565,
];

/// Ordered list of directories to try
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmSearchPath {
    candidates: Vec<PathBuf>,
}

impl ShmSearchPath {
    /// Runtime directory from the environment, then the fixed fallbacks
    pub fn from_env() -> Self {
        Self::new(std::env::var_os(RUNTIME_DIR_ENV).map(PathBuf::from))
    }

    pub fn new(runtime_dir: Option<PathBuf>) -> Self {
        let candidates = runtime_dir
            .filter(|dir| !dir.as_os_str().is_empty())
            .into_iter()
            .chain(FALLBACK_DIRECTORIES.iter().map(PathBuf::from))
            .collect();
        Self { candidates }
    }

    /// Explicit list, used verbatim
    pub fn with_candidates(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }
}

/// How this process creates buffer files, decided once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShmStrategy {
    /// `O_TMPFILE` files that never have a name
    Anonymous(PathBuf),
    /// Named files unlinked right after creation, for filesystems without
    /// `O_TMPFILE`
    Unlinked(PathBuf),
}

impl ShmStrategy {
    pub fn directory(&self) -> &Path {
        match self {
            ShmStrategy::Anonymous(dir) | ShmStrategy::Unlinked(dir) => dir,
        }
    }

    fn open(&self) -> io::Result<File> {
        match self {
            ShmStrategy::Anonymous(dir) => open_anonymous(dir),
            ShmStrategy::Unlinked(dir) => open_unlinked(dir),
        }
    }

    fn resolve(search: &ShmSearchPath) -> Result<Self, AllocationError> {
        let mut last_error =
            io::Error::new(io::ErrorKind::NotFound, "no shared-memory directory candidates");

        for dir in search.candidates() {
            match open_anonymous(dir) {
                Ok(_) => return Ok(ShmStrategy::Anonymous(dir.clone())),
                Err(err) => {
                    debug!("Anonymous shm file in {} unavailable: {}", dir.display(), err);
                    last_error = err;
                }
            }
        }

        warn!("No candidate supports anonymous files, falling back to unlinked named files");
        for dir in search.candidates() {
            match open_unlinked(dir) {
                Ok(_) => return Ok(ShmStrategy::Unlinked(dir.clone())),
                Err(err) => {
                    debug!("Named shm file in {} unavailable: {}", dir.display(), err);
                    last_error = err;
                }
            }
        }

        Err(AllocationError::NoUsableDirectory {
            searched: search.candidates().to_vec(),
            source: last_error,
        })
    }
}

fn open_anonymous(dir: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .mode(0o600)
        .custom_flags(libc::O_TMPFILE | libc::O_EXCL)
        .open(dir)
}

fn open_unlinked(dir: &Path) -> io::Result<File> {
    let template = dir.join(UNLINKED_TEMPLATE);
    let template = CString::new(template.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let mut template = template.into_bytes_with_nul();

    let fd = unsafe { libc::mkostemp(template.as_mut_ptr().cast(), libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let file = unsafe { File::from_raw_fd(fd) };

    if unsafe { libc::unlink(template.as_ptr().cast()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

/// Mapped shared-memory file behind a buffer
#[derive(Debug)]
pub struct ShmStorage {
    file: File,
    map: Mutex<MmapMut>,
}

impl BufferStorage for ShmStorage {
    fn pixels(&self) -> Option<MappedMutexGuard<'_, [u8]>> {
        Some(MutexGuard::map(self.map.lock(), |map| &mut map[..]))
    }

    fn export_fd(&self) -> io::Result<OwnedFd> {
        self.file.as_fd().try_clone_to_owned()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Shared-memory buffer platform
#[derive(Debug)]
pub struct ShmPlatform {
    strategy: ShmStrategy,
}

impl ShmPlatform {
    /// Resolves the directory strategy; fails if no candidate is usable
    pub fn new(search: ShmSearchPath) -> Result<Self, AllocationError> {
        let strategy = ShmStrategy::resolve(&search)?;
        info!(
            "📁 Shared-memory buffers in {} ({})",
            strategy.directory().display(),
            match strategy {
                ShmStrategy::Anonymous(_) => "anonymous",
                ShmStrategy::Unlinked(_) => "unlinked",
            }
        );
        Ok(Self { strategy })
    }

    pub fn strategy(&self) -> &ShmStrategy {
        &self.strategy
    }
}

impl NativeBufferPlatform for ShmPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Shm
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
        if !SUPPORTED_FORMATS.contains(&format) {
            return Err(AllocationError::UnsupportedFormat {
                format,
                platform: "shm",
            });
        }
        let extent = check_geometry(size, stride, format)?;

        let file = self
            .strategy
            .open()
            .map_err(|source| AllocationError::os(AllocationStep::Open, source))?;

        // Reserve every page now so running out of space fails here, not on
        // the client's first write.
        let code = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, extent as libc::off_t) };
        if code != 0 {
            return Err(AllocationError::os(
                AllocationStep::Preallocate,
                io::Error::from_raw_os_error(code),
            ));
        }

        let map = unsafe { MmapOptions::new().len(extent).map_mut(&file) }
            .map_err(|source| AllocationError::os(AllocationStep::Map, source))?;

        debug!(
            "Mapped {} byte shm buffer ({}x{}, stride {})",
            extent,
            size.width,
            size.height,
            stride.as_u32()
        );
        let storage = ShmStorage {
            file,
            map: Mutex::new(map),
        };
        Ok(PixelBuffer::new(size, stride, format, Box::new(storage)))
    }

    fn create_ipc_package(&self) -> Result<PlatformIpcPackage, AllocationError> {
        Ok(PlatformIpcPackage {
            ipc_data: vec![PlatformKind::Shm.ipc_tag()],
            ipc_fds: Vec::new(),
        })
    }
}
