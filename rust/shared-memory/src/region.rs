//! Shared memory region management
//!
//! A region is a fixed-size block of memory visible to every process that
//! opens the same name. Opening is always create-or-open: whichever side
//! starts first creates the object and the other maps the same bytes.
//! Regions are never shrunk, so a peer configured with a smaller capacity
//! still sees a consistent header.

use crate::platform::PlatformUtils;
use crate::{Result, SharedMemoryError};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::PathBuf;
use studio_link_core::Backing;
use tracing::debug;

const MIN_REGION_SIZE: usize = 64;
const MAX_REGION_SIZE: usize = 1024 * 1024 * 1024;

/// Backing actually in use once `Auto` has been resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    SharedMemory,
    File,
}

impl RegionKind {
    /// Pick the concrete backing for this platform
    pub fn resolve(backing: Backing) -> Result<Self> {
        match backing {
            Backing::File => Ok(RegionKind::File),
            Backing::SharedMemory | Backing::Auto => {
                if PlatformUtils::supports_named_regions() {
                    Ok(RegionKind::SharedMemory)
                } else if backing == Backing::Auto {
                    Ok(RegionKind::File)
                } else {
                    Err(SharedMemoryError::Unsupported(
                        "named shared memory is not available on this platform".to_string(),
                    ))
                }
            }
        }
    }
}

/// Shared memory region handle
pub struct SharedMemoryRegion {
    name: String,
    kind: RegionKind,
    mapping: Mapping,
}

enum Mapping {
    Mapped(MmapMut),
    #[cfg(windows)]
    Windows(windows_impl::View),
}

impl SharedMemoryRegion {
    /// Create the named region, or open it if the peer got there first
    pub fn open_or_create(name: impl Into<String>, size: usize, backing: Backing) -> Result<Self> {
        let name = name.into();
        validate_region_name(&name)?;
        validate_region_size(size)?;

        let kind = RegionKind::resolve(backing)?;
        let mapping = match kind {
            RegionKind::File => Mapping::Mapped(map_file(&name, size)?),
            RegionKind::SharedMemory => open_platform_region(&name, size)?,
        };

        debug!("Mapped region {} ({:?}, {} bytes)", name, kind, size);
        Ok(Self { name, kind, mapping })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Mapped size in bytes
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.mapping {
            Mapping::Mapped(map) => map,
            #[cfg(windows)]
            Mapping::Windows(view) => view.as_slice(),
        }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        match &mut self.mapping {
            Mapping::Mapped(map) => map,
            #[cfg(windows)]
            Mapping::Windows(view) => view.as_slice_mut(),
        }
    }

    /// Remove the named object so the next open starts from fresh memory.
    /// Existing mappings in either process stay valid.
    pub fn unlink(name: &str, backing: Backing) -> Result<()> {
        match RegionKind::resolve(backing)? {
            RegionKind::File => match std::fs::remove_file(share_file_path(name)) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            },
            RegionKind::SharedMemory => unlink_platform_region(name),
        }
    }
}

impl std::fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}

/// Path of the file backing a region when named shared memory is not used
pub fn share_file_path(name: &str) -> PathBuf {
    PlatformUtils::temp_path(&format!("{}.share", name))
}

fn map_file(name: &str, size: usize) -> Result<MmapMut> {
    let path = share_file_path(name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)?;

    if (file.metadata()?.len() as usize) < size {
        file.set_len(size as u64)?;
    }

    // SAFETY: the file is shared with exactly one peer and every access
    // happens under the cross-process lock
    unsafe { MmapOptions::new().len(size).map_mut(&file) }
        .map_err(|e| SharedMemoryError::MappingFailed(format!("{}: {}", path.display(), e)))
}

// Platform-specific implementations

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;
    use std::os::unix::io::AsRawFd;

    fn shm_name(name: &str) -> String {
        format!("/{}", name)
    }

    pub fn open_platform_region(name: &str, size: usize) -> Result<Mapping> {
        let fd = nix::sys::mman::shm_open(
            shm_name(name).as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| SharedMemoryError::from_platform_error(e as i32, "shm_open failed"))?;

        let stat = nix::sys::stat::fstat(fd.as_raw_fd())
            .map_err(|e| SharedMemoryError::from_platform_error(e as i32, "fstat failed"))?;

        // Never shrink an object the peer already sized
        if (stat.st_size as usize) < size {
            nix::unistd::ftruncate(&fd, size as i64)
                .map_err(|e| SharedMemoryError::from_platform_error(e as i32, "ftruncate failed"))?;
        }

        let file = std::fs::File::from(fd);
        // SAFETY: shared with exactly one peer, accessed under the cross-process lock
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| SharedMemoryError::MappingFailed(format!("mmap failed: {}", e)))?;
        Ok(Mapping::Mapped(map))
    }

    pub fn unlink_platform_region(name: &str) -> Result<()> {
        match nix::sys::mman::shm_unlink(shm_name(name).as_str()) {
            Ok(()) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(SharedMemoryError::from_platform_error(e as i32, "shm_unlink failed")),
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::ffi::CString;
    use std::ptr::NonNull;
    use winapi::shared::ntdef::HANDLE;
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::memoryapi::{MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS};
    use winapi::um::winbase::CreateFileMappingA;
    use winapi::um::winnt::PAGE_READWRITE;

    /// Mapped view of a named, pagefile-backed section
    pub struct View {
        handle: HANDLE,
        ptr: NonNull<u8>,
        size: usize,
    }

    // SAFETY: the view is plain memory; access is serialized by the owner
    unsafe impl Send for View {}
    unsafe impl Sync for View {}

    impl View {
        pub fn as_slice(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
        }

        pub fn as_slice_mut(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
        }
    }

    impl Drop for View {
        fn drop(&mut self) {
            unsafe {
                UnmapViewOfFile(self.ptr.as_ptr() as *const _);
                CloseHandle(self.handle);
            }
        }
    }

    pub fn open_platform_region(name: &str, size: usize) -> Result<Mapping> {
        let c_name = CString::new(name)
            .map_err(|_| SharedMemoryError::InvalidName(name.to_string()))?;

        // Opens the existing section when the peer created it first
        let handle = unsafe {
            CreateFileMappingA(
                INVALID_HANDLE_VALUE,
                std::ptr::null_mut(),
                PAGE_READWRITE,
                ((size as u64) >> 32) as u32,
                (size as u64 & 0xFFFF_FFFF) as u32,
                c_name.as_ptr(),
            )
        };

        if handle.is_null() {
            return Err(SharedMemoryError::Platform("CreateFileMapping failed".to_string()));
        }

        let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        let ptr = match NonNull::new(ptr as *mut u8) {
            Some(ptr) => ptr,
            None => {
                unsafe { CloseHandle(handle) };
                return Err(SharedMemoryError::MappingFailed("MapViewOfFile failed".to_string()));
            }
        };

        Ok(Mapping::Windows(View { handle, ptr, size }))
    }

    pub fn unlink_platform_region(_name: &str) -> Result<()> {
        // Sections disappear with their last handle
        Ok(())
    }
}

#[cfg(unix)]
use unix_impl::*;
#[cfg(windows)]
use windows_impl::*;

#[cfg(not(any(unix, windows)))]
fn open_platform_region(_name: &str, _size: usize) -> Result<Mapping> {
    Err(SharedMemoryError::Unsupported("named shared memory".to_string()))
}

#[cfg(not(any(unix, windows)))]
fn unlink_platform_region(_name: &str) -> Result<()> {
    Ok(())
}

/// Validate region name
fn validate_region_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(SharedMemoryError::InvalidName(format!(
            "length {} outside 1..=255",
            name.len()
        )));
    }

    if name.contains(['\0', '/', '\\']) {
        return Err(SharedMemoryError::InvalidName(name.to_string()));
    }

    Ok(())
}

/// Validate region size
fn validate_region_size(size: usize) -> Result<()> {
    if !(MIN_REGION_SIZE..=MAX_REGION_SIZE).contains(&size) {
        return Err(SharedMemoryError::InvalidSize {
            size,
            min: MIN_REGION_SIZE,
            max: MAX_REGION_SIZE,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_validation() {
        assert!(SharedMemoryRegion::open_or_create("", 4096, Backing::File).is_err());
        assert!(SharedMemoryRegion::open_or_create("a/b", 4096, Backing::File).is_err());
        assert!(SharedMemoryRegion::open_or_create("test\0name", 4096, Backing::File).is_err());
        assert!(matches!(
            SharedMemoryRegion::open_or_create("tiny", 8, Backing::File),
            Err(SharedMemoryError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_file_backed_regions_share_memory() {
        let name = PlatformUtils::generate_region_name("region");
        let mut first = SharedMemoryRegion::open_or_create(&name, 4096, Backing::File).unwrap();
        let second = SharedMemoryRegion::open_or_create(&name, 4096, Backing::File).unwrap();

        assert_eq!(first.kind(), RegionKind::File);
        assert_eq!(first.len(), 4096);
        first.as_slice_mut()[10] = 0xAB;
        assert_eq!(second.as_slice()[10], 0xAB);

        drop(first);
        drop(second);
        SharedMemoryRegion::unlink(&name, Backing::File).unwrap();
        assert!(!share_file_path(&name).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_shm_regions_share_memory() {
        let name = PlatformUtils::generate_region_name("region");
        let mut first = SharedMemoryRegion::open_or_create(&name, 8192, Backing::Auto).unwrap();
        assert_eq!(first.kind(), RegionKind::SharedMemory);
        first.as_slice_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);

        // A smaller peer maps a prefix of the same object
        let second = SharedMemoryRegion::open_or_create(&name, 4096, Backing::Auto).unwrap();
        assert_eq!(&second.as_slice()[..4], &[1, 2, 3, 4]);

        SharedMemoryRegion::unlink(&name, Backing::Auto).unwrap();
        // Unlinking twice is harmless
        SharedMemoryRegion::unlink(&name, Backing::Auto).unwrap();
    }
}
