//! Shared memory regions backed by `/dev/shm`.
//!
//! The proxy creates the cross-process host staging bank under a random
//! name, ships the name inside the bank map, and unlinks the file at
//! teardown. The compute side attaches read-write without taking
//! ownership.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, IntoRawFd, RawFd};
use std::ptr::NonNull;

/// A mapped shared memory region.
///
/// The owner unlinks the backing file on drop; attachers only unmap.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    fd: RawFd,
    is_owner: bool,
}

unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Create a new region under `name` and become its owner.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let cname = to_cstring(name)?;

        let fd = shm_open(
            cname.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let raw_fd = fd.as_raw_fd();

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = close(raw_fd);
            let _ = shm_unlink(cname.as_c_str());
            return Err(io::Error::from_raw_os_error(e as i32));
        }

        let ptr = match map_fd(&fd, size) {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                let _ = shm_unlink(cname.as_c_str());
                return Err(e);
            }
        };

        Ok(Self {
            ptr,
            size,
            name: cname,
            fd: fd.into_raw_fd(),
            is_owner: true,
        })
    }

    /// Create a region under a freshly generated random name.
    pub fn create_unique(prefix: &str, size: usize) -> io::Result<Self> {
        let name = format!("/{}-{}", prefix, uuid::Uuid::new_v4().simple());
        Self::create(&name, size)
    }

    /// Attach an existing region. The mapping is unmapped on drop but the
    /// file is left for the owner to unlink.
    pub fn open(name: &str, size: usize) -> io::Result<Self> {
        let cname = to_cstring(name)?;

        let fd = shm_open(cname.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let raw_fd = fd.as_raw_fd();

        let ptr = match map_fd(&fd, size) {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                return Err(e);
            }
        };

        Ok(Self {
            ptr,
            size,
            name: cname,
            fd: fd.into_raw_fd(),
            is_owner: false,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The `/`-prefixed shm name this region was created or opened under.
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("")
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

fn map_fd<F: AsFd>(fd: &F, size: usize) -> io::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero"))?;
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            Some(fd),
            0,
        )
    }
    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
}

fn to_cstring(name: &str) -> io::Result<CString> {
    CString::new(name.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shm name contains NUL"))
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.as_ptr() as *mut _, self.size);
            let _ = close(self.fd);
            if self.is_owner {
                let _ = shm_unlink(self.name.as_c_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_attach_and_share_bytes() {
        let owner = SharedMemory::create_unique("netproxy-test", 4096).unwrap();
        let attached = SharedMemory::open(owner.name(), 4096).unwrap();

        unsafe {
            owner.as_ptr().write_volatile(0xAB);
            assert_eq!(attached.as_ptr().read_volatile(), 0xAB);
        }

        let name = owner.name().to_string();
        drop(attached);
        drop(owner);
        // The owner unlinked the file; a re-open must fail.
        assert!(SharedMemory::open(&name, 4096).is_err());
    }

    #[test]
    fn test_region_is_zeroed() {
        let region = SharedMemory::create_unique("netproxy-test", 8192).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
