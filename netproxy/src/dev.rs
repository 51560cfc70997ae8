//! Accelerator memory services consumed by the proxy.
//!
//! The proxy never computes on device memory; it only allocates staging
//! there, exports/opens IPC handles for cross-process banks, and mirrors
//! single words through GDR-copy. `DevMem` is the seam to the real
//! accelerator runtime; `SysDev` is a host-backed implementation whose
//! "device" allocations live in shared memory so IPC export/open works
//! across processes in tests.

use std::alloc::Layout;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::shm::SharedMemory;

/// Size of an opaque device IPC handle.
pub const IPC_HANDLE_BYTES: usize = 64;

/// Minimum granularity of IPC-exportable device allocations.
pub const IPC_MIN: usize = 2 << 20;

/// Opaque handle exporting a device allocation to another process.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IpcHandle(pub [u8; IPC_HANDLE_BYTES]);

impl IpcHandle {
    pub fn zeroed() -> Self {
        IpcHandle([0u8; IPC_HANDLE_BYTES])
    }
}

impl fmt::Debug for IpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IpcHandle({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// A device-resident word pair mapped into host space via GDR-copy.
#[derive(Debug, Clone, Copy)]
pub struct GdrMirror {
    /// Host-visible mapping, read/written by the proxy.
    pub cpu_ptr: *mut u64,
    /// Device-side address the compute engine polls.
    pub dev_ptr: *mut u64,
}

/// Accelerator memory services.
///
/// Raw pointers returned by `alloc_zeroed` may be device addresses the host
/// cannot dereference; only `host_alloc_zeroed` and GDR-copy mappings are
/// host-readable.
pub trait DevMem {
    /// Device index this library operates on.
    fn device(&self) -> i32;

    /// Allocate zeroed device memory.
    fn alloc_zeroed(&self, size: usize) -> Result<*mut u8>;

    fn free(&self, ptr: *mut u8) -> Result<()>;

    /// Allocate zeroed pinned host memory the device can DMA to.
    fn host_alloc_zeroed(&self, size: usize) -> Result<*mut u8>;

    fn host_free(&self, ptr: *mut u8) -> Result<()>;

    /// Export a device allocation for another process.
    fn ipc_export(&self, ptr: *mut u8) -> Result<IpcHandle>;

    /// Open a handle exported by another process.
    fn ipc_open(&self, handle: &IpcHandle) -> Result<*mut u8>;

    fn ipc_close(&self, ptr: *mut u8) -> Result<()>;

    /// Enable access to allocations of a foreign device. Calling for an
    /// already-enabled device succeeds.
    fn enable_peer_access(&self, dev: i32) -> Result<()>;

    /// Whether GDR-copy word mirrors are available.
    fn gdr_supported(&self) -> bool;

    /// Allocate `words` device-resident u64 words mirrored into host space.
    fn gdr_alloc(&self, words: usize) -> Result<GdrMirror>;

    fn gdr_free(&self, mirror: GdrMirror) -> Result<()>;

    /// DMA-BUF file descriptor for a device allocation, when the driver
    /// can produce one. The caller owns (and closes) the returned fd.
    fn dmabuf_fd(&self, ptr: *mut u8, size: usize) -> Result<Option<RawFd>>;
}

enum Allocation {
    /// Device allocation, shm-backed so IPC export works.
    Shm(SharedMemory),
    /// IPC-opened mapping of a foreign allocation.
    Attached(SharedMemory),
    /// Pinned-host allocation.
    Host(Layout),
    /// GDR-copy word mirror.
    Gdr(Layout),
}

/// Host-backed `DevMem` for tests and single-node bring-up.
pub struct SysDev {
    device: i32,
    gdr: bool,
    dmabuf: bool,
    allocations: RefCell<HashMap<usize, Allocation>>,
    peers: RefCell<HashSet<i32>>,
}

impl SysDev {
    pub fn new(device: i32) -> Self {
        SysDev {
            device,
            gdr: false,
            dmabuf: false,
            allocations: RefCell::new(HashMap::new()),
            peers: RefCell::new(HashSet::new()),
        }
    }

    /// Report GDR-copy support, enabling the head/tail mirror paths.
    pub fn with_gdr(mut self) -> Self {
        self.gdr = true;
        self
    }

    /// Hand out DMA-BUF fds for device allocations.
    pub fn with_dmabuf(mut self) -> Self {
        self.dmabuf = true;
        self
    }

    /// Allocations not yet freed, for leak assertions in tests.
    pub fn outstanding(&self) -> usize {
        self.allocations.borrow().len()
    }

    fn take(&self, ptr: *mut u8) -> Result<Allocation> {
        self.allocations
            .borrow_mut()
            .remove(&(ptr as usize))
            .ok_or(Error::Internal("free of unknown device pointer"))
    }
}

fn host_layout(size: usize) -> Result<Layout> {
    Layout::from_size_align(size.max(1), 4096)
        .map_err(|_| Error::Internal("invalid host allocation size"))
}

impl DevMem for SysDev {
    fn device(&self) -> i32 {
        self.device
    }

    fn alloc_zeroed(&self, size: usize) -> Result<*mut u8> {
        let shm = SharedMemory::create_unique("netproxy-dev", size)?;
        let ptr = shm.as_ptr();
        self.allocations
            .borrow_mut()
            .insert(ptr as usize, Allocation::Shm(shm));
        Ok(ptr)
    }

    fn free(&self, ptr: *mut u8) -> Result<()> {
        match self.take(ptr)? {
            Allocation::Shm(_) => Ok(()),
            _ => Err(Error::Internal("pointer is not a device allocation")),
        }
    }

    fn host_alloc_zeroed(&self, size: usize) -> Result<*mut u8> {
        let layout = host_layout(size)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::System(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "host allocation failed",
            )));
        }
        self.allocations
            .borrow_mut()
            .insert(ptr as usize, Allocation::Host(layout));
        Ok(ptr)
    }

    fn host_free(&self, ptr: *mut u8) -> Result<()> {
        match self.take(ptr)? {
            Allocation::Host(layout) => {
                unsafe { std::alloc::dealloc(ptr, layout) };
                Ok(())
            }
            _ => Err(Error::Internal("pointer is not a host allocation")),
        }
    }

    fn ipc_export(&self, ptr: *mut u8) -> Result<IpcHandle> {
        let allocations = self.allocations.borrow();
        let Some(Allocation::Shm(shm)) = allocations.get(&(ptr as usize)) else {
            return Err(Error::Internal("ipc export of unknown device pointer"));
        };
        let name = shm.name().as_bytes();
        if name.len() >= IPC_HANDLE_BYTES - 9 {
            return Err(Error::Internal("ipc name too long"));
        }
        let mut handle = IpcHandle::zeroed();
        handle.0[0] = name.len() as u8;
        handle.0[1..1 + name.len()].copy_from_slice(name);
        handle.0[IPC_HANDLE_BYTES - 8..].copy_from_slice(&(shm.size() as u64).to_le_bytes());
        Ok(handle)
    }

    fn ipc_open(&self, handle: &IpcHandle) -> Result<*mut u8> {
        let len = handle.0[0] as usize;
        if len == 0 || len >= IPC_HANDLE_BYTES - 9 {
            return Err(Error::Internal("malformed ipc handle"));
        }
        let name = std::str::from_utf8(&handle.0[1..1 + len])
            .map_err(|_| Error::Internal("malformed ipc handle"))?;
        let size = u64::from_le_bytes(handle.0[IPC_HANDLE_BYTES - 8..].try_into().unwrap());
        let shm = SharedMemory::open(name, size as usize)?;
        let ptr = shm.as_ptr();
        self.allocations
            .borrow_mut()
            .insert(ptr as usize, Allocation::Attached(shm));
        Ok(ptr)
    }

    fn ipc_close(&self, ptr: *mut u8) -> Result<()> {
        match self.take(ptr)? {
            Allocation::Attached(_) => Ok(()),
            _ => Err(Error::Internal("pointer is not an ipc mapping")),
        }
    }

    fn enable_peer_access(&self, dev: i32) -> Result<()> {
        // Repeated enables succeed, matching the runtime's
        // "already enabled" tolerance.
        self.peers.borrow_mut().insert(dev);
        Ok(())
    }

    fn gdr_supported(&self) -> bool {
        self.gdr
    }

    fn gdr_alloc(&self, words: usize) -> Result<GdrMirror> {
        if !self.gdr {
            return Err(Error::Internal("gdr-copy not supported"));
        }
        let layout = host_layout(words * 8)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::System(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "gdr allocation failed",
            )));
        }
        self.allocations
            .borrow_mut()
            .insert(ptr as usize, Allocation::Gdr(layout));
        Ok(GdrMirror {
            cpu_ptr: ptr as *mut u64,
            dev_ptr: ptr as *mut u64,
        })
    }

    fn gdr_free(&self, mirror: GdrMirror) -> Result<()> {
        let ptr = mirror.cpu_ptr as *mut u8;
        match self.take(ptr)? {
            Allocation::Gdr(layout) => {
                unsafe { std::alloc::dealloc(ptr, layout) };
                Ok(())
            }
            _ => Err(Error::Internal("pointer is not a gdr mirror")),
        }
    }

    fn dmabuf_fd(&self, ptr: *mut u8, _size: usize) -> Result<Option<RawFd>> {
        if !self.dmabuf {
            return Ok(None);
        }
        let allocations = self.allocations.borrow();
        match allocations.get(&(ptr as usize)) {
            Some(Allocation::Shm(shm)) => {
                let fd = unsafe { libc::dup(shm.fd()) };
                if fd < 0 {
                    return Err(Error::System(std::io::Error::last_os_error()));
                }
                Ok(Some(fd))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_export_open_shares_memory() {
        let dev = SysDev::new(0);
        let ptr = dev.alloc_zeroed(IPC_MIN).unwrap();
        let handle = dev.ipc_export(ptr).unwrap();

        let peer = SysDev::new(1);
        let mapped = peer.ipc_open(&handle).unwrap();
        unsafe {
            ptr.write_volatile(0x5A);
            assert_eq!(mapped.read_volatile(), 0x5A);
        }
        peer.ipc_close(mapped).unwrap();
        dev.free(ptr).unwrap();
        assert_eq!(dev.outstanding(), 0);
        assert_eq!(peer.outstanding(), 0);
    }

    #[test]
    fn test_host_alloc_is_zeroed_and_freed() {
        let dev = SysDev::new(0);
        let ptr = dev.host_alloc_zeroed(1 << 16).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 1 << 16) };
        assert!(bytes.iter().all(|&b| b == 0));
        dev.host_free(ptr).unwrap();
        assert!(dev.host_free(ptr).is_err());
    }

    #[test]
    fn test_gdr_mirror_roundtrip() {
        let dev = SysDev::new(0).with_gdr();
        let mirror = dev.gdr_alloc(2).unwrap();
        unsafe {
            mirror.cpu_ptr.write_volatile(7);
            assert_eq!(mirror.dev_ptr.read_volatile(), 7);
        }
        dev.gdr_free(mirror).unwrap();
    }
}
