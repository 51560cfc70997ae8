//! Fabric provider plugin interface.
//!
//! A provider exposes non-blocking point-to-point verbs over one or more
//! network devices: `listen`/`connect`/`accept` for connection setup,
//! `reg_mr` for memory registration, and `isend`/`irecv`/`iflush`/`test`
//! for data movement. The proxy engine drives a provider exclusively from
//! a single thread; nothing here is `Send`.
//!
//! Communicators and requests are opaque integer ids owned by the provider.
//! A `None` return from `connect`/`accept` means "not ready, re-drive";
//! a `None` return from `isend`/`irecv`/`iflush` means "no request slot,
//! retry on a later progress round".

use std::fmt;
use std::io;
use std::os::fd::RawFd;

use bitflags::bitflags;

pub mod loopback;

/// Size of the opaque connect handle exchanged out of band.
pub const NET_HANDLE_BYTES: usize = 128;

/// Maximum number of buffers fused into a single `irecv`/`iflush`.
pub const MAX_RECV: usize = 8;

/// Opaque connect handle produced by `listen` and consumed by `connect`.
///
/// The handle crosses the bootstrap channel as raw bytes; only the
/// provider that produced it can interpret the contents.
#[derive(Clone, Copy)]
pub struct Handle(pub [u8; NET_HANDLE_BYTES]);

impl Handle {
    pub fn zeroed() -> Self {
        Handle([0u8; NET_HANDLE_BYTES])
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Listen communicator id.
pub type ListenCommId = usize;
/// Send communicator id.
pub type SendCommId = usize;
/// Receive communicator id.
pub type RecvCommId = usize;
/// Outstanding request id.
pub type RequestId = usize;
/// Memory registration handle.
pub type MrHandle = usize;

/// Either side of a communicator, for registration calls that accept both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommId {
    Send(SendCommId),
    Recv(RecvCommId),
}

/// Where a registered buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Host,
    Device,
}

bitflags! {
    /// Pointer kinds a device can register and DMA to/from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtrSupport: u32 {
        const HOST = 0x1;
        const DEVICE = 0x2;
        const DMABUF = 0x4;
    }
}

/// Static properties of one network device.
#[derive(Debug, Clone)]
pub struct Properties {
    pub name: String,
    pub ptr_support: PtrSupport,
    /// Port speed in Mbps.
    pub speed: i32,
    /// Number of buffers a single `irecv` can fuse (1 = no fusion).
    pub max_recvs: usize,
    pub max_comms: usize,
}

/// Fabric provider errors.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying device layer.
    Io(io::Error),
    /// Unknown communicator id.
    CommNotFound(usize),
    /// Unknown request id.
    RequestNotFound(RequestId),
    /// Connect handle does not designate a live listener.
    InvalidHandle,
    /// Device index out of range.
    DeviceNotFound(usize),
    /// Operation not supported by this provider.
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::CommNotFound(id) => write!(f, "communicator {} not found", id),
            Error::RequestNotFound(id) => write!(f, "request {} not found", id),
            Error::InvalidHandle => write!(f, "invalid connect handle"),
            Error::DeviceNotFound(dev) => write!(f, "device {} not found", dev),
            Error::Unsupported(what) => write!(f, "unsupported: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The provider plugin.
///
/// All calls are non-blocking. Buffers are raw pointers because they may
/// designate device memory the host cannot dereference.
///
/// # Safety contract
/// Callers of `isend`/`irecv`/`iflush` must keep every passed buffer valid
/// and unaliased until `test` reports the request complete.
pub trait Net {
    /// Number of usable network devices.
    fn devices(&self) -> Result<usize>;

    fn get_properties(&self, dev: usize) -> Result<Properties>;

    /// Create a listener on `dev`; the returned handle is shipped to the
    /// remote side out of band.
    fn listen(&mut self, dev: usize) -> Result<(Handle, ListenCommId)>;

    /// Connect to a remote listener. `None` means the remote side is not
    /// ready yet; the caller re-drives with the same handle.
    fn connect(&mut self, dev: usize, handle: &Handle) -> Result<Option<SendCommId>>;

    /// Accept one pending connection. `None` means no peer has connected
    /// yet; the caller re-drives.
    fn accept(&mut self, listen_comm: ListenCommId) -> Result<Option<RecvCommId>>;

    fn reg_mr(
        &mut self,
        comm: CommId,
        buf: *mut u8,
        size: usize,
        mem_type: MemType,
    ) -> Result<MrHandle>;

    /// DMA-BUF registration path. Providers that do not support it return
    /// `Error::Unsupported` and callers fall back to `reg_mr`.
    fn reg_mr_dma_buf(
        &mut self,
        comm: CommId,
        buf: *mut u8,
        size: usize,
        mem_type: MemType,
        offset: u64,
        fd: RawFd,
    ) -> Result<MrHandle>;

    fn dereg_mr(&mut self, comm: CommId, mh: MrHandle) -> Result<()>;

    /// Post one send. `tag` must match the tag of a receive posted on the
    /// remote side. `None` means no request slot was available.
    fn isend(
        &mut self,
        comm: SendCommId,
        buf: *const u8,
        size: usize,
        tag: u32,
        mh: MrHandle,
    ) -> Result<Option<RequestId>>;

    /// Post up to [`MAX_RECV`] fused receives as a single request. The
    /// request completes when every buffer has been filled.
    fn irecv(
        &mut self,
        comm: RecvCommId,
        bufs: &[*mut u8],
        sizes: &[usize],
        tags: &[u32],
        mhs: &[MrHandle],
    ) -> Result<Option<RequestId>>;

    /// Make previously received data visible to the device (GDR flush).
    fn iflush(
        &mut self,
        comm: RecvCommId,
        bufs: &[*mut u8],
        sizes: &[usize],
        mhs: &[MrHandle],
    ) -> Result<Option<RequestId>>;

    /// Poll one request. On completion the request id is retired and, when
    /// `sizes` is provided, the per-buffer byte counts are written to it.
    fn test(&mut self, request: RequestId, sizes: Option<&mut [i32]>) -> Result<bool>;

    fn close_send(&mut self, comm: SendCommId) -> Result<()>;
    fn close_recv(&mut self, comm: RecvCommId) -> Result<()>;
    fn close_listen(&mut self, comm: ListenCommId) -> Result<()>;
}
