//! In-process loopback provider.
//!
//! Echoes bytes between a send and a recv communicator living in the same
//! process, with the same non-blocking surface as a real provider: sends
//! match posted receives by tag, fused receives complete when every buffer
//! has been filled, and `test` retires requests. Deferral knobs simulate
//! "not ready" connects, request-slot exhaustion and slow flushes.
//!
//! Handles are shared through `Rc`, so two engine instances can drive the
//! same fabric from one thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;

use slab::Slab;

use crate::{
    CommId, Error, Handle, ListenCommId, MemType, MrHandle, Net, Properties, PtrSupport,
    RecvCommId, RequestId, Result, SendCommId, MAX_RECV,
};

const HANDLE_MAGIC: u32 = 0x4c4f_4f50; // "LOOP"

/// Behavior knobs, all zero/default for a well-behaved fabric.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Number of network devices to expose.
    pub ndevs: usize,
    /// `max_recvs` reported in device properties.
    pub max_recvs: usize,
    /// Report DMA-BUF registration support.
    pub dmabuf: bool,
    /// `connect` returns `None` this many times before succeeding.
    pub connect_defer: u32,
    /// `accept` returns `None` this many times before succeeding.
    pub accept_defer: u32,
    /// `isend` returns `None` this many times (request-slot exhaustion).
    pub isend_null: u32,
    /// Extra `test` polls before a flush request completes.
    pub flush_polls: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            ndevs: 1,
            max_recvs: MAX_RECV,
            dmabuf: false,
            connect_defer: 0,
            accept_defer: 0,
            isend_null: 0,
            flush_polls: 0,
        }
    }
}

/// Call counters, for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub isend: usize,
    pub irecv: usize,
    pub iflush: usize,
    pub dmabuf_regs: usize,
}

struct PendingSend {
    request: RequestId,
    buf: *const u8,
    size: usize,
    tag: u32,
}

struct RecvEntry {
    buf: *mut u8,
    size: usize,
    tag: u32,
    filled: Option<usize>,
}

/// One matched send/recv communicator pair.
struct Pipe {
    /// Sends posted before a matching receive existed.
    pending_sends: VecDeque<PendingSend>,
    /// Receive requests with at least one unfilled entry, oldest first.
    open_recvs: VecDeque<RequestId>,
    refs: u8,
}

struct Listener {
    dev: usize,
    pending: VecDeque<usize>,
}

enum Request {
    Send { done: bool, size: usize },
    Recv { entries: Vec<RecvEntry>, remaining: usize },
    Flush { polls_left: u32 },
}

struct Inner {
    config: LoopbackConfig,
    listeners: Slab<Listener>,
    pipes: Slab<Pipe>,
    /// SendCommId -> pipe index.
    send_comms: Slab<usize>,
    /// RecvCommId -> pipe index.
    recv_comms: Slab<usize>,
    mrs: Slab<()>,
    requests: Slab<Request>,
    connect_defer: u32,
    accept_defer: u32,
    isend_null: u32,
    counters: Counters,
    fused_counts: Vec<usize>,
}

impl Inner {
    /// Match `send` against the oldest open receive with an unfilled entry
    /// of the same tag. Returns true if the bytes were delivered.
    fn try_match(&mut self, pipe: usize, send: &PendingSend) -> bool {
        let mut matched = None;
        'search: for &req_id in &self.pipes[pipe].open_recvs {
            let Request::Recv { entries, .. } = &self.requests[req_id] else {
                continue;
            };
            for (slot, entry) in entries.iter().enumerate() {
                if entry.filled.is_none() && entry.tag == send.tag {
                    matched = Some((req_id, slot));
                    break 'search;
                }
            }
        }
        let Some((req_id, slot)) = matched else {
            return false;
        };

        if let Request::Recv { entries, remaining } = &mut self.requests[req_id] {
            let entry = &mut entries[slot];
            debug_assert!(send.size <= entry.size, "send overruns posted receive");
            unsafe { std::ptr::copy_nonoverlapping(send.buf, entry.buf, send.size) };
            entry.filled = Some(send.size);
            *remaining -= 1;
            if *remaining == 0 {
                self.pipes[pipe].open_recvs.retain(|&r| r != req_id);
            }
        }
        if let Request::Send { done, .. } = &mut self.requests[send.request] {
            *done = true;
        }
        true
    }

    fn drain_pending(&mut self, pipe: usize) {
        while let Some(send) = self.pipes[pipe].pending_sends.pop_front() {
            if !self.try_match(pipe, &send) {
                self.pipes[pipe].pending_sends.push_front(send);
                break;
            }
        }
    }

    fn release_pipe(&mut self, pipe: usize) {
        let p = &mut self.pipes[pipe];
        p.refs -= 1;
        if p.refs == 0 {
            self.pipes.remove(pipe);
        }
    }
}

/// Shared handle to an in-process fabric.
#[derive(Clone)]
pub struct LoopbackNet {
    inner: Rc<RefCell<Inner>>,
}

impl LoopbackNet {
    pub fn new(config: LoopbackConfig) -> Self {
        let connect_defer = config.connect_defer;
        let accept_defer = config.accept_defer;
        let isend_null = config.isend_null;
        LoopbackNet {
            inner: Rc::new(RefCell::new(Inner {
                config,
                listeners: Slab::new(),
                pipes: Slab::new(),
                send_comms: Slab::new(),
                recv_comms: Slab::new(),
                mrs: Slab::new(),
                requests: Slab::new(),
                connect_defer,
                accept_defer,
                isend_null,
                counters: Counters::default(),
                fused_counts: Vec::new(),
            })),
        }
    }

    pub fn counters(&self) -> Counters {
        self.inner.borrow().counters
    }

    /// Per-`irecv` fused buffer counts, in call order.
    pub fn fused_counts(&self) -> Vec<usize> {
        self.inner.borrow().fused_counts.clone()
    }

    /// Registrations not yet deregistered.
    pub fn outstanding_mrs(&self) -> usize {
        self.inner.borrow().mrs.len()
    }

    /// Requests not yet retired by `test`.
    pub fn outstanding_requests(&self) -> usize {
        self.inner.borrow().requests.len()
    }
}

impl Default for LoopbackNet {
    fn default() -> Self {
        LoopbackNet::new(LoopbackConfig::default())
    }
}

fn encode_handle(listener: usize) -> Handle {
    let mut handle = Handle::zeroed();
    handle.0[0..4].copy_from_slice(&HANDLE_MAGIC.to_le_bytes());
    handle.0[4..12].copy_from_slice(&(listener as u64).to_le_bytes());
    handle
}

fn decode_handle(handle: &Handle) -> Result<usize> {
    let magic = u32::from_le_bytes(handle.0[0..4].try_into().unwrap());
    if magic != HANDLE_MAGIC {
        return Err(Error::InvalidHandle);
    }
    let id = u64::from_le_bytes(handle.0[4..12].try_into().unwrap());
    Ok(id as usize)
}

impl Net for LoopbackNet {
    fn devices(&self) -> Result<usize> {
        Ok(self.inner.borrow().config.ndevs)
    }

    fn get_properties(&self, dev: usize) -> Result<Properties> {
        let inner = self.inner.borrow();
        if dev >= inner.config.ndevs {
            return Err(Error::DeviceNotFound(dev));
        }
        let mut ptr_support = PtrSupport::HOST | PtrSupport::DEVICE;
        if inner.config.dmabuf {
            ptr_support |= PtrSupport::DMABUF;
        }
        Ok(Properties {
            name: format!("loop{}", dev),
            ptr_support,
            speed: 100_000,
            max_recvs: inner.config.max_recvs,
            max_comms: usize::MAX,
        })
    }

    fn listen(&mut self, dev: usize) -> Result<(Handle, ListenCommId)> {
        let mut inner = self.inner.borrow_mut();
        if dev >= inner.config.ndevs {
            return Err(Error::DeviceNotFound(dev));
        }
        let id = inner.listeners.insert(Listener {
            dev,
            pending: VecDeque::new(),
        });
        Ok((encode_handle(id), id))
    }

    fn connect(&mut self, _dev: usize, handle: &Handle) -> Result<Option<SendCommId>> {
        let mut inner = self.inner.borrow_mut();
        if inner.connect_defer > 0 {
            inner.connect_defer -= 1;
            return Ok(None);
        }
        let listener = decode_handle(handle)?;
        if !inner.listeners.contains(listener) {
            return Err(Error::InvalidHandle);
        }
        let pipe = inner.pipes.insert(Pipe {
            pending_sends: VecDeque::new(),
            open_recvs: VecDeque::new(),
            refs: 2,
        });
        inner.listeners[listener].pending.push_back(pipe);
        Ok(Some(inner.send_comms.insert(pipe)))
    }

    fn accept(&mut self, listen_comm: ListenCommId) -> Result<Option<RecvCommId>> {
        let mut inner = self.inner.borrow_mut();
        if !inner.listeners.contains(listen_comm) {
            return Err(Error::CommNotFound(listen_comm));
        }
        if inner.accept_defer > 0 {
            inner.accept_defer -= 1;
            return Ok(None);
        }
        match inner.listeners[listen_comm].pending.pop_front() {
            Some(pipe) => Ok(Some(inner.recv_comms.insert(pipe))),
            None => Ok(None),
        }
    }

    fn reg_mr(
        &mut self,
        comm: CommId,
        _buf: *mut u8,
        _size: usize,
        _mem_type: MemType,
    ) -> Result<MrHandle> {
        let mut inner = self.inner.borrow_mut();
        let live = match comm {
            CommId::Send(id) => inner.send_comms.contains(id),
            CommId::Recv(id) => inner.recv_comms.contains(id),
        };
        if !live {
            return Err(Error::CommNotFound(match comm {
                CommId::Send(id) | CommId::Recv(id) => id,
            }));
        }
        Ok(inner.mrs.insert(()))
    }

    fn reg_mr_dma_buf(
        &mut self,
        comm: CommId,
        buf: *mut u8,
        size: usize,
        mem_type: MemType,
        _offset: u64,
        _fd: RawFd,
    ) -> Result<MrHandle> {
        if !self.inner.borrow().config.dmabuf {
            return Err(Error::Unsupported("dma-buf registration"));
        }
        let mh = self.reg_mr(comm, buf, size, mem_type)?;
        self.inner.borrow_mut().counters.dmabuf_regs += 1;
        Ok(mh)
    }

    fn dereg_mr(&mut self, _comm: CommId, mh: MrHandle) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.mrs.contains(mh) {
            return Err(Error::RequestNotFound(mh));
        }
        inner.mrs.remove(mh);
        Ok(())
    }

    fn isend(
        &mut self,
        comm: SendCommId,
        buf: *const u8,
        size: usize,
        tag: u32,
        _mh: MrHandle,
    ) -> Result<Option<RequestId>> {
        let mut inner = self.inner.borrow_mut();
        let &pipe = inner
            .send_comms
            .get(comm)
            .ok_or(Error::CommNotFound(comm))?;
        if inner.isend_null > 0 {
            inner.isend_null -= 1;
            return Ok(None);
        }
        inner.counters.isend += 1;
        let request = inner.requests.insert(Request::Send { done: false, size });
        let send = PendingSend {
            request,
            buf,
            size,
            tag,
        };
        if !inner.try_match(pipe, &send) {
            inner.pipes[pipe].pending_sends.push_back(send);
        }
        Ok(Some(request))
    }

    fn irecv(
        &mut self,
        comm: RecvCommId,
        bufs: &[*mut u8],
        sizes: &[usize],
        tags: &[u32],
        mhs: &[MrHandle],
    ) -> Result<Option<RequestId>> {
        let n = bufs.len();
        debug_assert!(n > 0 && n <= MAX_RECV);
        debug_assert!(sizes.len() == n && tags.len() == n && mhs.len() == n);
        let mut inner = self.inner.borrow_mut();
        let &pipe = inner
            .recv_comms
            .get(comm)
            .ok_or(Error::CommNotFound(comm))?;
        inner.counters.irecv += 1;
        inner.fused_counts.push(n);
        let entries = (0..n)
            .map(|i| RecvEntry {
                buf: bufs[i],
                size: sizes[i],
                tag: tags[i],
                filled: None,
            })
            .collect();
        let request = inner.requests.insert(Request::Recv {
            entries,
            remaining: n,
        });
        inner.pipes[pipe].open_recvs.push_back(request);
        inner.drain_pending(pipe);
        Ok(Some(request))
    }

    fn iflush(
        &mut self,
        comm: RecvCommId,
        bufs: &[*mut u8],
        sizes: &[usize],
        mhs: &[MrHandle],
    ) -> Result<Option<RequestId>> {
        debug_assert!(bufs.len() == sizes.len() && bufs.len() == mhs.len());
        let mut inner = self.inner.borrow_mut();
        if !inner.recv_comms.contains(comm) {
            return Err(Error::CommNotFound(comm));
        }
        inner.counters.iflush += 1;
        let polls_left = inner.config.flush_polls;
        Ok(Some(inner.requests.insert(Request::Flush { polls_left })))
    }

    fn test(&mut self, request: RequestId, sizes: Option<&mut [i32]>) -> Result<bool> {
        let mut inner = self.inner.borrow_mut();
        if !inner.requests.contains(request) {
            return Err(Error::RequestNotFound(request));
        }
        let done = match &mut inner.requests[request] {
            Request::Send { done, size } => {
                if *done {
                    if let Some(out) = sizes {
                        out[0] = *size as i32;
                    }
                    true
                } else {
                    false
                }
            }
            Request::Recv { entries, remaining } => {
                if *remaining == 0 {
                    if let Some(out) = sizes {
                        for (i, entry) in entries.iter().enumerate() {
                            out[i] = entry.filled.unwrap_or(0) as i32;
                        }
                    }
                    true
                } else {
                    false
                }
            }
            Request::Flush { polls_left } => {
                if *polls_left == 0 {
                    true
                } else {
                    *polls_left -= 1;
                    false
                }
            }
        };
        if done {
            inner.requests.remove(request);
        }
        Ok(done)
    }

    fn close_send(&mut self, comm: SendCommId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.send_comms.contains(comm) {
            return Err(Error::CommNotFound(comm));
        }
        let pipe = inner.send_comms.remove(comm);
        inner.release_pipe(pipe);
        Ok(())
    }

    fn close_recv(&mut self, comm: RecvCommId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.recv_comms.contains(comm) {
            return Err(Error::CommNotFound(comm));
        }
        let pipe = inner.recv_comms.remove(comm);
        inner.release_pipe(pipe);
        Ok(())
    }

    fn close_listen(&mut self, comm: ListenCommId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.listeners.contains(comm) {
            return Err(Error::CommNotFound(comm));
        }
        inner.listeners.remove(comm);
        Ok(())
    }
}
