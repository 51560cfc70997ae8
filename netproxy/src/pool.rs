//! The shared staging pool.
//!
//! Peer-to-peer connections of every channel stage through one buffer per
//! (local peer, direction) instead of dedicated per-channel rings. Entries
//! are allocated lazily on first connect, refcounted across connections,
//! and torn down when the last user leaves. Slot placement is static:
//! different (channel, slot) pairs never overlap, and the send state
//! machine's depth gate guarantees a single producer per slot.

use log::warn;

use crate::dev::{DevMem, IpcHandle};
use crate::error::{Error, Result};
use crate::state::Comm;
use crate::{Dir, SHARED_STEPS};

/// Per-(local peer, direction) staging buffer.
pub struct SharedP2p {
    pub size: usize,
    pub dev_buff: *mut u8,
    pub host_buff: *mut u8,
    pub ipc: IpcHandle,
    pub refcount: u32,
    /// Ops appended per channel, advanced by the op queue.
    pub proxy_append: Vec<u64>,
}

impl SharedP2p {
    fn new(n_channels: i32) -> Self {
        SharedP2p {
            size: 0,
            dev_buff: std::ptr::null_mut(),
            host_buff: std::ptr::null_mut(),
            ipc: IpcHandle::zeroed(),
            refcount: 0,
            proxy_append: vec![0; n_channels as usize],
        }
    }
}

/// Pool record for one local peer: one entry per direction.
pub struct ProxyPeer {
    pub send: SharedP2p,
    pub recv: SharedP2p,
}

impl ProxyPeer {
    fn new(n_channels: i32) -> Self {
        ProxyPeer {
            send: SharedP2p::new(n_channels),
            recv: SharedP2p::new(n_channels),
        }
    }

    pub fn entry_mut(&mut self, dir: Dir) -> &mut SharedP2p {
        match dir {
            Dir::Send => &mut self.send,
            Dir::Recv => &mut self.recv,
        }
    }
}

/// Lazily allocated pool map, one slot per local rank.
pub type LocalPeers = Option<Vec<Option<Box<ProxyPeer>>>>;

/// Buffer view returned by [`shared_buffers_init`]. In cross-process mode
/// only the IPC handle is meaningful on the caller side.
pub struct SharedBuffers {
    pub dev_ptr: *mut u8,
    pub cpu_ptr: *mut u8,
    pub size: usize,
    pub ipc: Option<IpcHandle>,
}

/// Locate (or create) the pool entry for `(local_rank, dir)`, take a
/// reference on it, and lazily allocate its backing buffer.
pub fn shared_buffers_init(
    dev: &dyn DevMem,
    comm: &Comm,
    local_peers: &mut LocalPeers,
    cuda: bool,
    local_rank: i32,
    dir: Dir,
    same_process: bool,
    n_channels: i32,
) -> Result<SharedBuffers> {
    if !cuda && !same_process {
        warn!("cross-process proxy must not stage through host buffers");
        return Err(Error::Internal(
            "cross-process host staging is not supported",
        ));
    }

    let peers = local_peers
        .get_or_insert_with(|| (0..comm.local_ranks).map(|_| None).collect());
    let peer = peers
        .get_mut(local_rank as usize)
        .ok_or(Error::Internal("local rank outside the peer table"))?
        .get_or_insert_with(|| Box::new(ProxyPeer::new(comm.p2p_n_channels)));

    let state = peer.entry_mut(dir);
    state.refcount += 1;
    if state.size == 0 {
        state.size = n_channels as usize * SHARED_STEPS as usize * comm.p2p_chunk_size;
    }

    if cuda && state.dev_buff.is_null() {
        state.dev_buff = dev.alloc_zeroed(state.size)?;
        if !same_process {
            state.ipc = dev.ipc_export(state.dev_buff)?;
        }
    }
    if !cuda && state.host_buff.is_null() {
        state.host_buff = dev.host_alloc_zeroed(state.size)?;
    }

    let cpu_ptr = if cuda { state.dev_buff } else { state.host_buff };
    Ok(SharedBuffers {
        cpu_ptr,
        dev_ptr: if same_process {
            cpu_ptr
        } else {
            std::ptr::null_mut()
        },
        size: state.size,
        ipc: (!same_process).then_some(state.ipc),
    })
}

/// Byte offset of `(channel, slot)` within the pool buffer. Channels and
/// slots are statically non-overlapping.
#[inline]
pub fn shared_buffers_get(comm: &Comm, channel: i32, slot: usize) -> usize {
    let global_slot = channel as usize * SHARED_STEPS as usize + slot;
    comm.p2p_chunk_size * global_slot
}

/// Drop one reference on `(local_rank, dir)`, freeing the buffer on the
/// last one; collapse the peer record and then the whole pool map once
/// nothing references them.
pub fn shared_buffers_destroy(
    dev: &dyn DevMem,
    local_peers: &mut LocalPeers,
    local_rank: i32,
    dir: Dir,
) -> Result<()> {
    let Some(peers) = local_peers.as_mut() else {
        return Err(Error::Internal("shared pool was never initialized"));
    };
    let Some(peer) = peers
        .get_mut(local_rank as usize)
        .and_then(|p| p.as_mut())
    else {
        return Err(Error::Internal("no pool entry for this local peer"));
    };

    let state = peer.entry_mut(dir);
    if state.size == 0 {
        return Err(Error::Internal("destroy of an unallocated pool entry"));
    }
    state.refcount -= 1;
    if state.refcount == 0 {
        if !state.dev_buff.is_null() {
            dev.free(state.dev_buff)?;
            state.dev_buff = std::ptr::null_mut();
        }
        if !state.host_buff.is_null() {
            dev.host_free(state.host_buff)?;
            state.host_buff = std::ptr::null_mut();
        }
    }

    if peer.send.refcount > 0 || peer.recv.refcount > 0 {
        return Ok(());
    }
    peers[local_rank as usize] = None;
    if peers.iter().any(|p| p.is_some()) {
        return Ok(());
    }
    // All peers are gone; free the map itself.
    *local_peers = None;
    Ok(())
}
