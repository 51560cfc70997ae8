//! Process-wide proxy state and the proxy channel.
//!
//! The proxy thread is the single owner of the fabric provider, the device
//! library, the shared staging pool and the shared-communicator tables.
//! Compute-side code reaches it only through [`ProxyConn::call`], a
//! request/response channel with fixed payload sizes per message kind.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use slab::Slab;

use fabric::Net;

use crate::dev::DevMem;
use crate::error::{Error, Result};
use crate::op::ProxyOp;
use crate::pool::LocalPeers;
use crate::proto::NUM_PROTOCOLS;
use crate::recv::RecvResources;
use crate::rpc::{self, Handshake, MsgKind, SharedInitReq};
use crate::send::SendResources;
use crate::topo::Topology;
use crate::{pool, recv, send, Dir};

/// Identity of one rank as seen by its peers.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub rank: i32,
    pub host_hash: u64,
    pub pid_hash: u64,
    pub bus_id: i64,
}

/// Communicator-wide configuration shared by the compute and proxy sides.
pub struct Comm {
    pub rank: i32,
    pub n_ranks: i32,
    pub local_ranks: i32,
    pub peers: Vec<PeerInfo>,
    /// Rank of each local rank on this node.
    pub local_rank_to_rank: Vec<i32>,
    pub topo: Rc<dyn Topology>,
    /// Per-protocol staging ring sizes.
    pub buff_sizes: [usize; NUM_PROTOCOLS],
    /// Slot granularity of the shared pool.
    pub p2p_chunk_size: usize,
    pub p2p_n_channels: i32,
    /// Keep LL staging in dedicated host buffers even for pooled
    /// connections.
    pub alloc_p2p_net_ll_buffers: bool,
    pub dma_buf_support: bool,
}

impl Comm {
    /// Single-node communicator: every rank in this process, local rank ==
    /// rank. Tests and bring-up override the fields they care about.
    pub fn new(rank: i32, n_ranks: i32, topo: Rc<dyn Topology>) -> Self {
        Comm {
            rank,
            n_ranks,
            local_ranks: n_ranks,
            peers: (0..n_ranks)
                .map(|r| PeerInfo {
                    rank: r,
                    host_hash: 0x1,
                    pid_hash: 0x1,
                    bus_id: r as i64,
                })
                .collect(),
            local_rank_to_rank: (0..n_ranks).collect(),
            topo,
            buff_sizes: [1 << 19, 1 << 20, 1 << 22],
            p2p_chunk_size: 1 << 17,
            p2p_n_channels: 2,
            alloc_p2p_net_ll_buffers: false,
            dma_buf_support: false,
        }
    }

    pub fn my_info(&self) -> &PeerInfo {
        &self.peers[self.rank as usize]
    }

    pub fn peer(&self, rank: i32) -> &PeerInfo {
        &self.peers[rank as usize]
    }

    /// Whether `rank` shares this process's address space.
    pub fn same_process(&self, rank: i32) -> bool {
        self.peers[rank as usize].pid_hash == self.peers[self.rank as usize].pid_hash
    }
}

/// Whether two peers can communicate over the NET transport. Same-host
/// pairs additionally consult the topology, which may veto intra-node NET.
pub fn can_connect(comm: &Comm, info1: &PeerInfo, info2: &PeerInfo) -> Result<bool> {
    if info1.host_hash == info2.host_hash {
        return comm.topo.check_net(info1.bus_id, info2.bus_id);
    }
    Ok(true)
}

/// Handshake state of one proxy connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Initialized,
    /// Pool entry taken, no fabric connection yet (pre-connect).
    SharedInitialized,
    Connected,
}

pub(crate) enum ConnResources {
    None,
    Send(Box<SendResources>),
    Recv(Box<RecvResources>),
}

pub(crate) struct Connection {
    pub send: bool,
    pub state: ConnState,
    pub local_rank: i32,
    pub shared: bool,
    /// Ops appended on a dedicated (non-pooled) connection.
    pub proxy_append: u64,
    pub res: ConnResources,
}

/// Refcounted fabric communicator shared across connections of one
/// (net device, rank, channel) triple.
pub(crate) struct SharedComm {
    pub comm: usize,
    pub refcount: u32,
}

/// Compute-side pointers into the staging region, produced by `connect`.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub head: *mut u64,
    pub tail: *mut u64,
    pub sizes_fifo: *mut i32,
    pub offs_fifo: *mut i32,
    pub buffs: [*mut u8; NUM_PROTOCOLS],
    pub shared: bool,
    /// The NIC DMAs device memory directly.
    pub direct_nic: bool,
}

/// The per-rank proxy agent.
pub struct ProxyState {
    pub(crate) comm: Rc<Comm>,
    pub(crate) net: Box<dyn Net>,
    pub(crate) dev: Rc<dyn DevMem>,
    pub(crate) conns: Slab<Connection>,
    pub(crate) local_peers: LocalPeers,
    /// (net device, remote rank, channel) -> shared send communicator.
    pub(crate) send_comms: HashMap<(usize, i32, i32), SharedComm>,
    /// (net device, proxy rank, channel) -> shared recv communicator.
    pub(crate) recv_comms: HashMap<(usize, i32, i32), SharedComm>,
}

impl ProxyState {
    pub fn new(comm: Rc<Comm>, net: Box<dyn Net>, dev: Rc<dyn DevMem>) -> Self {
        ProxyState {
            comm,
            net,
            dev,
            conns: Slab::new(),
            local_peers: None,
            send_comms: HashMap::new(),
            recv_comms: HashMap::new(),
        }
    }

    pub fn comm(&self) -> &Rc<Comm> {
        &self.comm
    }

    pub(crate) fn register_conn(&mut self, send: bool, local_rank: i32) -> usize {
        self.conns.insert(Connection {
            send,
            state: ConnState::Initialized,
            local_rank,
            shared: false,
            proxy_append: 0,
            res: ConnResources::None,
        })
    }

    /// Serve one proxy channel message. `Retry` asks the caller to
    /// re-drive the same call.
    pub fn handle(
        &mut self,
        conn: usize,
        kind: MsgKind,
        req: &[u8],
        resp: &mut [u8],
    ) -> Result<Handshake> {
        if !self.conns.contains(conn) {
            return Err(Error::Internal("message for an unknown connection"));
        }
        match kind {
            MsgKind::SharedInit => self.shared_init(conn, req, resp),
            MsgKind::Setup => {
                if self.conns[conn].send {
                    send::proxy_setup(self, conn, req, resp)
                } else {
                    recv::proxy_setup(self, conn, req, resp)
                }
            }
            MsgKind::Connect => {
                if self.conns[conn].send {
                    send::proxy_connect(self, conn, req, resp)
                } else {
                    recv::proxy_connect(self, conn, req, resp)
                }
            }
        }
    }

    /// Tear down one connection, releasing staging, registrations and
    /// fabric communicators.
    pub fn close_conn(&mut self, conn: usize) -> Result<()> {
        if !self.conns.contains(conn) {
            return Err(Error::Internal("close of an unknown connection"));
        }
        if self.conns[conn].send {
            send::proxy_free(self, conn)
        } else {
            recv::proxy_free(self, conn)
        }
    }

    /// Drive one op one cooperative step.
    pub fn progress(&mut self, op: &mut ProxyOp) -> Result<()> {
        match op.dir {
            Dir::Send => send::proxy_progress(self, op),
            Dir::Recv => recv::proxy_progress(self, op),
        }
    }

    /// Pre-connect pool initialization for a local peer.
    fn shared_init(&mut self, conn: usize, req: &[u8], resp: &mut [u8]) -> Result<Handshake> {
        let init: SharedInitReq = rpc::decode(req)?;
        if !resp.is_empty() {
            return Err(Error::Internal("shared init carries no response"));
        }
        let local_rank = self.conns[conn].local_rank;
        let rank = *self
            .comm
            .local_rank_to_rank
            .get(local_rank as usize)
            .ok_or(Error::Internal("local rank outside the node table"))?;
        let same_process = self.comm.same_process(rank);
        pool::shared_buffers_init(
            self.dev.as_ref(),
            &self.comm,
            &mut self.local_peers,
            true,
            local_rank,
            Dir::Send,
            same_process,
            init.n_channels,
        )?;
        let c = &mut self.conns[conn];
        c.state = ConnState::SharedInitialized;
        c.shared = true;
        Ok(Handshake::Done)
    }

    /// Record an op append on `conn`'s channel slot.
    pub(crate) fn note_append(&mut self, conn: usize, channel: i32) -> Result<()> {
        let c = self
            .conns
            .get_mut(conn)
            .ok_or(Error::Internal("op references an unknown connection"))?;
        if c.state != ConnState::Connected {
            return Err(Error::Internal("op posted before connect resolved"));
        }
        if !c.shared {
            c.proxy_append += 1;
            return Ok(());
        }
        let dir = if c.send { Dir::Send } else { Dir::Recv };
        let local_rank = c.local_rank;
        let peer = self
            .local_peers
            .as_mut()
            .and_then(|peers| peers.get_mut(local_rank as usize))
            .and_then(|p| p.as_mut())
            .ok_or(Error::Internal("pooled connection without a pool entry"))?;
        let slot = peer
            .entry_mut(dir)
            .proxy_append
            .get_mut(channel as usize)
            .ok_or(Error::Internal("channel outside the pool append table"))?;
        *slot += 1;
        Ok(())
    }
}

/// Compute-side handle to one proxy connection.
#[derive(Clone)]
pub struct ProxyConn {
    state: Rc<RefCell<ProxyState>>,
    pub conn: usize,
    pub proxy_rank: i32,
    pub local_rank: i32,
    pub send: bool,
}

impl ProxyConn {
    /// Open a channel to the proxy agent serving `proxy_rank`.
    /// `local_rank` identifies the origin rank on the proxy's node.
    pub fn connect(
        state: &Rc<RefCell<ProxyState>>,
        send: bool,
        proxy_rank: i32,
        local_rank: i32,
    ) -> Self {
        let conn = state.borrow_mut().register_conn(send, local_rank);
        ProxyConn {
            state: state.clone(),
            conn,
            proxy_rank,
            local_rank,
            send,
        }
    }

    /// Issue one message and re-drive until the proxy reports completion.
    pub fn call(&self, kind: MsgKind, req: &[u8], resp: &mut [u8]) -> Result<()> {
        loop {
            if self.state.borrow_mut().handle(self.conn, kind, req, resp)? == Handshake::Done {
                return Ok(());
            }
        }
    }

    /// Issue one message without re-driving; `Retry` surfaces to the
    /// caller.
    pub fn call_once(&self, kind: MsgKind, req: &[u8], resp: &mut [u8]) -> Result<Handshake> {
        self.state.borrow_mut().handle(self.conn, kind, req, resp)
    }

    pub fn close(&self) -> Result<()> {
        self.state.borrow_mut().close_conn(self.conn)
    }
}
