//! Shared harness for the proxy engine integration tests: two ranks in
//! one process, a loopback fabric, host-backed device memory and a
//! table-driven topology.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use fabric::loopback::{LoopbackConfig, LoopbackNet};
use netproxy::dev::SysDev;
use netproxy::recv::RecvConnector;
use netproxy::send::SendConnector;
use netproxy::state::{Comm, ConnInfo, ProxyConn, ProxyState};
use netproxy::topo::{StaticTopo, TopoGraph};
use netproxy::Protocol;

pub const SENDER: i32 = 0;
pub const RECEIVER: i32 = 1;

#[derive(Clone)]
pub struct HarnessConfig {
    pub loopback: LoopbackConfig,
    pub use_gdr: bool,
    pub need_flush: bool,
    pub gdr_copy: bool,
    pub buff_sizes: [usize; 3],
    pub p2p_chunk_size: usize,
    pub p2p_n_channels: i32,
    /// Pretend the sender's compute rank lives in another process, forcing
    /// the shm + IPC remap path on the send side.
    pub split_process: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            loopback: LoopbackConfig::default(),
            use_gdr: false,
            need_flush: false,
            gdr_copy: false,
            buff_sizes: [1 << 12, 1 << 13, 1 << 14],
            p2p_chunk_size: 1 << 10,
            p2p_n_channels: 8,
            split_process: false,
        }
    }
}

pub struct Harness {
    pub net: LoopbackNet,
    pub dev_send: Rc<SysDev>,
    pub dev_recv: Rc<SysDev>,
    pub comm_send: Rc<Comm>,
    pub comm_recv: Rc<Comm>,
    pub proxy_send: Rc<RefCell<ProxyState>>,
    pub proxy_recv: Rc<RefCell<ProxyState>>,
    pub shared_dev_cache: HashMap<i32, *mut u8>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        let net = LoopbackNet::new(config.loopback.clone());
        let topo = Rc::new(StaticTopo {
            net_dev: 0,
            use_gdr: config.use_gdr,
            need_flush: config.need_flush,
            pxn: config.split_process,
            local_ranks: vec![0, 1],
        });

        let make_comm = |rank: i32| {
            let mut comm = Comm::new(rank, 2, topo.clone());
            comm.buff_sizes = config.buff_sizes;
            comm.p2p_chunk_size = config.p2p_chunk_size;
            comm.p2p_n_channels = config.p2p_n_channels;
            if config.split_process {
                // The sender rank reports a different pid hash, so its
                // proxy treats the compute side as a foreign process.
                comm.peers[SENDER as usize].pid_hash = 0x2;
            }
            Rc::new(comm)
        };
        let comm_send = make_comm(SENDER);
        let comm_recv = make_comm(RECEIVER);

        let make_dev = |device: i32| {
            let mut dev = SysDev::new(device);
            if config.gdr_copy {
                dev = dev.with_gdr();
            }
            Rc::new(dev)
        };
        let dev_send = make_dev(0);
        let dev_recv = make_dev(1);

        let proxy_send = Rc::new(RefCell::new(ProxyState::new(
            comm_send.clone(),
            Box::new(net.clone()),
            dev_send.clone(),
        )));
        let proxy_recv = Rc::new(RefCell::new(ProxyState::new(
            comm_recv.clone(),
            Box::new(net.clone()),
            dev_recv.clone(),
        )));

        Harness {
            net,
            dev_send,
            dev_recv,
            comm_send,
            comm_recv,
            proxy_send,
            proxy_recv,
            shared_dev_cache: HashMap::new(),
        }
    }

    fn proxy_for(&self, rank: i32) -> &Rc<RefCell<ProxyState>> {
        if rank == SENDER {
            &self.proxy_send
        } else {
            &self.proxy_recv
        }
    }

    /// Full three-phase handshake for one channel: both setups, then
    /// send connect (consuming the receiver's listen handle), then recv
    /// connect (consuming the sender's proxy rank).
    pub fn connect_pair(
        &mut self,
        graph: Option<&TopoGraph>,
        channel_id: i32,
        conn_index: i32,
    ) -> (SendConnector, RecvConnector) {
        let proxy_send = self.proxy_send.clone();
        let proxy_recv = self.proxy_recv.clone();
        let mut lookup = move |proxy_rank: i32, send: bool, local_rank: i32| {
            let state = if proxy_rank == SENDER {
                &proxy_send
            } else {
                &proxy_recv
            };
            Ok(ProxyConn::connect(state, send, proxy_rank, local_rank))
        };

        let (mut send_conn, send_info) = SendConnector::setup(
            &self.comm_send,
            graph,
            RECEIVER,
            channel_id,
            conn_index,
            &mut lookup,
        )
        .expect("send setup failed");
        let (mut recv_conn, recv_info) = RecvConnector::setup(
            &self.comm_recv,
            graph,
            SENDER,
            channel_id,
            conn_index,
            &mut lookup,
        )
        .expect("recv setup failed");

        send_conn
            .connect(&recv_info, self.dev_send.as_ref(), &mut self.shared_dev_cache)
            .expect("send connect failed");
        recv_conn.connect(&send_info).expect("recv connect failed");
        (send_conn, recv_conn)
    }
}

/// Compute-engine stand-in driving one side of the staging contract
/// through its `ConnInfo` pointers.
#[derive(Clone, Copy)]
pub struct GpuSide {
    pub info: ConnInfo,
}

impl GpuSide {
    pub fn new(info: ConnInfo) -> Self {
        GpuSide { info }
    }

    pub fn head(&self) -> u64 {
        unsafe { self.info.head.read_volatile() }
    }

    pub fn set_head(&self, head: u64) {
        unsafe { self.info.head.write_volatile(head) }
    }

    pub fn tail(&self) -> u64 {
        unsafe { self.info.tail.read_volatile() }
    }

    pub fn set_tail(&self, tail: u64) {
        unsafe { self.info.tail.write_volatile(tail) }
    }

    pub fn size(&self, slot: usize) -> i32 {
        unsafe { self.info.sizes_fifo.add(slot).read_volatile() }
    }

    pub fn set_size(&self, slot: usize, size: i32) {
        unsafe { self.info.sizes_fifo.add(slot).write_volatile(size) }
    }

    pub fn off(&self, slot: usize) -> i32 {
        unsafe { self.info.offs_fifo.add(slot).read_volatile() }
    }

    pub fn write_buff(&self, protocol: Protocol, offset: usize, bytes: &[u8]) {
        unsafe {
            let dst = self.info.buffs[protocol.index()].add(offset);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    pub fn read_buff(&self, protocol: Protocol, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        unsafe {
            let src = self.info.buffs[protocol.index()].add(offset);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);
        }
        out
    }
}
