//! Send side of the NET transport.
//!
//! The compute side picks a NIC and a proxy rank, opens a proxy channel
//! and drives the setup/connect handshake; the proxy side builds the bank
//! map, connects the fabric communicator, registers staging and then runs
//! the progress state machine: grant credits, transmit ready slots, reap
//! completions.

use std::collections::HashMap;
use std::mem::size_of;
use std::ptr::write_volatile;
use std::rc::Rc;

use log::{info, trace, warn};

use fabric::{CommId, MemType, Net, SendCommId};

use crate::dev::{DevMem, GdrMirror, IPC_MIN};
use crate::error::{Error, Result};
use crate::map::{Bank, ConnectMap, MemIdentity, ShmName, SlotName, View};
use crate::mem::{full_fence, wc_store_fence, RecvMemPtr, SendMem, SendMemPtr};
use crate::op::{OpState, ProxyOp};
use crate::proto::{ll_flag, ll_ready, ll128_ready, Protocol, NUM_PROTOCOLS};
use crate::rpc::{self, Handshake, MsgKind, SetupReq};
use crate::shm::SharedMemory;
use crate::state::{Comm, ConnInfo, ConnResources, ConnState, Connection, ProxyConn, ProxyState};
use crate::topo::TopoGraph;
use crate::{param, pool, round_up, Dir, SHARED_STEPS, STEPS};

/// Proxy-side record of one send connection.
pub struct SendResources {
    pub(crate) map: ConnectMap,
    pub(crate) send_comm: Option<SendCommId>,
    pub(crate) send_mem: Option<SendMemPtr>,
    pub(crate) recv_mem: Option<RecvMemPtr>,

    pub(crate) rank: i32,
    pub(crate) local_rank: i32,
    pub(crate) remote_rank: i32,
    pub(crate) net_dev: usize,
    pub(crate) use_gdr: bool,
    pub(crate) use_dmabuf: bool,
    pub(crate) max_recvs: usize,
    pub(crate) gdc_sync: Option<GdrMirror>,
    pub(crate) shared: bool,
    pub(crate) channel_id: i32,
    pub(crate) conn_index: i32,
    pub(crate) buffers: [*mut u8; NUM_PROTOCOLS],
    pub(crate) buff_sizes: [usize; NUM_PROTOCOLS],
    pub(crate) mhandles: [Option<fabric::MrHandle>; NUM_PROTOCOLS],
    /// Total slices completed across all ops on this connection.
    pub(crate) step: u64,
    /// Cross-process host staging backing; unlinked on drop.
    pub(crate) host_shm: Option<SharedMemory>,
}

impl SendResources {
    fn new(req: &SetupReq) -> Self {
        SendResources {
            map: ConnectMap::new(true, false, 0),
            send_comm: None,
            send_mem: None,
            recv_mem: None,
            rank: req.rank,
            local_rank: req.local_rank,
            remote_rank: req.remote_rank,
            net_dev: req.net_dev as usize,
            use_gdr: req.use_gdr != 0,
            use_dmabuf: false,
            max_recvs: 1,
            gdc_sync: None,
            shared: req.shared != 0,
            channel_id: req.channel_id,
            conn_index: req.conn_index,
            buffers: [std::ptr::null_mut(); NUM_PROTOCOLS],
            buff_sizes: [0; NUM_PROTOCOLS],
            mhandles: [None; NUM_PROTOCOLS],
            step: 0,
            host_shm: None,
        }
    }
}

fn send_res<'a>(
    conns: &'a mut slab::Slab<Connection>,
    conn: usize,
) -> Result<&'a mut SendResources> {
    match conns.get_mut(conn) {
        Some(Connection {
            res: ConnResources::Send(r),
            ..
        }) => Ok(r),
        _ => Err(Error::Internal("sub does not reference a send connection")),
    }
}

// =============================================================================
// Compute side
// =============================================================================

/// Compute-side endpoint of one send connection.
pub struct SendConnector {
    pub proxy: ProxyConn,
    shared: bool,
    use_gdr: bool,
    map: Option<ConnectMap>,
    attached_host: Option<SharedMemory>,
    opened_dev: Option<*mut u8>,
    pub conn_info: Option<ConnInfo>,
}

impl SendConnector {
    /// Choose NIC and proxy rank, run the setup phase, and return the
    /// connect info (the proxy rank) to publish to the peer.
    ///
    /// `connect_proxy(proxy_rank, send, local_rank)` opens the proxy
    /// channel; the registry of proxy agents is owned by the caller.
    pub fn setup(
        comm: &Rc<Comm>,
        graph: Option<&TopoGraph>,
        peer_rank: i32,
        channel_id: i32,
        conn_index: i32,
        connect_proxy: &mut dyn FnMut(i32, bool, i32) -> Result<ProxyConn>,
    ) -> Result<(SendConnector, fabric::Handle)> {
        let shared = if graph.is_some() {
            false
        } else {
            match param::net_shared_buffers() {
                -2 => true,
                v => v != 0,
            }
        };
        let (net_dev, proxy_rank) =
            comm.topo
                .get_net_dev(comm.rank, graph, channel_id, peer_rank)?;
        let use_gdr = comm.topo.check_gdr(comm.my_info().bus_id, net_dev, true)?;
        let local_rank = comm.topo.get_local_rank(comm.rank)?;

        let proxy = connect_proxy(proxy_rank, true, local_rank)?;
        let req = SetupReq {
            rank: comm.rank,
            local_rank,
            remote_rank: peer_rank,
            shared: shared as i32,
            net_dev: net_dev as i32,
            use_gdr: use_gdr as i32,
            need_flush: 0,
            channel_id,
            conn_index,
        };
        let mut req_buf = [0u8; size_of::<SetupReq>()];
        rpc::encode(&req, &mut req_buf)?;
        proxy.call(MsgKind::Setup, &req_buf, &mut [])?;

        info!(
            "channel {:02}/{} : {} -> {} [send] via NET/{}{}{}",
            channel_id,
            conn_index,
            comm.rank,
            peer_rank,
            net_dev,
            if use_gdr { "/GDRDMA" } else { "" },
            if shared { "/Shared" } else { "" },
        );

        let mut connect_info = fabric::Handle::zeroed();
        connect_info.0[..4].copy_from_slice(&proxy_rank.to_le_bytes());

        Ok((
            SendConnector {
                proxy,
                shared,
                use_gdr,
                map: None,
                attached_host: None,
                opened_dev: None,
                conn_info: None,
            },
            connect_info,
        ))
    }

    /// Forward the peer's fabric handle, receive the populated bank map,
    /// remap cross-process banks and resolve the staging pointers.
    ///
    /// `shared_dev_cache` holds the per-local-peer shared device mapping,
    /// opened once and reused across channels.
    pub fn connect(
        &mut self,
        peer_info: &fabric::Handle,
        dev: &dyn DevMem,
        shared_dev_cache: &mut HashMap<i32, *mut u8>,
    ) -> Result<ConnInfo> {
        let mut resp = [0u8; size_of::<ConnectMap>()];
        self.proxy.call(MsgKind::Connect, &peer_info.0, &mut resp)?;
        let mut map: ConnectMap = rpc::decode(&resp)?;

        if map.same_process {
            if map.dev_id != dev.device() {
                dev.enable_peer_access(map.dev_id)?;
            }
        } else {
            let host = map.mem(Bank::Host);
            let MemIdentity::Shm(name) = host.identity else {
                return Err(Error::Internal("cross-process host bank without a path"));
            };
            let shm = SharedMemory::open(name.as_str(), host.size as usize)?;
            let ptr = shm.as_ptr() as usize;
            map.mem_mut(Bank::Host).cpu_ptr = ptr;
            map.mem_mut(Bank::Host).dev_ptr = ptr;
            self.attached_host = Some(shm);

            if map.mem(Bank::Dev).size > 0 {
                let MemIdentity::Ipc(handle) = map.mem(Bank::Dev).identity else {
                    return Err(Error::Internal("cross-process device bank without a handle"));
                };
                let ptr = dev.ipc_open(&handle)?;
                map.mem_mut(Bank::Dev).dev_ptr = ptr as usize;
                map.mem_mut(Bank::Dev).cpu_ptr = 0;
                self.opened_dev = Some(ptr);
            }
            if map.mem(Bank::SharedDev).size > 0 {
                // One mapping per local peer, cached across channels.
                let key = self.proxy.local_rank;
                let ptr = match shared_dev_cache.get(&key) {
                    Some(&p) => p,
                    None => {
                        let MemIdentity::Ipc(handle) = map.mem(Bank::SharedDev).identity else {
                            return Err(Error::Internal(
                                "shared device bank without a handle",
                            ));
                        };
                        let p = dev.ipc_open(&handle)?;
                        shared_dev_cache.insert(key, p);
                        p
                    }
                };
                map.mem_mut(Bank::SharedDev).dev_ptr = ptr as usize;
                map.mem_mut(Bank::SharedDev).cpu_ptr = 0;
            }
        }

        let send_mem = map.send_mem_ptr(View::Dev);
        let recv_mem = map.recv_mem_ptr(View::Dev);
        let gdc = map.mem(Bank::Gdc).dev();
        let info = unsafe {
            ConnInfo {
                head: if gdc.is_null() {
                    std::ptr::addr_of_mut!((*send_mem).head)
                } else {
                    gdc as *mut u64
                },
                tail: std::ptr::addr_of_mut!((*recv_mem).tail),
                sizes_fifo: std::ptr::addr_of_mut!((*recv_mem).sizes_fifo) as *mut i32,
                // Only pooled connections carry staging offsets.
                offs_fifo: if map.shared {
                    std::ptr::addr_of_mut!((*recv_mem).offs_fifo) as *mut i32
                } else {
                    std::ptr::null_mut()
                },
                buffs: [
                    map.pointer(View::Dev, SlotName::Buff(Protocol::Ll)),
                    map.pointer(View::Dev, SlotName::Buff(Protocol::Ll128)),
                    map.pointer(View::Dev, SlotName::Buff(Protocol::Simple)),
                ],
                shared: map.shared,
                direct_nic: self.use_gdr,
            }
        };
        self.map = Some(map);
        self.conn_info = Some(info);
        Ok(info)
    }

    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Release compute-side mappings. The proxy-side teardown runs
    /// separately through the proxy channel.
    pub fn free(mut self, dev: &dyn DevMem) -> Result<()> {
        if let Some(map) = self.map.take() {
            if !map.same_process {
                self.attached_host.take();
                if let Some(ptr) = self.opened_dev.take() {
                    dev.ipc_close(ptr)?;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Proxy side: handshake
// =============================================================================

pub(crate) fn proxy_setup(
    state: &mut ProxyState,
    conn: usize,
    req: &[u8],
    resp: &mut [u8],
) -> Result<Handshake> {
    let req: SetupReq = rpc::decode(req)?;
    // Setup returns no data.
    if !resp.is_empty() {
        return Err(Error::Internal("send setup carries no response"));
    }

    let mut resources = SendResources::new(&req);
    let props = state.net.get_properties(resources.net_dev)?;
    resources.use_dmabuf = resources.use_gdr
        && state.comm.dma_buf_support
        && props.ptr_support.contains(fabric::PtrSupport::DMABUF);
    resources.max_recvs = props.max_recvs;

    let connection = &mut state.conns[conn];
    connection.shared = resources.shared;
    connection.local_rank = resources.local_rank;
    connection.res = ConnResources::Send(Box::new(resources));
    Ok(Handshake::Done)
}

pub(crate) fn proxy_connect(
    state: &mut ProxyState,
    conn: usize,
    req: &[u8],
    resp: &mut [u8],
) -> Result<Handshake> {
    let handle: fabric::Handle = rpc::decode(req)?;
    let comm = state.comm.clone();
    let ProxyState {
        net,
        dev,
        conns,
        local_peers,
        send_comms,
        ..
    } = state;
    let connection = conns
        .get_mut(conn)
        .ok_or(Error::Internal("connect for an unknown connection"))?;
    let res = match &mut connection.res {
        ConnResources::Send(r) => r.as_mut(),
        _ => return Err(Error::Internal("connect before send setup")),
    };

    if res.send_comm.is_none() {
        if res.shared && res.max_recvs > 1 && param::net_shared_comms() {
            // Connect or reuse the communicator for this
            // (netdev, remote rank, channel) triple.
            let key = (res.net_dev, res.remote_rank, res.channel_id);
            if !send_comms.contains_key(&key) {
                if let Some(comm_id) = net.connect(res.net_dev, &handle)? {
                    send_comms.insert(
                        key,
                        crate::state::SharedComm {
                            comm: comm_id,
                            refcount: 0,
                        },
                    );
                }
            }
            if let Some(shared_comm) = send_comms.get_mut(&key) {
                res.send_comm = Some(shared_comm.comm);
                shared_comm.refcount += 1;
            }
        } else {
            res.send_comm = net.connect(res.net_dev, &handle)?;
        }
    }
    let Some(send_comm) = res.send_comm else {
        return Ok(Handshake::Retry);
    };

    // Build the bank map.
    let same_process = comm.same_process(res.rank);
    let mut map = ConnectMap::new(same_process, res.shared, dev.device());

    if !res.shared {
        // Dedicated per-protocol staging for pinned (graph) connections.
        for p in Protocol::ALL {
            map.add_slot(
                SlotName::Buff(p),
                false,
                p != Protocol::Ll && res.use_gdr,
                comm.buff_sizes[p.index()] as u32,
            );
            res.buff_sizes[p.index()] = comm.buff_sizes[p.index()];
        }
    } else {
        let bank = if res.use_gdr {
            Bank::SharedDev
        } else {
            Bank::SharedHost
        };
        let bufs = pool::shared_buffers_init(
            dev.as_ref(),
            &comm,
            local_peers,
            res.use_gdr,
            res.local_rank,
            Dir::Send,
            same_process,
            comm.p2p_n_channels,
        )?;
        res.buff_sizes[Protocol::Simple.index()] = bufs.size;
        {
            let mem = map.mem_mut(bank);
            mem.cpu_ptr = bufs.cpu_ptr as usize;
            mem.dev_ptr = bufs.dev_ptr as usize;
            mem.size = bufs.size as u32;
            if let Some(ipc) = bufs.ipc {
                mem.identity = MemIdentity::Ipc(ipc);
            }
        }

        if comm.alloc_p2p_net_ll_buffers {
            map.add_slot(
                SlotName::Buff(Protocol::Ll),
                false,
                false,
                comm.buff_sizes[Protocol::Ll.index()] as u32,
            );
            res.buff_sizes[Protocol::Ll.index()] = comm.buff_sizes[Protocol::Ll.index()];
        }

        map.add_slot(
            SlotName::Buff(Protocol::Simple),
            true,
            res.use_gdr,
            bufs.size as u32,
        );
    }

    map.add_slot(SlotName::SendMem, false, false, size_of::<SendMem>() as u32);
    map.add_slot(
        SlotName::RecvMem,
        false,
        false,
        size_of::<crate::mem::RecvMem>() as u32,
    );

    if map.mem(Bank::Dev).size > 0 {
        if !res.shared {
            let mut size = map.mem(Bank::Dev).size as usize;
            if !same_process {
                size = round_up(size as u64, IPC_MIN as u64) as usize;
                map.mem_mut(Bank::Dev).size = size as u32;
            }
            let ptr = dev.alloc_zeroed(size)? as usize;
            map.mem_mut(Bank::Dev).dev_ptr = ptr;
            map.mem_mut(Bank::Dev).cpu_ptr = ptr;
        }
        if !same_process {
            let ipc = dev.ipc_export(map.mem(Bank::Dev).dev())?;
            map.mem_mut(Bank::Dev).identity = MemIdentity::Ipc(ipc);
        }
    }

    if same_process {
        let size = map.mem(Bank::Host).size as usize;
        let ptr = dev.host_alloc_zeroed(size)? as usize;
        map.mem_mut(Bank::Host).cpu_ptr = ptr;
        map.mem_mut(Bank::Host).dev_ptr = ptr;
    } else {
        let shm = SharedMemory::create_unique("netproxy", map.mem(Bank::Host).size as usize)?;
        map.mem_mut(Bank::Host).cpu_ptr = shm.as_ptr() as usize;
        map.mem_mut(Bank::Host).identity = MemIdentity::Shm(ShmName::new(shm.name())?);
        res.host_shm = Some(shm);
    }

    if dev.gdr_supported() && same_process && param::gdrcopy_sync_enable() {
        let mirror = dev.gdr_alloc(1)?;
        res.gdc_sync = Some(mirror);
        let gdc = map.mem_mut(Bank::Gdc);
        gdc.cpu_ptr = mirror.cpu_ptr as usize;
        gdc.dev_ptr = mirror.dev_ptr as usize;
        gdc.size = size_of::<u64>() as u32;
    }

    let send_mem = unsafe { SendMemPtr::new(map.send_mem_ptr(View::Cpu)) };
    let recv_mem = unsafe { RecvMemPtr::new(map.recv_mem_ptr(View::Cpu)) };
    // Don't grant credits yet in pooled mode: the first slot becomes
    // usable only once the proxy publishes its staging offset.
    send_mem.set_head(if res.shared {
        0u64.wrapping_sub(STEPS)
    } else {
        0
    });
    for slot in 0..STEPS as usize {
        recv_mem.set_size(slot, -1);
    }
    res.send_mem = Some(send_mem);
    res.recv_mem = Some(recv_mem);

    for p in Protocol::ALL {
        let buff = map.pointer(View::Cpu, SlotName::Buff(p));
        res.buffers[p.index()] = buff;
        if buff.is_null() {
            continue;
        }
        let size = res.buff_sizes[p.index()];
        let mem_type = if map.dev_mem(SlotName::Buff(p)) {
            MemType::Device
        } else {
            MemType::Host
        };
        let mh = register_buffer(
            net.as_mut(),
            dev.as_ref(),
            CommId::Send(send_comm),
            buff,
            size,
            mem_type,
            res.use_dmabuf,
        )?;
        res.mhandles[p.index()] = Some(mh);
    }

    res.map = map;
    connection.state = ConnState::Connected;
    rpc::encode(&map, resp)?;
    Ok(Handshake::Done)
}

/// Register one staging buffer, preferring the DMA-BUF path for device
/// memory when the provider and driver both support it.
pub(crate) fn register_buffer(
    net: &mut dyn fabric::Net,
    dev: &dyn DevMem,
    comm: CommId,
    buff: *mut u8,
    size: usize,
    mem_type: MemType,
    use_dmabuf: bool,
) -> Result<fabric::MrHandle> {
    if mem_type == MemType::Device && use_dmabuf {
        if let Some(fd) = dev.dmabuf_fd(buff, size)? {
            let mh = net.reg_mr_dma_buf(comm, buff, size, mem_type, 0, fd)?;
            let _ = nix::unistd::close(fd);
            return Ok(mh);
        }
    }
    Ok(net.reg_mr(comm, buff, size, mem_type)?)
}

// =============================================================================
// Proxy side: teardown
// =============================================================================

pub(crate) fn proxy_free(state: &mut ProxyState, conn: usize) -> Result<()> {
    let connection = &mut state.conns[conn];
    match connection.state {
        ConnState::SharedInitialized => {
            // Pre-connected pool entry only.
            let local_rank = connection.local_rank;
            if let Err(e) = pool::shared_buffers_destroy(
                state.dev.as_ref(),
                &mut state.local_peers,
                local_rank,
                Dir::Send,
            ) {
                warn!("send teardown: pool destroy failed: {}", e);
            }
            state.conns.remove(conn);
            Ok(())
        }
        ConnState::Initialized => {
            state.conns.remove(conn);
            Ok(())
        }
        ConnState::Connected => {
            let res = match std::mem::replace(&mut connection.res, ConnResources::None) {
                ConnResources::Send(r) => r,
                _ => return Err(Error::Internal("send teardown without resources")),
            };
            free_connected(state, *res);
            state.conns.remove(conn);
            Ok(())
        }
    }
}

/// Tear down a fully connected send. Every deregistration, free and close
/// is attempted; failures are logged and the sweep continues.
fn free_connected(state: &mut ProxyState, mut res: SendResources) {
    if let Some(send_comm) = res.send_comm {
        for p in Protocol::ALL {
            if let Some(mh) = res.mhandles[p.index()].take() {
                if let Err(e) = state.net.dereg_mr(CommId::Send(send_comm), mh) {
                    warn!("send teardown: dereg of {:?} staging failed: {}", p, e);
                }
            }
        }
    }

    if res.map.same_process {
        let host = res.map.mem(Bank::Host).cpu();
        if !host.is_null() {
            if let Err(e) = state.dev.host_free(host) {
                warn!("send teardown: host staging free failed: {}", e);
            }
        }
    } else {
        res.host_shm.take();
    }
    if !res.shared && !res.map.mem(Bank::Dev).cpu().is_null() {
        if let Err(e) = state.dev.free(res.map.mem(Bank::Dev).cpu()) {
            warn!("send teardown: device staging free failed: {}", e);
        }
    }
    if let Some(mirror) = res.gdc_sync.take() {
        if let Err(e) = state.dev.gdr_free(mirror) {
            warn!("send teardown: gdr mirror free failed: {}", e);
        }
    }

    if res.shared {
        if let Err(e) = pool::shared_buffers_destroy(
            state.dev.as_ref(),
            &mut state.local_peers,
            res.local_rank,
            Dir::Send,
        ) {
            warn!("send teardown: pool destroy failed: {}", e);
        }
        if res.max_recvs > 1 && param::net_shared_comms() {
            let key = (res.net_dev, res.remote_rank, res.channel_id);
            if let Some(shared_comm) = state.send_comms.get_mut(&key) {
                shared_comm.refcount -= 1;
                if shared_comm.refcount == 0 {
                    if let Err(e) = state.net.close_send(shared_comm.comm) {
                        warn!("send teardown: close failed: {}", e);
                    }
                    state.send_comms.remove(&key);
                }
            }
        } else if let Some(comm) = res.send_comm {
            if let Err(e) = state.net.close_send(comm) {
                warn!("send teardown: close failed: {}", e);
            }
        }
    } else if let Some(comm) = res.send_comm {
        if let Err(e) = state.net.close_send(comm) {
            warn!("send teardown: close failed: {}", e);
        }
    }
}

// =============================================================================
// Proxy side: progress
// =============================================================================

pub(crate) fn proxy_progress(state: &mut ProxyState, args: &mut ProxyOp) -> Result<()> {
    let comm = state.comm.clone();
    let ProxyState { net, conns, .. } = state;

    if args.state == OpState::Ready {
        for sub in args.subs.iter_mut() {
            let res = send_res(conns, sub.conn)?;
            // Round to the next chunk boundary.
            sub.base = round_up(res.step, args.chunk_steps);
            sub.posted = 0;
            sub.transmitted = 0;
            sub.done = 0;
            sub.requests = [None; STEPS as usize];
            if sub.nsteps == 0 {
                res.step = sub.base;
                args.done += 1;
            }
        }
        args.state = if args.done == args.subs.len() {
            OpState::None
        } else {
            OpState::InProgress
        };
    }
    args.idle = true;
    if args.state != OpState::InProgress {
        return Ok(());
    }

    let p = args.protocol;
    let max_depth = STEPS.min(SHARED_STEPS / args.subs.len() as u64);
    let nsubs = args.subs.len();
    for s in 0..nsubs {
        let sub = &mut args.subs[s];
        if sub.done == sub.nsteps {
            continue;
        }
        let res = send_res(conns, sub.conn)?;
        let step_size = res.buff_sizes[p.index()] / STEPS as usize;
        let local_buff = res.buffers[p.index()];
        let (Some(send_mem), Some(recv_mem)) = (res.send_mem, res.recv_mem) else {
            return Err(Error::Internal("progress before connect resolved"));
        };

        // Grant credits to the compute engine.
        if sub.posted < sub.nsteps && sub.posted < sub.done + max_depth {
            if res.shared {
                let slot = ((sub.base + sub.posted) % STEPS) as usize;
                let shared_slot = (sub.posted % max_depth) as usize * nsubs + s;
                let offset = pool::shared_buffers_get(&comm, sub.channel_id, shared_slot);
                recv_mem.set_off(slot, offset as i32);
                full_fence();
                sub.posted += args.slice_steps;
                let head = (sub.base + sub.posted).wrapping_sub(STEPS);
                match res.gdc_sync {
                    Some(mirror) => {
                        unsafe { write_volatile(mirror.cpu_ptr, head) };
                        wc_store_fence();
                    }
                    None => send_mem.set_head(head),
                }
            } else {
                sub.posted += args.slice_steps;
            }
            args.idle = false;
            continue;
        }

        // Transmit slots the compute engine marked ready.
        if sub.transmitted < sub.posted && sub.transmitted < sub.done + STEPS {
            let slot = ((sub.base + sub.transmitted) % STEPS) as usize;
            let size = recv_mem.size(slot);
            if size != -1
                && (recv_mem.tail() > sub.base + sub.transmitted || p == Protocol::Ll)
            {
                let shared_simple = p == Protocol::Simple && res.shared;
                let buff = if shared_simple {
                    unsafe { local_buff.add(recv_mem.off(slot) as usize) }
                } else {
                    unsafe { local_buff.add(slot * step_size) }
                };
                let ready = match p {
                    Protocol::Ll128 => {
                        // Direct-DMA staging is complete by construction;
                        // sysmem staging must wait for every line flag.
                        res.use_gdr
                            || unsafe {
                                ll128_ready(buff, size as usize, sub.base + sub.transmitted + 1)
                            }
                    }
                    Protocol::Ll => {
                        let flag = ll_flag(sub.base + sub.transmitted + 1);
                        unsafe { ll_ready(buff, size as usize, flag) }
                    }
                    Protocol::Simple => true,
                };
                if ready {
                    let send_comm = res
                        .send_comm
                        .ok_or(Error::Internal("transmit without a communicator"))?;
                    let mh = res.mhandles[p.index()]
                        .ok_or(Error::Internal("transmit without a registration"))?;
                    if let Some(request) =
                        net.isend(send_comm, buff, size as usize, res.rank as u32, mh)?
                    {
                        trace!(
                            "send [{}/{}] isend posted, req {}",
                            sub.transmitted,
                            slot,
                            request
                        );
                        recv_mem.set_size(slot, -1);
                        // The size reset must land before the head moves.
                        full_fence();
                        sub.requests[slot] = Some(request);
                        sub.transmitted += args.slice_steps;
                        args.idle = false;
                        continue;
                    }
                }
            }
        }

        // Reap fabric completions and acknowledge to the compute engine.
        if sub.done < sub.transmitted {
            let slot = ((sub.base + sub.done) % STEPS) as usize;
            let request = sub.requests[slot]
                .ok_or(Error::Internal("completion reap without a request"))?;
            if net.test(request, None)? {
                trace!("send [{}/{}] request {} done", sub.done, slot, request);
                sub.requests[slot] = None;
                sub.done += args.slice_steps;
                if !res.shared {
                    let head = sub.base + sub.done;
                    match res.gdc_sync {
                        Some(mirror) => {
                            unsafe { write_volatile(mirror.cpu_ptr, head) };
                            wc_store_fence();
                        }
                        None => send_mem.set_head(head),
                    }
                }
                args.idle = false;
                if sub.done == sub.nsteps {
                    res.step = sub.base + sub.nsteps;
                    args.done += 1;
                }
            }
        }
    }

    if args.done == args.subs.len() {
        args.state = OpState::None;
    }
    Ok(())
}
