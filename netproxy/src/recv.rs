//! Receive side of the NET transport.
//!
//! The receive proxy listens on its NIC during setup and accepts during
//! connect. At progress time, subs sharing a fabric communicator are
//! grouped in place so one `irecv` carries the whole group; completed
//! receives are optionally flushed (direct-DMA staging), committed to the
//! tail word, and acknowledged once the compute engine advances the head.

use std::mem::size_of;
use std::ptr::write_volatile;
use std::rc::Rc;

use log::{info, warn};

use fabric::{CommId, ListenCommId, MemType, Net, RecvCommId};

use crate::dev::{DevMem, GdrMirror};
use crate::error::{Error, Result};
use crate::map::{Bank, ConnectMap, SlotName, View};
use crate::mem::{full_fence, wc_store_fence, RecvMem, RecvMemPtr, SendMem, SendMemPtr};
use crate::op::{OpState, ProxyOp};
use crate::proto::{Protocol, NUM_PROTOCOLS};
use crate::rpc::{self, Handshake, MsgKind, SetupReq};
use crate::send::register_buffer;
use crate::state::{Comm, ConnInfo, ConnResources, ConnState, Connection, ProxyConn, ProxyState};
use crate::topo::TopoGraph;
use crate::{param, pool, round_up, Dir, SHARED_STEPS, STEPS};

/// Proxy-side record of one recv connection.
pub struct RecvResources {
    pub(crate) map: ConnectMap,
    pub(crate) listen_comm: Option<ListenCommId>,
    pub(crate) recv_comm: Option<RecvCommId>,
    pub(crate) send_mem: Option<SendMemPtr>,
    pub(crate) recv_mem: Option<RecvMemPtr>,

    pub(crate) rank: i32,
    pub(crate) local_rank: i32,
    pub(crate) remote_rank: i32,
    /// Rank whose NIC carries the sender's traffic.
    pub(crate) proxy_rank: i32,
    pub(crate) net_dev: usize,
    pub(crate) use_gdr: bool,
    pub(crate) use_dmabuf: bool,
    pub(crate) need_flush: bool,
    pub(crate) max_recvs: usize,
    /// Tail mirror word.
    pub(crate) gdc_sync: Option<*mut u64>,
    /// PCIe read-back word for the inline flush path.
    pub(crate) gdc_flush: Option<*mut u64>,
    pub(crate) gdr_mirror: Option<GdrMirror>,
    pub(crate) shared: bool,
    pub(crate) channel_id: i32,
    pub(crate) conn_index: i32,
    pub(crate) buffers: [*mut u8; NUM_PROTOCOLS],
    pub(crate) buff_sizes: [usize; NUM_PROTOCOLS],
    pub(crate) mhandles: [Option<fabric::MrHandle>; NUM_PROTOCOLS],
    pub(crate) step: u64,
}

impl RecvResources {
    fn new(req: &SetupReq) -> Self {
        RecvResources {
            map: ConnectMap::new(true, false, 0),
            listen_comm: None,
            recv_comm: None,
            send_mem: None,
            recv_mem: None,
            rank: req.rank,
            local_rank: req.local_rank,
            remote_rank: req.remote_rank,
            proxy_rank: -1,
            net_dev: req.net_dev as usize,
            use_gdr: req.use_gdr != 0,
            use_dmabuf: false,
            need_flush: req.need_flush != 0,
            max_recvs: 1,
            gdc_sync: None,
            gdc_flush: None,
            gdr_mirror: None,
            shared: req.shared != 0,
            channel_id: req.channel_id,
            conn_index: req.conn_index,
            buffers: [std::ptr::null_mut(); NUM_PROTOCOLS],
            buff_sizes: [0; NUM_PROTOCOLS],
            mhandles: [None; NUM_PROTOCOLS],
            step: 0,
        }
    }
}

fn recv_res<'a>(
    conns: &'a mut slab::Slab<Connection>,
    conn: usize,
) -> Result<&'a mut RecvResources> {
    match conns.get_mut(conn) {
        Some(Connection {
            res: ConnResources::Recv(r),
            ..
        }) => Ok(r),
        _ => Err(Error::Internal("sub does not reference a recv connection")),
    }
}

// =============================================================================
// Compute side
// =============================================================================

/// Compute-side endpoint of one recv connection.
pub struct RecvConnector {
    pub proxy: ProxyConn,
    shared: bool,
    pub conn_info: Option<ConnInfo>,
}

impl RecvConnector {
    /// Pick the local NIC, run the setup phase (which listens on the
    /// fabric) and return the opaque listen handle to publish to the
    /// sender.
    pub fn setup(
        comm: &Rc<Comm>,
        graph: Option<&TopoGraph>,
        peer_rank: i32,
        channel_id: i32,
        conn_index: i32,
        connect_proxy: &mut dyn FnMut(i32, bool, i32) -> Result<ProxyConn>,
    ) -> Result<(RecvConnector, fabric::Handle)> {
        let shared = if graph.is_some() {
            false
        } else {
            match param::net_shared_buffers() {
                -2 => true,
                v => v != 0,
            }
        };
        // The receiver always uses its own NIC.
        let (net_dev, _proxy_rank) =
            comm.topo
                .get_net_dev(comm.rank, graph, channel_id, comm.rank)?;
        let use_gdr = comm.topo.check_gdr(comm.my_info().bus_id, net_dev, false)?;
        let need_flush = if use_gdr {
            comm.topo.need_flush(comm.my_info().bus_id)?
        } else {
            false
        };
        let local_rank = comm.topo.get_local_rank(comm.rank)?;

        // No remote proxying on receive: talk to our own rank's agent.
        let proxy = connect_proxy(comm.rank, false, local_rank)?;
        let req = SetupReq {
            rank: comm.rank,
            local_rank,
            remote_rank: peer_rank,
            shared: shared as i32,
            net_dev: net_dev as i32,
            use_gdr: use_gdr as i32,
            need_flush: need_flush as i32,
            channel_id,
            conn_index,
        };
        let mut req_buf = [0u8; size_of::<SetupReq>()];
        rpc::encode(&req, &mut req_buf)?;
        let mut handle = fabric::Handle::zeroed();
        proxy.call(MsgKind::Setup, &req_buf, &mut handle.0)?;

        info!(
            "channel {:02}/{} : {} -> {} [receive] via NET/{}{}{}",
            channel_id,
            conn_index,
            peer_rank,
            comm.rank,
            net_dev,
            if use_gdr { "/GDRDMA" } else { "" },
            if shared { "/Shared" } else { "" },
        );

        Ok((
            RecvConnector {
                proxy,
                shared,
                conn_info: None,
            },
            handle,
        ))
    }

    /// Forward the sender's proxy rank, receive the bank map and resolve
    /// the staging pointers. The recv proxy always shares our address
    /// space, so no remapping happens here.
    pub fn connect(&mut self, peer_info: &fabric::Handle) -> Result<ConnInfo> {
        let proxy_rank = i32::from_le_bytes(peer_info.0[..4].try_into().unwrap());
        let mut resp = [0u8; size_of::<ConnectMap>()];
        let mut req = [0u8; size_of::<i32>()];
        rpc::encode(&proxy_rank, &mut req)?;
        self.proxy.call(MsgKind::Connect, &req, &mut resp)?;
        let map: ConnectMap = rpc::decode(&resp)?;

        let send_mem = map.send_mem_ptr(View::Dev);
        let recv_mem = map.recv_mem_ptr(View::Dev);
        let gdc = map.mem(Bank::Gdc).dev();
        let info = unsafe {
            ConnInfo {
                head: std::ptr::addr_of_mut!((*send_mem).head),
                tail: if gdc.is_null() {
                    std::ptr::addr_of_mut!((*recv_mem).tail)
                } else {
                    gdc as *mut u64
                },
                sizes_fifo: std::ptr::addr_of_mut!((*recv_mem).sizes_fifo) as *mut i32,
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
                direct_nic: false,
            }
        };
        self.conn_info = Some(info);
        Ok(info)
    }

    pub fn shared(&self) -> bool {
        self.shared
    }

    pub fn free(self) -> Result<()> {
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

    let mut resources = RecvResources::new(&req);
    let props = state.net.get_properties(resources.net_dev)?;
    resources.use_dmabuf = resources.use_gdr
        && state.comm.dma_buf_support
        && props.ptr_support.contains(fabric::PtrSupport::DMABUF);
    resources.max_recvs = props.max_recvs;

    // Listen now; the handle is the connect info shipped to the sender.
    let (handle, listen_comm) = state.net.listen(resources.net_dev)?;
    resources.listen_comm = Some(listen_comm);
    rpc::encode(&handle, resp)?;

    let connection = &mut state.conns[conn];
    connection.shared = resources.shared;
    connection.local_rank = resources.local_rank;
    connection.res = ConnResources::Recv(Box::new(resources));
    Ok(Handshake::Done)
}

pub(crate) fn proxy_connect(
    state: &mut ProxyState,
    conn: usize,
    req: &[u8],
    resp: &mut [u8],
) -> Result<Handshake> {
    let proxy_rank: i32 = rpc::decode(req)?;
    let comm = state.comm.clone();
    let ProxyState {
        net,
        dev,
        conns,
        local_peers,
        recv_comms,
        ..
    } = state;
    let connection = conns
        .get_mut(conn)
        .ok_or(Error::Internal("connect for an unknown connection"))?;
    let res = match &mut connection.res {
        ConnResources::Recv(r) => r.as_mut(),
        _ => return Err(Error::Internal("connect before recv setup")),
    };
    res.proxy_rank = proxy_rank;

    if res.recv_comm.is_none() {
        let listen_comm = res
            .listen_comm
            .ok_or(Error::Internal("connect without a listener"))?;
        if res.shared && res.max_recvs > 1 && param::net_shared_comms() {
            // Accept or reuse the communicator for this
            // (netdev, proxy rank, channel) triple.
            let key = (res.net_dev, proxy_rank, res.channel_id);
            if !recv_comms.contains_key(&key) {
                if let Some(comm_id) = net.accept(listen_comm)? {
                    recv_comms.insert(
                        key,
                        crate::state::SharedComm {
                            comm: comm_id,
                            refcount: 0,
                        },
                    );
                }
            }
            if let Some(shared_comm) = recv_comms.get_mut(&key) {
                res.recv_comm = Some(shared_comm.comm);
                shared_comm.refcount += 1;
            }
        } else {
            res.recv_comm = net.accept(listen_comm)?;
        }
    }
    let Some(recv_comm) = res.recv_comm else {
        return Ok(Handshake::Retry);
    };
    if let Some(listen_comm) = res.listen_comm.take() {
        net.close_listen(listen_comm)?;
    }

    let same_process = comm.same_process(res.rank);
    if !same_process {
        // The recv proxy always runs in the consumer's process.
        return Err(Error::Internal("cross-process recv proxy is not supported"));
    }
    let mut map = ConnectMap::new(true, res.shared, dev.device());

    if !res.shared {
        for p in Protocol::ALL {
            map.add_slot(
                SlotName::Buff(p),
                false,
                res.use_gdr,
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
            Dir::Recv,
            true,
            comm.p2p_n_channels,
        )?;
        res.buff_sizes[Protocol::Simple.index()] = bufs.size;
        {
            let mem = map.mem_mut(bank);
            mem.cpu_ptr = bufs.cpu_ptr as usize;
            mem.dev_ptr = bufs.dev_ptr as usize;
            mem.size = bufs.size as u32;
        }
        map.add_slot(
            SlotName::Buff(Protocol::Simple),
            true,
            res.use_gdr,
            bufs.size as u32,
        );
    }

    map.add_slot(SlotName::SendMem, false, false, size_of::<SendMem>() as u32);
    map.add_slot(SlotName::RecvMem, false, false, size_of::<RecvMem>() as u32);

    if res.shared && comm.alloc_p2p_net_ll_buffers {
        map.add_slot(
            SlotName::Buff(Protocol::Ll),
            false,
            false,
            comm.buff_sizes[Protocol::Ll.index()] as u32,
        );
        res.buff_sizes[Protocol::Ll.index()] = comm.buff_sizes[Protocol::Ll.index()];
    }

    if map.mem(Bank::Dev).size > 0 && !res.shared {
        let ptr = dev.alloc_zeroed(map.mem(Bank::Dev).size as usize)? as usize;
        map.mem_mut(Bank::Dev).dev_ptr = ptr;
        map.mem_mut(Bank::Dev).cpu_ptr = ptr;
    }
    {
        let size = map.mem(Bank::Host).size as usize;
        let ptr = dev.host_alloc_zeroed(size)? as usize;
        map.mem_mut(Bank::Host).cpu_ptr = ptr;
        map.mem_mut(Bank::Host).dev_ptr = ptr;
    }

    if dev.gdr_supported() {
        // Word 0 mirrors the tail, word 1 backs the inline flush read.
        let mirror = dev.gdr_alloc(2)?;
        res.gdr_mirror = Some(mirror);
        if param::gdrcopy_sync_enable() {
            res.gdc_sync = Some(mirror.cpu_ptr);
            let gdc = map.mem_mut(Bank::Gdc);
            gdc.cpu_ptr = mirror.cpu_ptr as usize;
            gdc.dev_ptr = mirror.dev_ptr as usize;
            gdc.size = size_of::<u64>() as u32;
        }
        if param::gdrcopy_flush_enable() {
            res.gdc_flush = Some(unsafe { mirror.cpu_ptr.add(1) });
        }
    }

    res.send_mem = Some(unsafe { SendMemPtr::new(map.send_mem_ptr(View::Cpu)) });
    res.recv_mem = Some(unsafe { RecvMemPtr::new(map.recv_mem_ptr(View::Cpu)) });

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
            CommId::Recv(recv_comm),
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

// =============================================================================
// Proxy side: teardown
// =============================================================================

pub(crate) fn proxy_free(state: &mut ProxyState, conn: usize) -> Result<()> {
    let connection = &mut state.conns[conn];
    match connection.state {
        ConnState::SharedInitialized => {
            let local_rank = connection.local_rank;
            if let Err(e) = pool::shared_buffers_destroy(
                state.dev.as_ref(),
                &mut state.local_peers,
                local_rank,
                Dir::Recv,
            ) {
                warn!("recv teardown: pool destroy failed: {}", e);
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
                ConnResources::Recv(r) => r,
                _ => return Err(Error::Internal("recv teardown without resources")),
            };
            free_connected(state, *res);
            state.conns.remove(conn);
            Ok(())
        }
    }
}

/// Tear down a fully connected recv; every step is attempted.
fn free_connected(state: &mut ProxyState, mut res: RecvResources) {
    if let Some(recv_comm) = res.recv_comm {
        for p in Protocol::ALL {
            if let Some(mh) = res.mhandles[p.index()].take() {
                if let Err(e) = state.net.dereg_mr(CommId::Recv(recv_comm), mh) {
                    warn!("recv teardown: dereg of {:?} staging failed: {}", p, e);
                }
            }
        }
    }

    let host = res.map.mem(Bank::Host).cpu();
    if !host.is_null() {
        if let Err(e) = state.dev.host_free(host) {
            warn!("recv teardown: host staging free failed: {}", e);
        }
    }
    if !res.shared && !res.map.mem(Bank::Dev).cpu().is_null() {
        if let Err(e) = state.dev.free(res.map.mem(Bank::Dev).cpu()) {
            warn!("recv teardown: device staging free failed: {}", e);
        }
    }
    if let Some(mirror) = res.gdr_mirror.take() {
        if let Err(e) = state.dev.gdr_free(mirror) {
            warn!("recv teardown: gdr mirror free failed: {}", e);
        }
    }

    if res.shared {
        if let Err(e) = pool::shared_buffers_destroy(
            state.dev.as_ref(),
            &mut state.local_peers,
            res.local_rank,
            Dir::Recv,
        ) {
            warn!("recv teardown: pool destroy failed: {}", e);
        }
        if res.max_recvs > 1 && param::net_shared_comms() {
            let key = (res.net_dev, res.proxy_rank, res.channel_id);
            if let Some(shared_comm) = state.recv_comms.get_mut(&key) {
                shared_comm.refcount -= 1;
                if shared_comm.refcount == 0 {
                    if let Err(e) = state.net.close_recv(shared_comm.comm) {
                        warn!("recv teardown: close failed: {}", e);
                    }
                    state.recv_comms.remove(&key);
                }
            }
        } else if let Some(comm) = res.recv_comm {
            if let Err(e) = state.net.close_recv(comm) {
                warn!("recv teardown: close failed: {}", e);
            }
        }
    } else if let Some(comm) = res.recv_comm {
        if let Err(e) = state.net.close_recv(comm) {
            warn!("recv teardown: close failed: {}", e);
        }
    }
}

// =============================================================================
// Proxy side: progress
// =============================================================================

/// Force the received bytes out of the PCIe pipeline with a read from the
/// GDR-copy flush word.
fn inline_flush(ptr: *mut u64) -> Result<()> {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::ptr::read_volatile(ptr) };
        Ok(())
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ptr;
        warn!("inline GDR flush is only supported on x86_64");
        Err(Error::Internal(
            "inline flush unsupported on this architecture",
        ))
    }
}

pub(crate) fn proxy_progress(state: &mut ProxyState, args: &mut ProxyOp) -> Result<()> {
    let comm = state.comm.clone();
    let ProxyState { net, conns, .. } = state;
    let nsubs = args.subs.len();

    if args.state == OpState::Ready {
        // Group consecutive subs sharing a fabric communicator, bounded by
        // the provider's fusion limit; later same-comm subs are swapped in.
        let mut group_size: usize = 0;
        let mut max_recvs: usize = 1;
        let mut group_comm: Option<RecvCommId> = None;
        for s in 0..nsubs {
            if group_size == max_recvs {
                group_size = 0;
            } else if s > 0 {
                let mut next = s;
                while next < nsubs {
                    if recv_res(conns, args.subs[next].conn)?.recv_comm == group_comm {
                        break;
                    }
                    next += 1;
                }
                if next == nsubs {
                    group_size = 0;
                } else if next != s {
                    args.subs.swap(s, next);
                }
            }
            group_size += 1;

            let res = recv_res(conns, args.subs[s].conn)?;
            max_recvs = res.max_recvs;
            group_comm = res.recv_comm;
            let base = round_up(res.step, args.chunk_steps);
            if args.subs[s].nsteps == 0 {
                res.step = base;
                args.done += 1;
            }
            let sub = &mut args.subs[s];
            sub.base = base;
            sub.posted = 0;
            sub.received = 0;
            sub.transmitted = 0;
            sub.done = 0;
            sub.requests = [None; STEPS as usize];
            for i in 0..group_size {
                args.subs[s - i].group_size = group_size;
            }
        }
        args.state = if args.done == nsubs {
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
    let max_depth = STEPS.min(SHARED_STEPS / nsubs as u64);

    // Post fused receives, one per group; a member that would overrun the
    // pool depth skips the whole group this round.
    let mut s = 0;
    while s < nsubs {
        let group_size = args.subs[s].group_size;
        let mut ptrs = [std::ptr::null_mut(); fabric::MAX_RECV];
        let mut sizes = [0usize; fabric::MAX_RECV];
        let mut tags = [0u32; fabric::MAX_RECV];
        let mut mhs = [0usize; fabric::MAX_RECV];
        let mut sub_count = 0;
        for i in 0..group_size {
            let (posted, done, nsteps, base, channel_id, nbytes) = {
                let sub = &args.subs[s + i];
                (
                    sub.posted,
                    sub.done,
                    sub.nsteps,
                    sub.base,
                    sub.channel_id,
                    sub.nbytes,
                )
            };
            if posted < nsteps {
                if posted >= done + max_depth {
                    sub_count = 0;
                    break;
                }
                let res = recv_res(conns, args.subs[s + i].conn)?;
                let step_size = res.buff_sizes[p.index()] / STEPS as usize;
                let local_buff = res.buffers[p.index()];
                let slot = ((base + posted) % STEPS) as usize;
                let buff = if p == Protocol::Simple && res.shared {
                    let shared_slot = (posted % max_depth) as usize * nsubs + s + i;
                    let offset = pool::shared_buffers_get(&comm, channel_id, shared_slot);
                    let recv_mem = res
                        .recv_mem
                        .ok_or(Error::Internal("progress before connect resolved"))?;
                    recv_mem.set_off(slot, offset as i32);
                    unsafe { local_buff.add(offset) }
                } else {
                    unsafe { local_buff.add(slot * step_size) }
                };
                ptrs[sub_count] = buff;
                sizes[sub_count] = (step_size * args.slice_steps as usize).min(nbytes);
                tags[sub_count] = res.remote_rank as u32;
                mhs[sub_count] = res.mhandles[p.index()]
                    .ok_or(Error::Internal("receive without a registration"))?;
                sub_count += 1;
            }
        }
        if sub_count > 0 {
            let req_slot = (args.subs[s].posted % STEPS) as usize;
            let res = recv_res(conns, args.subs[s].conn)?;
            let recv_comm = res
                .recv_comm
                .ok_or(Error::Internal("receive without a communicator"))?;
            if let Some(request) = net.irecv(
                recv_comm,
                &ptrs[..sub_count],
                &sizes[..sub_count],
                &tags[..sub_count],
                &mhs[..sub_count],
            )? {
                args.subs[s].requests[req_slot] = Some(request);
                for i in 0..group_size {
                    args.subs[s + i].posted += args.slice_steps;
                }
                args.idle = false;
            }
        }
        s += group_size;
    }
    if !args.idle {
        return Ok(());
    }

    // Detect completed receives and start the flush when direct-DMA
    // staging needs one.
    let mut s = 0;
    while s < nsubs {
        let group_size = args.subs[s].group_size;
        if args.subs[s].posted > args.subs[s].received {
            let step = args.subs[s].received;
            let slot = (step % STEPS) as usize;
            let request = args.subs[s].requests[slot]
                .ok_or(Error::Internal("receive test without a request"))?;
            let mut sizes = [0i32; fabric::MAX_RECV];
            if net.test(request, Some(&mut sizes))? {
                args.subs[s].requests[slot] = None;
                let total_size: i64 = sizes.iter().map(|&v| v as i64).sum();
                let mut need_flush = false;
                for i in 0..group_size {
                    args.subs[s + i].received += args.slice_steps;
                    if step < args.subs[s + i].nsteps {
                        let res = recv_res(conns, args.subs[s + i].conn)?;
                        if res.use_gdr {
                            need_flush |= res.need_flush;
                        }
                    }
                }
                if total_size > 0 && p == Protocol::Simple && need_flush {
                    let leader = recv_res(conns, args.subs[s].conn)?;
                    if let Some(flush_ptr) = leader.gdc_flush {
                        inline_flush(flush_ptr)?;
                    } else {
                        let mut ptrs = [std::ptr::null_mut(); fabric::MAX_RECV];
                        let mut mhs = [0usize; fabric::MAX_RECV];
                        let mut flush_sizes = [0usize; fabric::MAX_RECV];
                        let mut sub_count = 0;
                        for i in 0..group_size {
                            let (posted, nsteps, base) = {
                                let sub = &args.subs[s + i];
                                (sub.posted, sub.nsteps, sub.base)
                            };
                            if step < nsteps {
                                let res = recv_res(conns, args.subs[s + i].conn)?;
                                let step_size = res.buff_sizes[p.index()] / STEPS as usize;
                                let local_buff = res.buffers[p.index()];
                                // The slot is recomputed from `posted`, not
                                // `received`; the staging offset at that slot
                                // has not been re-granted since the post.
                                let slot = ((base + posted) % STEPS) as usize;
                                ptrs[sub_count] = if res.shared {
                                    let recv_mem = res.recv_mem.ok_or(Error::Internal(
                                        "progress before connect resolved",
                                    ))?;
                                    unsafe { local_buff.add(recv_mem.off(slot) as usize) }
                                } else {
                                    unsafe { local_buff.add(slot * step_size) }
                                };
                                mhs[sub_count] = res.mhandles[p.index()]
                                    .ok_or(Error::Internal("flush without a registration"))?;
                                flush_sizes[sub_count] = sizes[sub_count] as usize;
                                sub_count += 1;
                            }
                        }
                        let res = recv_res(conns, args.subs[s].conn)?;
                        let recv_comm = res
                            .recv_comm
                            .ok_or(Error::Internal("flush without a communicator"))?;
                        if let Some(request) = net.iflush(
                            recv_comm,
                            &ptrs[..sub_count],
                            &flush_sizes[..sub_count],
                            &mhs[..sub_count],
                        )? {
                            // Tail commit now waits on the flush.
                            args.subs[s].requests[slot] = Some(request);
                        }
                    }
                }
                args.idle = false;
            }
        }
        s += group_size;
    }
    if !args.idle {
        return Ok(());
    }

    // Commit completed (and flushed) slices to the tail word.
    let mut s = 0;
    while s < nsubs {
        let group_size = args.subs[s].group_size;
        if args.subs[s].received > args.subs[s].transmitted {
            let step = args.subs[s].transmitted;
            let slot = (step % STEPS) as usize;
            let done = match args.subs[s].requests[slot] {
                Some(request) => net.test(request, None)?,
                None => true,
            };
            if done {
                args.subs[s].requests[slot] = None;
                for i in 0..group_size {
                    args.subs[s + i].transmitted += args.slice_steps;
                    if step < args.subs[s + i].nsteps {
                        full_fence();
                        let tail = args.subs[s + i].base + args.subs[s + i].transmitted;
                        let res = recv_res(conns, args.subs[s + i].conn)?;
                        match res.gdc_sync {
                            Some(sync_ptr) => {
                                unsafe { write_volatile(sync_ptr, tail) };
                                wc_store_fence();
                            }
                            None => {
                                let recv_mem = res.recv_mem.ok_or(Error::Internal(
                                    "progress before connect resolved",
                                ))?;
                                recv_mem.set_tail(tail);
                            }
                        }
                    }
                }
                args.idle = false;
            }
        }
        s += group_size;
    }
    if !args.idle {
        return Ok(());
    }

    // Release slots the compute engine has consumed (head advanced).
    let mut s = 0;
    while s < nsubs {
        let group_size = args.subs[s].group_size;
        for i in 0..group_size {
            let idx = s + i;
            if args.subs[idx].done == args.subs[idx].nsteps {
                continue;
            }
            if args.subs[idx].transmitted > args.subs[idx].done {
                let head = {
                    let res = recv_res(conns, args.subs[idx].conn)?;
                    let send_mem = res
                        .send_mem
                        .ok_or(Error::Internal("progress before connect resolved"))?;
                    send_mem.head()
                };
                while head > args.subs[idx].base + args.subs[idx].done
                    && args.subs[idx].transmitted > args.subs[idx].done
                {
                    args.subs[idx].done += args.slice_steps;
                    args.idle = false;
                    if args.subs[idx].done == args.subs[idx].nsteps {
                        let res = recv_res(conns, args.subs[idx].conn)?;
                        res.step = args.subs[idx].base + args.subs[idx].nsteps;
                        args.done += 1;
                        break;
                    }
                }
            }
        }
        s += group_size;
    }

    if args.done == nsubs {
        args.state = OpState::None;
    }
    Ok(())
}
