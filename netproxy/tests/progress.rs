//! Progress state machine tests: the concrete pipeline scenarios, the
//! boundary behaviors, and the cursor invariants checked on every step.

mod common;

use common::{GpuSide, Harness, HarnessConfig};
use fabric::loopback::LoopbackConfig;
use netproxy::topo::TopoGraph;
use netproxy::{Dir, Protocol, ProxyOp, ProxySub, SHARED_STEPS, STEPS};

fn check_invariants(op: &ProxyOp) {
    let max_depth = STEPS.min(SHARED_STEPS / op.subs.len() as u64);
    for sub in &op.subs {
        assert_eq!(sub.base() % op.chunk_steps, 0);
        for cursor in [sub.posted(), sub.received(), sub.transmitted(), sub.done()] {
            assert_eq!(cursor % op.slice_steps, 0);
        }
        assert!(sub.posted() >= sub.transmitted());
        assert!(sub.transmitted() >= sub.done());
        if op.dir == Dir::Recv {
            assert!(sub.posted() >= sub.received());
            assert!(sub.received() >= sub.transmitted());
        }
        assert!(sub.transmitted() <= sub.done() + STEPS);
        assert!(sub.posted() <= sub.done() + max_depth);
    }
}

/// LL line bytes for `data` u64 chunks, both flags set to `flag`.
fn ll_bytes(lines: &[(u32, u32)], flag: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for &(d1, d2) in lines {
        out.extend_from_slice(&d1.to_le_bytes());
        out.extend_from_slice(&flag.to_le_bytes());
        out.extend_from_slice(&d2.to_le_bytes());
        out.extend_from_slice(&flag.to_le_bytes());
    }
    out
}

// =============================================================================
// S1 — single slice, SIMPLE, dedicated buffers
// =============================================================================

#[test]
fn test_single_slice_simple_dedicated() {
    let mut harness = Harness::new(HarnessConfig::default());
    let graph = TopoGraph { id: 0 };
    let (send_conn, recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let s_gpu = GpuSide::new(send_conn.conn_info.unwrap());
    let r_gpu = GpuSide::new(recv_conn.conn_info.unwrap());

    let step_size = harness.comm_send.buff_sizes[Protocol::Simple.index()] / STEPS as usize;
    let payload: Vec<u8> = (0..step_size).map(|i| (i * 7) as u8).collect();
    s_gpu.write_buff(Protocol::Simple, 0, &payload);
    s_gpu.set_size(0, step_size as i32);
    s_gpu.set_tail(2);

    let mut sop = ProxyOp::new(
        Dir::Send,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(send_conn.proxy.conn, 0, 2, step_size)],
    )
    .unwrap();
    let mut rop = ProxyOp::new(
        Dir::Recv,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(recv_conn.proxy.conn, 0, 2, step_size)],
    )
    .unwrap();

    let mut acked = false;
    for _ in 0..64 {
        harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();
        harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
        check_invariants(&sop);
        check_invariants(&rop);
        // The compute engine consumes once the tail is published.
        if !acked && r_gpu.tail() == 2 {
            r_gpu.set_head(2);
            acked = true;
        }
        if sop.completed() && rop.completed() {
            break;
        }
    }

    assert!(sop.completed(), "send op did not finish");
    assert!(rop.completed(), "recv op did not finish");
    assert_eq!(s_gpu.head(), 2);
    assert_eq!(r_gpu.tail(), 2);
    assert_eq!(r_gpu.read_buff(Protocol::Simple, 0, step_size), payload);
    assert_eq!(harness.net.counters().isend, 1);
    assert_eq!(harness.net.counters().irecv, 1);
    assert_eq!(harness.net.outstanding_requests(), 0);
}

// =============================================================================
// S2 — credit stall in pooled mode
// =============================================================================

#[test]
fn test_pooled_send_stalls_at_pool_depth() {
    let mut harness = Harness::new(HarnessConfig::default());
    // Eight subs shrink the in-flight window to SHARED_STEPS / 8 = 2.
    let mut subs = Vec::new();
    let mut conns = Vec::new();
    for channel in 0..8 {
        let (send_conn, recv_conn) = harness.connect_pair(None, channel, 0);
        subs.push(ProxySub::new(send_conn.proxy.conn, channel, 8, 256));
        conns.push((send_conn, recv_conn));
    }
    let mut sop = ProxyOp::new(Dir::Send, Protocol::Simple, 2, 2, subs).unwrap();

    // The compute engine never writes sizes and never consumes credits.
    for _ in 0..32 {
        harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
        check_invariants(&sop);
    }
    for sub in &sop.subs {
        assert_eq!(sub.posted(), 2);
        assert_eq!(sub.transmitted(), 0);
        assert_eq!(sub.done(), 0);
    }
    assert_eq!(harness.net.counters().isend, 0);
}

// =============================================================================
// S3 — LL readiness requires every flag
// =============================================================================

#[test]
fn test_ll_flag_miss_holds_transmit() {
    let mut harness = Harness::new(HarnessConfig::default());
    let graph = TopoGraph { id: 0 };
    let (send_conn, _recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let s_gpu = GpuSide::new(send_conn.conn_info.unwrap());

    // Two LL lines; the second is missing flag2.
    let flag = 1u32; // base + transmitted + 1
    let mut bytes = ll_bytes(&[(0xAAAA, 0xBBBB), (0xCCCC, 0xDDDD)], flag);
    bytes[28..32].copy_from_slice(&0u32.to_le_bytes());
    s_gpu.write_buff(Protocol::Ll, 0, &bytes);
    s_gpu.set_size(0, bytes.len() as i32);

    let mut sop = ProxyOp::new(
        Dir::Send,
        Protocol::Ll,
        2,
        2,
        vec![ProxySub::new(send_conn.proxy.conn, 0, 2, bytes.len())],
    )
    .unwrap();

    for _ in 0..8 {
        harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
    }
    assert_eq!(sop.subs[0].transmitted(), 0);
    assert_eq!(harness.net.counters().isend, 0);

    // Completing the missing flag releases exactly one transmit.
    s_gpu.write_buff(Protocol::Ll, 28, &flag.to_le_bytes());
    for _ in 0..4 {
        harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
    }
    assert_eq!(sop.subs[0].transmitted(), 2);
    assert_eq!(harness.net.counters().isend, 1);
}

// =============================================================================
// S4 — recv grouping by fabric communicator
// =============================================================================

#[test]
fn test_recv_groups_by_communicator() {
    let mut harness = Harness::new(HarnessConfig {
        loopback: LoopbackConfig {
            max_recvs: 2,
            ..Default::default()
        },
        ..Default::default()
    });
    // Subs 0 and 2 share channel 0 (one pooled communicator); sub 1 is
    // alone on channel 1.
    let (s0, r0) = harness.connect_pair(None, 0, 0);
    let (s1, r1) = harness.connect_pair(None, 1, 0);
    let (s2, r2) = harness.connect_pair(None, 0, 1);
    let _keep = (s0, s1, s2);

    let subs = vec![
        ProxySub::new(r0.proxy.conn, 0, 2, 128),
        ProxySub::new(r1.proxy.conn, 1, 2, 128),
        ProxySub::new(r2.proxy.conn, 0, 2, 128),
    ];
    let mut rop = ProxyOp::new(Dir::Recv, Protocol::Simple, 2, 2, subs).unwrap();
    harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();
    check_invariants(&rop);

    // Reordered in place to (0, 2, 1) with group sizes (2, 2, 1).
    assert_eq!(rop.subs[0].conn, r0.proxy.conn);
    assert_eq!(rop.subs[1].conn, r2.proxy.conn);
    assert_eq!(rop.subs[2].conn, r1.proxy.conn);
    assert_eq!(rop.subs[0].group_size(), 2);
    assert_eq!(rop.subs[1].group_size(), 2);
    assert_eq!(rop.subs[2].group_size(), 1);

    // One fused irecv for the pair, one single receive for the loner.
    assert_eq!(harness.net.fused_counts(), vec![2, 1]);
}

#[test]
fn test_max_recvs_one_degenerates_groups() {
    let mut harness = Harness::new(HarnessConfig {
        loopback: LoopbackConfig {
            max_recvs: 1,
            ..Default::default()
        },
        ..Default::default()
    });
    let (_s0, r0) = harness.connect_pair(None, 0, 0);
    let (_s1, r1) = harness.connect_pair(None, 0, 1);

    let subs = vec![
        ProxySub::new(r0.proxy.conn, 0, 2, 64),
        ProxySub::new(r1.proxy.conn, 0, 2, 64),
    ];
    let mut rop = ProxyOp::new(Dir::Recv, Protocol::Simple, 2, 2, subs).unwrap();
    harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();

    assert!(rop.subs.iter().all(|s| s.group_size() == 1));
    assert_eq!(harness.net.fused_counts(), vec![1, 1]);
}

// =============================================================================
// S5 — GDR flush gates the tail
// =============================================================================

#[test]
fn test_gdr_flush_delays_tail() {
    let mut harness = Harness::new(HarnessConfig {
        loopback: LoopbackConfig {
            flush_polls: 1,
            ..Default::default()
        },
        use_gdr: true,
        need_flush: true,
        ..Default::default()
    });
    let graph = TopoGraph { id: 0 };
    let (send_conn, recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let s_gpu = GpuSide::new(send_conn.conn_info.unwrap());
    let r_gpu = GpuSide::new(recv_conn.conn_info.unwrap());

    let step_size = harness.comm_send.buff_sizes[Protocol::Simple.index()] / STEPS as usize;
    let payload = vec![0x5Au8; step_size];
    s_gpu.write_buff(Protocol::Simple, 0, &payload);
    s_gpu.set_size(0, step_size as i32);
    s_gpu.set_tail(2);

    let mut sop = ProxyOp::new(
        Dir::Send,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(send_conn.proxy.conn, 0, 2, step_size)],
    )
    .unwrap();
    let mut rop = ProxyOp::new(
        Dir::Recv,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(recv_conn.proxy.conn, 0, 2, step_size)],
    )
    .unwrap();

    // Drive until the receive has completed and the flush is in flight.
    for _ in 0..16 {
        harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
        harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();
        if rop.subs[0].received() == 2 {
            break;
        }
    }
    assert_eq!(rop.subs[0].received(), 2);
    assert_eq!(harness.net.counters().iflush, 1);
    // The flush has not completed: the tail must not be visible yet.
    assert_eq!(rop.subs[0].transmitted(), 0);
    assert_eq!(r_gpu.tail(), 0);

    // The first poll still finds the flush in flight.
    harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();
    assert_eq!(rop.subs[0].transmitted(), 0);
    assert_eq!(r_gpu.tail(), 0);

    // The next poll completes the flush and publishes the tail.
    harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();
    assert_eq!(rop.subs[0].transmitted(), 2);
    assert_eq!(r_gpu.tail(), 2);
}

// =============================================================================
// Boundary behaviors
// =============================================================================

#[test]
fn test_zero_steps_completes_without_fabric() {
    let mut harness = Harness::new(HarnessConfig::default());
    let graph = TopoGraph { id: 0 };
    let (send_conn, recv_conn) = harness.connect_pair(Some(&graph), 0, 0);

    let mut sop = ProxyOp::new(
        Dir::Send,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(send_conn.proxy.conn, 0, 0, 0)],
    )
    .unwrap();
    let mut rop = ProxyOp::new(
        Dir::Recv,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(recv_conn.proxy.conn, 0, 0, 0)],
    )
    .unwrap();
    harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
    harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();

    assert!(sop.completed());
    assert!(rop.completed());
    let counters = harness.net.counters();
    assert_eq!(counters.isend, 0);
    assert_eq!(counters.irecv, 0);
}

#[test]
fn test_short_payload_sends_exact_bytes() {
    let mut harness = Harness::new(HarnessConfig::default());
    let graph = TopoGraph { id: 0 };
    let (send_conn, recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let s_gpu = GpuSide::new(send_conn.conn_info.unwrap());
    let r_gpu = GpuSide::new(recv_conn.conn_info.unwrap());

    let nbytes = 100;
    let payload: Vec<u8> = (0..nbytes).map(|i| i as u8).collect();
    s_gpu.write_buff(Protocol::Simple, 0, &payload);
    s_gpu.set_size(0, nbytes as i32);
    s_gpu.set_tail(2);

    let mut sop = ProxyOp::new(
        Dir::Send,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(send_conn.proxy.conn, 0, 2, nbytes)],
    )
    .unwrap();
    let mut rop = ProxyOp::new(
        Dir::Recv,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(recv_conn.proxy.conn, 0, 2, nbytes)],
    )
    .unwrap();

    let mut acked = false;
    for _ in 0..64 {
        harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();
        harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
        if !acked && r_gpu.tail() == 2 {
            r_gpu.set_head(2);
            acked = true;
        }
        if sop.completed() && rop.completed() {
            break;
        }
    }
    assert!(sop.completed() && rop.completed());
    assert_eq!(r_gpu.read_buff(Protocol::Simple, 0, nbytes), payload);
}

#[test]
fn test_isend_backpressure_does_not_advance_cursors() {
    let mut harness = Harness::new(HarnessConfig {
        loopback: LoopbackConfig {
            isend_null: 2,
            ..Default::default()
        },
        ..Default::default()
    });
    let graph = TopoGraph { id: 0 };
    let (send_conn, _recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let s_gpu = GpuSide::new(send_conn.conn_info.unwrap());

    s_gpu.write_buff(Protocol::Simple, 0, &[1u8; 64]);
    s_gpu.set_size(0, 64);
    s_gpu.set_tail(2);

    let mut sop = ProxyOp::new(
        Dir::Send,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(send_conn.proxy.conn, 0, 2, 64)],
    )
    .unwrap();

    // First call grants credits; the two following transmit attempts get
    // no request slot and must leave the cursors alone.
    for _ in 0..3 {
        harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
    }
    assert_eq!(sop.subs[0].transmitted(), 0);
    assert_eq!(harness.net.counters().isend, 0);

    harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
    assert_eq!(sop.subs[0].transmitted(), 2);
    assert_eq!(harness.net.counters().isend, 1);
}

// =============================================================================
// GDR-copy mirrors
// =============================================================================

#[test]
fn test_gdr_copy_mirror_publishes_head_and_tail() {
    let mut harness = Harness::new(HarnessConfig {
        gdr_copy: true,
        ..Default::default()
    });
    let graph = TopoGraph { id: 0 };
    let (send_conn, recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let s_gpu = GpuSide::new(send_conn.conn_info.unwrap());
    let r_gpu = GpuSide::new(recv_conn.conn_info.unwrap());

    let nbytes = 256;
    s_gpu.write_buff(Protocol::Simple, 0, &[0x11u8; 256]);
    s_gpu.set_size(0, nbytes as i32);
    s_gpu.set_tail(2);

    let mut sop = ProxyOp::new(
        Dir::Send,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(send_conn.proxy.conn, 0, 2, nbytes)],
    )
    .unwrap();
    let mut rop = ProxyOp::new(
        Dir::Recv,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(recv_conn.proxy.conn, 0, 2, nbytes)],
    )
    .unwrap();

    let mut acked = false;
    for _ in 0..64 {
        harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();
        harness.proxy_send.borrow_mut().progress(&mut sop).unwrap();
        if !acked && r_gpu.tail() == 2 {
            r_gpu.set_head(2);
            acked = true;
        }
        if sop.completed() && rop.completed() {
            break;
        }
    }
    assert!(sop.completed() && rop.completed());
    // Head and tail came through the device-resident mirror words.
    assert_eq!(s_gpu.head(), 2);
    assert_eq!(r_gpu.tail(), 2);
}

// =============================================================================
// Op queue driver
// =============================================================================

#[test]
fn test_op_queue_drives_to_completion() {
    let mut harness = Harness::new(HarnessConfig::default());
    let graph = TopoGraph { id: 0 };
    let (send_conn, recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let s_gpu = GpuSide::new(send_conn.conn_info.unwrap());
    let r_gpu = GpuSide::new(recv_conn.conn_info.unwrap());

    let nbytes = 64;
    s_gpu.write_buff(Protocol::Simple, 0, &[0x7Eu8; 64]);
    s_gpu.set_size(0, nbytes as i32);
    s_gpu.set_tail(2);

    let mut send_queue = netproxy::OpQueue::new();
    let mut recv_queue = netproxy::OpQueue::new();
    {
        let mut proxy = harness.proxy_send.borrow_mut();
        let op = ProxyOp::new(
            Dir::Send,
            Protocol::Simple,
            2,
            2,
            vec![ProxySub::new(send_conn.proxy.conn, 0, 2, nbytes)],
        )
        .unwrap();
        send_queue.post(&mut proxy, op).unwrap();
    }
    {
        let mut proxy = harness.proxy_recv.borrow_mut();
        let op = ProxyOp::new(
            Dir::Recv,
            Protocol::Simple,
            2,
            2,
            vec![ProxySub::new(recv_conn.proxy.conn, 0, 2, nbytes)],
        )
        .unwrap();
        recv_queue.post(&mut proxy, op).unwrap();
    }

    let mut acked = false;
    for _ in 0..64 {
        recv_queue
            .progress(&mut harness.proxy_recv.borrow_mut())
            .unwrap();
        send_queue
            .progress(&mut harness.proxy_send.borrow_mut())
            .unwrap();
        if !acked && r_gpu.tail() == 2 {
            r_gpu.set_head(2);
            acked = true;
        }
        if send_queue.is_empty() && recv_queue.is_empty() {
            break;
        }
    }
    // Completed ops are retired from the queues.
    assert!(send_queue.is_empty());
    assert!(recv_queue.is_empty());
    assert_eq!(s_gpu.head(), 2);
}

// =============================================================================
// Cross-process (PXN) data path
// =============================================================================

#[test]
fn test_pxn_slice_through_attached_banks() {
    let mut harness = Harness::new(HarnessConfig {
        split_process: true,
        ..Default::default()
    });
    let graph = TopoGraph { id: 0 };
    let (send_conn, recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let s_gpu = GpuSide::new(send_conn.conn_info.unwrap());
    let r_gpu = GpuSide::new(recv_conn.conn_info.unwrap());

    let nbytes = 512;
    let payload: Vec<u8> = (0..nbytes).map(|i| (i * 3) as u8).collect();
    s_gpu.write_buff(Protocol::Simple, 0, &payload);
    s_gpu.set_size(0, nbytes as i32);
    s_gpu.set_tail(2);

    let mut sop = ProxyOp::new(
        Dir::Send,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(send_conn.proxy.conn, 0, 2, nbytes)],
    )
    .unwrap();
    let mut rop = ProxyOp::new(
        Dir::Recv,
        Protocol::Simple,
        2,
        2,
        vec![ProxySub::new(recv_conn.proxy.conn, 0, 2, nbytes)],
    )
    .unwrap();

    // Under PXN both proxy connections live on the receiver's agent.
    let mut acked = false;
    for _ in 0..64 {
        harness.proxy_recv.borrow_mut().progress(&mut rop).unwrap();
        harness.proxy_recv.borrow_mut().progress(&mut sop).unwrap();
        if !acked && r_gpu.tail() == 2 {
            r_gpu.set_head(2);
            acked = true;
        }
        if sop.completed() && rop.completed() {
            break;
        }
    }
    assert!(sop.completed() && rop.completed());
    // Bytes written through the attached mapping came out on the far side.
    assert_eq!(r_gpu.read_buff(Protocol::Simple, 0, nbytes), payload);
    assert_eq!(s_gpu.head(), 2);
}
