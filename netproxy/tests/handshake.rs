//! Handshake, bank remapping and teardown tests.

mod common;

use common::{GpuSide, Harness, HarnessConfig, RECEIVER, SENDER};
use fabric::loopback::LoopbackConfig;
use netproxy::rpc::{self, Handshake, MsgKind, SharedInitReq};
use netproxy::state::ProxyConn;
use netproxy::topo::TopoGraph;
use netproxy::{Protocol, STEPS};

// =============================================================================
// Connect-time staging state
// =============================================================================

#[test]
fn test_connect_initializes_credits_shared() {
    let mut harness = Harness::new(HarnessConfig::default());
    // No graph: pooled mode, credits withheld until offsets are staged.
    let (send_conn, _recv_conn) = harness.connect_pair(None, 0, 0);
    let gpu = GpuSide::new(send_conn.conn_info.unwrap());

    assert!(send_conn.shared());
    assert_eq!(gpu.head(), 0u64.wrapping_sub(STEPS));
    for slot in 0..STEPS as usize {
        assert_eq!(gpu.size(slot), -1);
    }
    assert!(!gpu.info.offs_fifo.is_null());
}

#[test]
fn test_connect_initializes_credits_dedicated() {
    let mut harness = Harness::new(HarnessConfig::default());
    let graph = TopoGraph { id: 0 };
    let (send_conn, _recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let gpu = GpuSide::new(send_conn.conn_info.unwrap());

    assert!(!send_conn.shared());
    assert_eq!(gpu.head(), 0);
    for slot in 0..STEPS as usize {
        assert_eq!(gpu.size(slot), -1);
    }
    // Dedicated connections carry no staging offsets.
    assert!(gpu.info.offs_fifo.is_null());
    for p in Protocol::ALL {
        assert!(!gpu.info.buffs[p.index()].is_null());
    }
}

// =============================================================================
// Cross-process bank remapping (round-trip law)
// =============================================================================

#[test]
fn test_cross_process_banks_remap() {
    // The sender's proxy lives on the receiver's rank (PXN) in another
    // process; the host bank must travel through a shm file and be
    // reattached by the compute side.
    let mut harness = Harness::new(HarnessConfig {
        split_process: true,
        ..Default::default()
    });
    let graph = TopoGraph { id: 0 };
    let (send_conn, recv_conn) = harness.connect_pair(Some(&graph), 0, 0);
    let gpu = GpuSide::new(send_conn.conn_info.unwrap());

    // The staging words resolve through the attached mapping.
    assert_eq!(gpu.head(), 0);
    for slot in 0..STEPS as usize {
        assert_eq!(gpu.size(slot), -1);
    }
    gpu.set_size(0, 64);
    assert_eq!(gpu.size(0), 64);
    gpu.set_size(0, -1);

    let dev = harness.dev_send.clone();
    send_conn.free(dev.as_ref()).unwrap();
    recv_conn.free().unwrap();
}

// =============================================================================
// Retry (not-ready) encoding
// =============================================================================

#[test]
fn test_connect_retries_until_fabric_ready() {
    let mut harness = Harness::new(HarnessConfig {
        loopback: LoopbackConfig {
            connect_defer: 2,
            ..Default::default()
        },
        ..Default::default()
    });
    // connect_pair re-drives internally; deferred connects must not
    // surface as errors.
    let (send_conn, _recv_conn) = harness.connect_pair(None, 0, 0);
    assert!(send_conn.conn_info.is_some());
}

#[test]
fn test_setup_size_mismatch_is_internal_error() {
    let harness = Harness::new(HarnessConfig::default());
    let proxy = ProxyConn::connect(&harness.proxy_send, true, SENDER, 0);
    let short = [0u8; 4];
    let result = proxy.call_once(MsgKind::Setup, &short, &mut []);
    assert!(result.is_err());
}

#[test]
fn test_call_once_surfaces_retry() {
    let mut harness = Harness::new(HarnessConfig {
        loopback: LoopbackConfig {
            accept_defer: 1,
            ..Default::default()
        },
        ..Default::default()
    });
    let proxy_recv = harness.proxy_recv.clone();
    let proxy_send_state = harness.proxy_send.clone();
    let mut lookup = move |proxy_rank: i32, send: bool, local_rank: i32| {
        let state = if proxy_rank == SENDER {
            &proxy_send_state
        } else {
            &proxy_recv
        };
        Ok(ProxyConn::connect(state, send, proxy_rank, local_rank))
    };

    let (mut send_conn, send_info) = netproxy::send::SendConnector::setup(
        &harness.comm_send,
        None,
        RECEIVER,
        0,
        0,
        &mut lookup,
    )
    .unwrap();
    let (recv_conn, recv_info) = netproxy::recv::RecvConnector::setup(
        &harness.comm_recv,
        None,
        SENDER,
        0,
        0,
        &mut lookup,
    )
    .unwrap();

    send_conn
        .connect(
            &recv_info,
            harness.dev_send.as_ref(),
            &mut harness.shared_dev_cache,
        )
        .unwrap();

    // First accept is deferred: the proxy answers Retry, not an error.
    let mut req = [0u8; 4];
    req.copy_from_slice(&send_info.0[..4]);
    let mut resp = vec![0u8; std::mem::size_of::<netproxy::map::ConnectMap>()];
    assert_eq!(
        recv_conn
            .proxy
            .call_once(MsgKind::Connect, &req, &mut resp)
            .unwrap(),
        Handshake::Retry
    );
    assert_eq!(
        recv_conn
            .proxy
            .call_once(MsgKind::Connect, &req, &mut resp)
            .unwrap(),
        Handshake::Done
    );
}

// =============================================================================
// Teardown and refcounts (S6)
// =============================================================================

#[test]
fn test_shared_pool_refcount_across_two_sends() {
    let mut harness = Harness::new(HarnessConfig::default());
    let (send_a, recv_a) = harness.connect_pair(None, 0, 0);
    let baseline = harness.dev_send.outstanding();
    let (send_b, recv_b) = harness.connect_pair(None, 1, 0);

    // Tearing down the first send decrements the pool refcount but keeps
    // the staging buffer alive for the second: only the first channel's
    // dedicated sendMem/recvMem bank is released.
    send_a.proxy.close().unwrap();
    assert_eq!(harness.dev_send.outstanding(), baseline);

    send_b.proxy.close().unwrap();
    recv_a.proxy.close().unwrap();
    recv_b.proxy.close().unwrap();

    // Every staging allocation on both proxies is gone.
    assert_eq!(harness.dev_send.outstanding(), 0);
    assert_eq!(harness.dev_recv.outstanding(), 0);
    assert_eq!(harness.net.outstanding_mrs(), 0);
}

#[test]
fn test_shared_preconnect_init_and_teardown() {
    let harness = Harness::new(HarnessConfig::default());
    let proxy = ProxyConn::connect(&harness.proxy_send, true, SENDER, 1);

    let req = SharedInitReq { n_channels: 2 };
    let mut req_buf = [0u8; std::mem::size_of::<SharedInitReq>()];
    rpc::encode(&req, &mut req_buf).unwrap();
    proxy.call(MsgKind::SharedInit, &req_buf, &mut []).unwrap();
    // The pool entry was taken eagerly, before any fabric connection.
    assert_eq!(harness.dev_send.outstanding(), 1);

    proxy.close().unwrap();
    assert_eq!(harness.dev_send.outstanding(), 0);
}

#[test]
fn test_dedicated_teardown_releases_everything() {
    let mut harness = Harness::new(HarnessConfig::default());
    let graph = TopoGraph { id: 0 };
    let (send_conn, recv_conn) = harness.connect_pair(Some(&graph), 0, 0);

    send_conn.proxy.close().unwrap();
    recv_conn.proxy.close().unwrap();
    assert_eq!(harness.dev_send.outstanding(), 0);
    assert_eq!(harness.dev_recv.outstanding(), 0);
    assert_eq!(harness.net.outstanding_mrs(), 0);
}
