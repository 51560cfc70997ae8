//! Topology queries consumed by the compute-side setup path.
//!
//! Routing itself is out of scope; the proxy only asks which NIC to use
//! for a peer, whether the NIC can DMA device memory directly, and how
//! ranks map onto the local node.

use crate::error::{Error, Result};

/// Opaque token for a routing graph that pinned this connection. Graph
/// connections never use the shared staging pool.
#[derive(Debug, Clone, Copy)]
pub struct TopoGraph {
    pub id: i32,
}

pub trait Topology {
    /// NIC and proxy rank to use for traffic from `rank` to `peer_rank`.
    /// The proxy rank differs from `rank` only when the sender borrows a
    /// better-placed rank's NIC.
    fn get_net_dev(
        &self,
        rank: i32,
        graph: Option<&TopoGraph>,
        channel_id: i32,
        peer_rank: i32,
    ) -> Result<(usize, i32)>;

    /// Whether the NIC may DMA device memory directly (`write` selects the
    /// send or recv direction).
    fn check_gdr(&self, bus_id: i64, net_dev: usize, write: bool) -> Result<bool>;

    /// Whether direct-DMA receives need an explicit flush on this bus.
    fn need_flush(&self, bus_id: i64) -> Result<bool>;

    /// Whether two same-host peers may use the NET transport at all.
    fn check_net(&self, bus_id1: i64, bus_id2: i64) -> Result<bool>;

    fn get_local_rank(&self, rank: i32) -> Result<i32>;
}

/// Table-driven topology for tests and single-node bring-up: one NIC,
/// every rank its own proxy, uniform GDR/flush capabilities.
#[derive(Debug, Clone)]
pub struct StaticTopo {
    pub net_dev: usize,
    pub use_gdr: bool,
    pub need_flush: bool,
    /// Route sends through the peer's NIC (and proxy agent).
    pub pxn: bool,
    /// `local_rank[rank]` for every rank on this node.
    pub local_ranks: Vec<i32>,
}

impl StaticTopo {
    /// All `n_ranks` ranks on one node, local rank == rank.
    pub fn single_node(n_ranks: i32) -> Self {
        StaticTopo {
            net_dev: 0,
            use_gdr: false,
            need_flush: false,
            pxn: false,
            local_ranks: (0..n_ranks).collect(),
        }
    }
}

impl Topology for StaticTopo {
    fn get_net_dev(
        &self,
        rank: i32,
        _graph: Option<&TopoGraph>,
        _channel_id: i32,
        peer_rank: i32,
    ) -> Result<(usize, i32)> {
        let proxy_rank = if self.pxn { peer_rank } else { rank };
        Ok((self.net_dev, proxy_rank))
    }

    fn check_gdr(&self, _bus_id: i64, _net_dev: usize, _write: bool) -> Result<bool> {
        Ok(self.use_gdr)
    }

    fn need_flush(&self, _bus_id: i64) -> Result<bool> {
        Ok(self.need_flush)
    }

    fn check_net(&self, _bus_id1: i64, _bus_id2: i64) -> Result<bool> {
        Ok(true)
    }

    fn get_local_rank(&self, rank: i32) -> Result<i32> {
        self.local_ranks
            .get(rank as usize)
            .copied()
            .ok_or(Error::Internal("rank outside the local rank table"))
    }
}
