//! Environment parameters, read once and cached for the process lifetime.

use std::sync::OnceLock;

fn param_i64(cell: &OnceLock<i64>, name: &str, default: i64) -> i64 {
    *cell.get_or_init(|| {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    })
}

/// Force shared-pool staging on (1) or off (0); -2 means "shared unless a
/// routing graph pinned the connection".
pub fn net_shared_buffers() -> i64 {
    static CELL: OnceLock<i64> = OnceLock::new();
    param_i64(&CELL, "NET_SHARED_BUFFERS", -2)
}

/// Allow multiplexing several peers over one fabric communicator when the
/// provider supports fused receives.
pub fn net_shared_comms() -> bool {
    static CELL: OnceLock<i64> = OnceLock::new();
    param_i64(&CELL, "NET_SHARED_COMMS", 1) != 0
}

/// Locate the proxy head/tail word in device memory accessed via GDR-copy.
pub fn gdrcopy_sync_enable() -> bool {
    static CELL: OnceLock<i64> = OnceLock::new();
    param_i64(&CELL, "GDRCOPY_SYNC_ENABLE", 1) != 0
}

/// Flush received device data with an inline PCIe read instead of the
/// provider's `iflush`.
pub fn gdrcopy_flush_enable() -> bool {
    static CELL: OnceLock<i64> = OnceLock::new();
    param_i64(&CELL, "GDRCOPY_FLUSH_ENABLE", 0) != 0
}
