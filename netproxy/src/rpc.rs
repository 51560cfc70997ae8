//! Proxy channel message payloads.
//!
//! Every message kind carries a fixed-size payload; both ends validate the
//! exact byte count before interpreting it. Payload types are `#[repr(C)]`
//! + `Copy` and cross the channel as raw bytes.

use std::mem::size_of;

use crate::error::{Error, Result};

/// Marker trait for types safely transmittable through the proxy channel.
///
/// # Safety
/// Types must be `Copy` with a stable `#[repr(C)]` layout and remain
/// meaningful when read back in another process (pointers are only valid
/// after the receiving side remaps the underlying banks).
pub unsafe trait Wire: Copy {}

unsafe impl Wire for i32 {}
unsafe impl Wire for fabric::Handle {}

/// Decode an exact-size request payload.
pub fn decode<T: Wire>(buf: &[u8]) -> Result<T> {
    if buf.len() != size_of::<T>() {
        return Err(Error::Internal("proxy message request size mismatch"));
    }
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr().cast()) })
}

/// Encode an exact-size response payload.
pub fn encode<T: Wire>(value: &T, buf: &mut [u8]) -> Result<()> {
    if buf.len() != size_of::<T>() {
        return Err(Error::Internal("proxy message response size mismatch"));
    }
    unsafe {
        std::ptr::copy_nonoverlapping(
            (value as *const T).cast::<u8>(),
            buf.as_mut_ptr(),
            size_of::<T>(),
        );
    }
    Ok(())
}

/// Proxy channel message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Pre-connect shared pool initialization.
    SharedInit,
    Setup,
    Connect,
}

/// Outcome of one handshake drive: `Retry` encodes the "not ready yet,
/// re-drive with the same payload" answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Done,
    Retry,
}

/// Setup request, sent by the compute side of both directions.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SetupReq {
    pub rank: i32,
    pub local_rank: i32,
    pub remote_rank: i32,
    pub shared: i32,
    pub net_dev: i32,
    pub use_gdr: i32,
    pub need_flush: i32,
    pub channel_id: i32,
    pub conn_index: i32,
}

unsafe impl Wire for SetupReq {}

/// Shared pool pre-connect request.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SharedInitReq {
    pub n_channels: i32,
}

unsafe impl Wire for SharedInitReq {}
