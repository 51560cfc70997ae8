//! The staging-region contract shared with the compute engine.
//!
//! `SendMem` and `RecvMem` live in a bank both sides can address. The
//! compute engine and the proxy never lock; every cross-side word is read
//! and written volatile, and publications of `head`/`tail` are preceded by
//! a full fence. When the published word lives in write-combined memory an
//! additional store fence flushes the WC buffer.

use std::ptr::{read_volatile, write_volatile};
use std::sync::atomic::{fence, Ordering};

use crate::STEPS;

/// Producer credit word, written by the proxy on send connections and by
/// the compute engine on recv connections.
#[repr(C)]
pub struct SendMem {
    pub head: u64,
    _pad: [u8; 56],
}

/// Consumer region: tail word plus the per-slot size and offset fifos.
#[repr(C)]
pub struct RecvMem {
    pub tail: u64,
    _pad: [u8; 56],
    pub sizes_fifo: [i32; STEPS as usize],
    pub offs_fifo: [i32; STEPS as usize],
}

/// Volatile view of a `SendMem` region.
///
/// Construction asserts the invariant that `ptr` stays valid and mapped for
/// the wrapper's lifetime; accessors are then safe to call.
#[derive(Clone, Copy)]
pub struct SendMemPtr(*mut SendMem);

impl SendMemPtr {
    /// # Safety
    /// `ptr` must point to a mapped `SendMem` that outlives the wrapper and
    /// is shared only with the single compute-side consumer.
    pub unsafe fn new(ptr: *mut SendMem) -> Self {
        debug_assert!(!ptr.is_null());
        SendMemPtr(ptr)
    }

    #[inline]
    pub fn head(&self) -> u64 {
        unsafe { read_volatile(std::ptr::addr_of!((*self.0).head)) }
    }

    #[inline]
    pub fn set_head(&self, head: u64) {
        unsafe { write_volatile(std::ptr::addr_of_mut!((*self.0).head), head) }
    }
}

/// Volatile view of a `RecvMem` region.
#[derive(Clone, Copy)]
pub struct RecvMemPtr(*mut RecvMem);

impl RecvMemPtr {
    /// # Safety
    /// `ptr` must point to a mapped `RecvMem` that outlives the wrapper and
    /// is shared only with the single compute-side producer.
    pub unsafe fn new(ptr: *mut RecvMem) -> Self {
        debug_assert!(!ptr.is_null());
        RecvMemPtr(ptr)
    }

    #[inline]
    pub fn tail(&self) -> u64 {
        unsafe { read_volatile(std::ptr::addr_of!((*self.0).tail)) }
    }

    #[inline]
    pub fn set_tail(&self, tail: u64) {
        unsafe { write_volatile(std::ptr::addr_of_mut!((*self.0).tail), tail) }
    }

    #[inline]
    pub fn size(&self, slot: usize) -> i32 {
        unsafe { read_volatile(std::ptr::addr_of!((*self.0).sizes_fifo[slot])) }
    }

    #[inline]
    pub fn set_size(&self, slot: usize, size: i32) {
        unsafe { write_volatile(std::ptr::addr_of_mut!((*self.0).sizes_fifo[slot]), size) }
    }

    #[inline]
    pub fn off(&self, slot: usize) -> i32 {
        unsafe { read_volatile(std::ptr::addr_of!((*self.0).offs_fifo[slot])) }
    }

    #[inline]
    pub fn set_off(&self, slot: usize, off: i32) {
        unsafe { write_volatile(std::ptr::addr_of_mut!((*self.0).offs_fifo[slot]), off) }
    }
}

/// Full memory barrier ordering staged payload/fifo writes before a
/// head/tail publication.
#[inline]
pub fn full_fence() {
    fence(Ordering::SeqCst);
}

/// Flush write-combined stores after publishing into a GDR-copy mirror.
#[inline]
pub fn wc_store_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_sfence()
    }
    #[cfg(not(target_arch = "x86_64"))]
    fence(Ordering::SeqCst);
}
