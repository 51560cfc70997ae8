//! The bank map: a compact, serializable layout descriptor for the five
//! staging banks of one connection.
//!
//! The proxy side of `connect` builds the map, allocates the banks, and
//! ships the whole struct to the compute side, which remaps host banks
//! and opens device IPC handles before any pointer in it is valid.
//!
//! Slot positions are bit-packed 32-bit words:
//!
//! | bits  | meaning                              |
//! |-------|--------------------------------------|
//! | 31    | slot is present                      |
//! | 30    | slot aliases the shared pool         |
//! | 29    | slot lives in device memory          |
//! | 28..0 | byte offset within the selected bank |
//!
//! The top three bits select the bank; all three zero is the NULL
//! sentinel. The wire layout is fixed; everything else goes through the
//! typed accessors below.

use std::ptr;

use crate::dev::IpcHandle;
use crate::error::{Error, Result};
use crate::mem::{RecvMem, SendMem};
use crate::proto::{Protocol, NUM_PROTOCOLS};
use crate::rpc::Wire;

/// Number of memory banks.
pub const BANKS: usize = 5;

/// Maximum shm name length carried in a bank record.
pub const SHM_NAME_BYTES: usize = 64;

/// The five staging banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Host = 0,
    Dev = 1,
    SharedHost = 2,
    SharedDev = 3,
    /// GDR-copy mirror of the head/tail word.
    Gdc = 4,
}

const MASK_USED: u32 = 0x8000_0000;
const MASK_SHARED: u32 = 0x4000_0000;
const MASK_DEVMEM: u32 = 0x2000_0000;
const MASK_OFFSET: u32 = 0x1fff_ffff;

/// Bit-packed slot position. See the module docs for the wire layout.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSlot(u32);

impl OffsetSlot {
    pub const UNSET: OffsetSlot = OffsetSlot(0);

    pub fn new(shared: bool, dev: bool, offset: u32) -> Self {
        debug_assert!(offset <= MASK_OFFSET);
        let mut word = MASK_USED | (offset & MASK_OFFSET);
        if shared {
            word |= MASK_SHARED;
        }
        if dev {
            word |= MASK_DEVMEM;
        }
        OffsetSlot(word)
    }

    #[inline]
    pub fn is_set(self) -> bool {
        self.0 >> 29 != 0
    }

    #[inline]
    pub fn shared(self) -> bool {
        self.0 & MASK_SHARED != 0
    }

    #[inline]
    pub fn dev_mem(self) -> bool {
        self.0 & MASK_DEVMEM != 0
    }

    #[inline]
    pub fn offset(self) -> u32 {
        self.0 & MASK_OFFSET
    }

    /// Bank selected by the top bits. Only meaningful when set.
    #[inline]
    pub fn bank(self) -> Bank {
        match (self.shared(), self.dev_mem()) {
            (false, false) => Bank::Host,
            (false, true) => Bank::Dev,
            (true, false) => Bank::SharedHost,
            (true, true) => Bank::SharedDev,
        }
    }
}

/// How a cross-process bank is reopened on the other side.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub enum MemIdentity {
    None,
    /// Host bank backed by a shared-memory file.
    Shm(ShmName),
    /// Device bank exported through an IPC handle.
    Ipc(IpcHandle),
}

/// Fixed-size shm name, stored inline so the map stays wire-stable.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ShmName {
    len: u8,
    bytes: [u8; SHM_NAME_BYTES],
}

impl ShmName {
    pub fn new(name: &str) -> Result<Self> {
        let raw = name.as_bytes();
        if raw.len() > SHM_NAME_BYTES {
            return Err(Error::Internal("shm name too long for bank record"));
        }
        let mut bytes = [0u8; SHM_NAME_BYTES];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(ShmName {
            len: raw.len() as u8,
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl std::fmt::Debug for ShmName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmName({})", self.as_str())
    }
}

/// One bank record. Pointers are addresses in the *producing* process
/// until the receiving side remaps the bank.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MapMem {
    pub size: u32,
    pub cpu_ptr: usize,
    pub dev_ptr: usize,
    pub identity: MemIdentity,
}

impl MapMem {
    const UNSET: MapMem = MapMem {
        size: 0,
        cpu_ptr: 0,
        dev_ptr: 0,
        identity: MemIdentity::None,
    };

    #[inline]
    pub fn cpu(&self) -> *mut u8 {
        self.cpu_ptr as *mut u8
    }

    #[inline]
    pub fn dev(&self) -> *mut u8 {
        self.dev_ptr as *mut u8
    }
}

/// Named slots within the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotName {
    SendMem,
    RecvMem,
    Buff(Protocol),
}

/// Which address space to resolve a slot in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Cpu,
    Dev,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Offsets {
    send_mem: OffsetSlot,
    recv_mem: OffsetSlot,
    buffs: [OffsetSlot; NUM_PROTOCOLS],
}

/// The serializable bank map.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConnectMap {
    pub same_process: bool,
    pub shared: bool,
    /// Accelerator device index of the proxy owner.
    pub dev_id: i32,
    mems: [MapMem; BANKS],
    offsets: Offsets,
}

unsafe impl Wire for ConnectMap {}

impl ConnectMap {
    pub fn new(same_process: bool, shared: bool, dev_id: i32) -> Self {
        ConnectMap {
            same_process,
            shared,
            dev_id,
            mems: [MapMem::UNSET; BANKS],
            offsets: Offsets {
                send_mem: OffsetSlot::UNSET,
                recv_mem: OffsetSlot::UNSET,
                buffs: [OffsetSlot::UNSET; NUM_PROTOCOLS],
            },
        }
    }

    fn slot(&self, name: SlotName) -> OffsetSlot {
        match name {
            SlotName::SendMem => self.offsets.send_mem,
            SlotName::RecvMem => self.offsets.recv_mem,
            SlotName::Buff(p) => self.offsets.buffs[p.index()],
        }
    }

    fn slot_mut(&mut self, name: SlotName) -> &mut OffsetSlot {
        match name {
            SlotName::SendMem => &mut self.offsets.send_mem,
            SlotName::RecvMem => &mut self.offsets.recv_mem,
            SlotName::Buff(p) => &mut self.offsets.buffs[p.index()],
        }
    }

    /// Append a slot. Non-shared slots claim the next `size` bytes of the
    /// host or device bank; shared slots alias the whole externally-owned
    /// shared bank at offset zero.
    pub fn add_slot(&mut self, name: SlotName, shared: bool, dev: bool, size: u32) {
        if !shared {
            let bank = if dev { Bank::Dev } else { Bank::Host };
            let offset = self.mems[bank as usize].size;
            *self.slot_mut(name) = OffsetSlot::new(false, dev, offset);
            self.mems[bank as usize].size += size;
        } else {
            *self.slot_mut(name) = OffsetSlot::new(true, dev, 0);
        }
    }

    /// Resolve a slot in the given address space. Null when the slot is
    /// unset or the bank has no mapping on this side.
    pub fn pointer(&self, view: View, name: SlotName) -> *mut u8 {
        let slot = self.slot(name);
        if !slot.is_set() {
            return ptr::null_mut();
        }
        let mem = &self.mems[slot.bank() as usize];
        let base = match view {
            View::Cpu => mem.cpu_ptr,
            View::Dev => mem.dev_ptr,
        };
        if base == 0 {
            return ptr::null_mut();
        }
        (base + slot.offset() as usize) as *mut u8
    }

    pub fn dev_mem(&self, name: SlotName) -> bool {
        self.slot(name).dev_mem()
    }

    pub fn is_set(&self, name: SlotName) -> bool {
        self.slot(name).is_set()
    }

    pub fn mem(&self, bank: Bank) -> &MapMem {
        &self.mems[bank as usize]
    }

    pub fn mem_mut(&mut self, bank: Bank) -> &mut MapMem {
        &mut self.mems[bank as usize]
    }

    pub fn send_mem_ptr(&self, view: View) -> *mut SendMem {
        self.pointer(view, SlotName::SendMem) as *mut SendMem
    }

    pub fn recv_mem_ptr(&self, view: View) -> *mut RecvMem {
        self.pointer(view, SlotName::RecvMem) as *mut RecvMem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc;

    #[test]
    fn test_offsets_are_disjoint_and_sizes_sum() {
        let mut map = ConnectMap::new(true, false, 0);
        map.add_slot(SlotName::Buff(Protocol::Ll), false, false, 1024);
        map.add_slot(SlotName::Buff(Protocol::Simple), false, true, 4096);
        map.add_slot(SlotName::SendMem, false, false, 64);
        map.add_slot(SlotName::RecvMem, false, false, 128);

        // Host bank: LL at 0, sendMem at 1024, recvMem at 1088.
        assert_eq!(map.slot(SlotName::Buff(Protocol::Ll)).offset(), 0);
        assert_eq!(map.slot(SlotName::SendMem).offset(), 1024);
        assert_eq!(map.slot(SlotName::RecvMem).offset(), 1024 + 64);
        assert_eq!(map.mem(Bank::Host).size, 1024 + 64 + 128);

        // Device bank: simple at 0.
        assert_eq!(map.slot(SlotName::Buff(Protocol::Simple)).offset(), 0);
        assert_eq!(map.mem(Bank::Dev).size, 4096);
        assert!(map.dev_mem(SlotName::Buff(Protocol::Simple)));
        assert!(!map.dev_mem(SlotName::Buff(Protocol::Ll)));
    }

    #[test]
    fn test_shared_slot_aliases_whole_bank() {
        let mut map = ConnectMap::new(true, true, 0);
        map.add_slot(SlotName::Buff(Protocol::Simple), true, true, 1 << 20);
        let slot = map.slot(SlotName::Buff(Protocol::Simple));
        assert_eq!(slot.offset(), 0);
        assert_eq!(slot.bank(), Bank::SharedDev);
        assert!(slot.dev_mem());
        // The bank size comes from the pool record, not from summation.
        assert_eq!(map.mem(Bank::SharedDev).size, 0);
    }

    #[test]
    fn test_null_sentinel_and_pointer_resolution() {
        let mut map = ConnectMap::new(true, false, 0);
        assert!(map.pointer(View::Cpu, SlotName::SendMem).is_null());
        assert!(!map.is_set(SlotName::SendMem));

        map.add_slot(SlotName::SendMem, false, false, 64);
        // Bank not mapped yet: still null.
        assert!(map.pointer(View::Cpu, SlotName::SendMem).is_null());

        map.mem_mut(Bank::Host).cpu_ptr = 0x1000;
        assert_eq!(map.pointer(View::Cpu, SlotName::SendMem) as usize, 0x1000);
        assert!(map.pointer(View::Dev, SlotName::SendMem).is_null());
    }

    #[test]
    fn test_devmem_bit_matches_bank() {
        for (shared, dev) in [(false, false), (false, true), (true, false), (true, true)] {
            let slot = OffsetSlot::new(shared, dev, 17);
            assert_eq!(slot.dev_mem(), matches!(slot.bank(), Bank::Dev | Bank::SharedDev));
            assert_eq!(slot.offset(), 17);
            assert!(slot.is_set());
        }
    }

    #[test]
    fn test_map_crosses_a_byte_channel() {
        let mut map = ConnectMap::new(false, false, 2);
        map.add_slot(SlotName::Buff(Protocol::Simple), false, true, 1 << 16);
        map.add_slot(SlotName::SendMem, false, false, 64);
        map.mem_mut(Bank::Host).identity = MemIdentity::Shm(ShmName::new("/x-abc").unwrap());

        let mut bytes = vec![0u8; std::mem::size_of::<ConnectMap>()];
        rpc::encode(&map, &mut bytes).unwrap();
        let back: ConnectMap = rpc::decode(&bytes).unwrap();

        assert!(!back.same_process);
        assert_eq!(back.dev_id, 2);
        assert_eq!(back.mem(Bank::Dev).size, 1 << 16);
        assert_eq!(back.slot(SlotName::SendMem).offset(), 0);
        match back.mem(Bank::Host).identity {
            MemIdentity::Shm(name) => assert_eq!(name.as_str(), "/x-abc"),
            _ => panic!("host identity lost in transit"),
        }
    }
}
