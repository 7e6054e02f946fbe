//! Fixed-size record layouts for the shared-memory cache.
//!
//! Layout mirrors the header/index split used by a cache-line-aligned
//! shared-memory message cache: a small fixed header followed by an array
//! of fixed-size slots. Readers and a single writer coordinate through a
//! per-slot generation counter (odd while being written, even once stable),
//! the same odd/even protocol used by a shared-memory IPC ring buffer slot.

use std::sync::atomic::{AtomicU32, AtomicU64};

pub const MCACHE_MAGIC: u32 = 0x4E535344; // "NSSD"
pub const MCACHE_VERSION: u32 = 1;

/// Fits in one cache line.
#[repr(C, align(64))]
pub struct McacheHeader {
    pub magic: u32,
    pub version: u32,
    pub slot_count: u32,
    pub slot_size: u32,
    pub hash_seed: u64,
    pub used_slots: AtomicU32,
    pub update_counter: AtomicU64,
    pub free_list_head: AtomicU32,
    _reserved: [u8; 24],
}

pub const MCACHE_HEADER_SIZE: usize = 64;

/// Slot kind discriminant stored in the slot's `kind` byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Free = 0,
    Passwd = 1,
    Group = 2,
    Initgroups = 3,
}

impl SlotKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Free),
            1 => Some(Self::Passwd),
            2 => Some(Self::Group),
            3 => Some(Self::Initgroups),
            _ => None,
        }
    }
}

/// Per-slot generation counter protocol: the writer bumps `gen` to an odd
/// value before writing the payload, writes, then bumps it to the next
/// even value. A reader samples `gen`, copies the payload, re-samples
/// `gen`, and retries if either sample was odd or the two samples differ.
#[repr(C)]
pub struct SlotHeader {
    pub gen: AtomicU32,
    pub hash: u32,
    pub next: u32,
    pub kind: u8,
    pub flags: u8,
    _reserved: [u8; 2],
}

pub const SLOT_HEADER_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_cache_line_aligned() {
        assert_eq!(std::mem::size_of::<McacheHeader>(), MCACHE_HEADER_SIZE);
    }

    #[test]
    fn slot_header_size_is_fixed() {
        assert_eq!(std::mem::size_of::<SlotHeader>(), SLOT_HEADER_SIZE);
    }

    #[test]
    fn slot_kind_round_trips() {
        for k in [SlotKind::Passwd, SlotKind::Group, SlotKind::Initgroups] {
            assert_eq!(SlotKind::from_u8(k as u8), Some(k));
        }
    }
}
