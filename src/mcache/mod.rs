//! Shared-memory lookup cache (Component C).
//!
//! A fixed-size memory-mapped hash table read directly by client libraries.
//! The responder is the sole writer; clients only ever read. Staleness is
//! not tracked here: the persistent cache's `cache_expire` is authoritative,
//! and slots are invalidated explicitly by the responder's periodic
//! `update_pw_memcache`/`update_gr_memcache` scans.
//!
//! Collisions are resolved by coalesced hashing: every slot index is the
//! home bucket for whichever hashes reduce to it, and a chain of slots
//! (linked through each slot's `next`) extends a bucket past its home slot
//! when two keys collide. Chain-extension slots are drawn from a singly
//! linked free list (`McacheHeader.free_list_head`/`SlotHeader.next`
//! double as the free-list links when a slot isn't part of a live chain);
//! once the free list is exhausted, the least-recently-used *interior*
//! slot is evicted and spliced into its new chain instead. A home slot is
//! never handed out this way: invalidating it only clears its occupied
//! state in place, since other slots may still be chained through it.

pub mod slot;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

use crate::error::{ResponderError, Result};
use slot::{MCACHE_HEADER_SIZE, MCACHE_MAGIC, MCACHE_VERSION, SLOT_HEADER_SIZE, SlotKind};

/// On-disk/in-memory sentinel for "no next slot", since the wire format's
/// `next` field is a plain `u32` rather than an `Option<u32>`.
const NONE_NEXT: u32 = u32::MAX;

/// Byte offset of `McacheHeader.free_list_head` (magic, version, slot_count,
/// slot_size, hash_seed, used_slots, update_counter each contribute their
/// field width ahead of it).
const FREE_LIST_HEAD_OFFSET: usize = 36;

/// Byte offset of `SlotHeader.next` within a slot (past `gen` and `hash`).
const SLOT_NEXT_OFFSET: usize = 8;

#[derive(Debug, Clone)]
pub enum McacheKey {
    PasswdName(String),
    PasswdUid(u32),
    GroupName(String),
    GroupGid(u32),
    Initgroups(String),
}

impl McacheKey {
    fn hash_value(&self) -> u64 {
        let mut hasher = FxHasher::default();
        match self {
            McacheKey::PasswdName(n) => (0u8, n).hash(&mut hasher),
            McacheKey::PasswdUid(u) => (1u8, u).hash(&mut hasher),
            McacheKey::GroupName(n) => (2u8, n).hash(&mut hasher),
            McacheKey::GroupGid(g) => (3u8, g).hash(&mut hasher),
            McacheKey::Initgroups(n) => (4u8, n).hash(&mut hasher),
        }
        hasher.finish()
    }

    fn kind(&self) -> SlotKind {
        match self {
            McacheKey::PasswdName(_) | McacheKey::PasswdUid(_) => SlotKind::Passwd,
            McacheKey::GroupName(_) | McacheKey::GroupGid(_) => SlotKind::Group,
            McacheKey::Initgroups(_) => SlotKind::Initgroups,
        }
    }
}

/// One payload slot's metadata tracked alongside the raw mmap: occupancy
/// and hash for lookups, `use_counter` for LRU eviction, `next` mirroring
/// the on-disk hash-chain/free-list link.
struct SlotMeta {
    use_counter: u64,
    occupied: bool,
    hash: u64,
    next: Option<u32>,
}

/// In-memory mirror of the table's chain/free-list topology. Kept behind
/// one lock so a chain walk never observes another writer's half-applied
/// splice.
struct McacheState {
    slots: Vec<SlotMeta>,
    free_head: Option<u32>,
}

fn offset_of(slot_size: u32, index: u32) -> usize {
    MCACHE_HEADER_SIZE + index as usize * (SLOT_HEADER_SIZE + slot_size as usize)
}

/// Owns the mapped region plus the bookkeeping needed to find, write, and
/// evict slots. Single-writer; concurrent readers are expected to be a
/// separate process mapping the same file read-only, so all mutation here
/// goes through the generation-counter protocol even though there is only
/// one writer in this process.
pub struct Mcache {
    mmap: Mutex<MmapMut>,
    slot_count: u32,
    slot_size: u32,
    state: Mutex<McacheState>,
    clock: AtomicU64,
    pub invalidations: AtomicU64,
    pub stores: AtomicU64,
}

impl Mcache {
    pub fn create(path: &Path, slot_count: u32, slot_size: u32) -> Result<Self> {
        let total = MCACHE_HEADER_SIZE + slot_count as usize * (SLOT_HEADER_SIZE + slot_size as usize);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(total as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let free_head = if slot_count > 0 { Some(0) } else { None };
        write_header(&mut mmap, slot_count, slot_size, free_head);

        let mut slots = Vec::with_capacity(slot_count as usize);
        for i in 0..slot_count {
            let next = if i + 1 < slot_count { Some(i + 1) } else { None };
            let off = offset_of(slot_size, i) + SLOT_NEXT_OFFSET;
            mmap[off..off + 4].copy_from_slice(&next.unwrap_or(NONE_NEXT).to_le_bytes());
            slots.push(SlotMeta {
                use_counter: 0,
                occupied: false,
                hash: 0,
                next,
            });
        }

        Ok(Self {
            mmap: Mutex::new(mmap),
            slot_count,
            slot_size,
            state: Mutex::new(McacheState { slots, free_head }),
            clock: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        })
    }

    fn slot_offset(&self, index: u32) -> usize {
        offset_of(self.slot_size, index)
    }

    fn slot_for_hash(&self, hash: u64) -> u32 {
        (hash % self.slot_count as u64) as u32
    }

    fn write_next(&self, index: u32, next: Option<u32>) {
        let mut mmap = self.mmap.lock();
        let off = self.slot_offset(index) + SLOT_NEXT_OFFSET;
        mmap[off..off + 4].copy_from_slice(&next.unwrap_or(NONE_NEXT).to_le_bytes());
    }

    fn write_free_head(&self, head: Option<u32>) {
        let mut mmap = self.mmap.lock();
        mmap[FREE_LIST_HEAD_OFFSET..FREE_LIST_HEAD_OFFSET + 4]
            .copy_from_slice(&head.unwrap_or(NONE_NEXT).to_le_bytes());
    }

    /// Finds the slot that should hold `hash`, walking the chain from its
    /// home bucket: an unoccupied slot or one already holding `hash` is
    /// claimed in place; otherwise the chain is extended by one slot.
    fn claim_slot_for_hash(&self, state: &mut McacheState, home: u32, hash: u64, tick: u64) -> Result<u32> {
        let mut idx = home;
        loop {
            let slot = &state.slots[idx as usize];
            if !slot.occupied || slot.hash == hash {
                break;
            }
            match slot.next {
                Some(n) => idx = n,
                None => {
                    let new_idx = self.allocate_slot(state)?;
                    state.slots[idx as usize].next = Some(new_idx);
                    self.write_next(idx, Some(new_idx));
                    idx = new_idx;
                    break;
                }
            }
        }
        let slot = &mut state.slots[idx as usize];
        slot.occupied = true;
        slot.hash = hash;
        slot.use_counter = tick;
        Ok(idx)
    }

    /// Pops a slot off the free list, or evicts the least-recently-used
    /// interior (non-home) occupied slot once the free list runs dry. Home
    /// slots are never evicted this way: they anchor their bucket's chain.
    fn allocate_slot(&self, state: &mut McacheState) -> Result<u32> {
        if let Some(free_idx) = state.free_head {
            let next_free = state.slots[free_idx as usize].next;
            state.free_head = next_free;
            state.slots[free_idx as usize].next = None;
            self.write_next(free_idx, None);
            self.write_free_head(next_free);
            return Ok(free_idx);
        }

        let victim = state
            .slots
            .iter()
            .enumerate()
            .filter(|(i, s)| s.occupied && self.slot_for_hash(s.hash) != *i as u32)
            .min_by_key(|(_, s)| s.use_counter)
            .map(|(i, _)| i as u32)
            .ok_or(ResponderError::OutOfMemory)?;

        self.splice_out(state, victim);
        state.slots[victim as usize].occupied = false;
        state.slots[victim as usize].next = None;
        self.write_next(victim, None);
        Ok(victim)
    }

    /// Removes `victim` from the chain it's reachable in, found by walking
    /// from its own home bucket. `victim` must not itself be a home slot.
    fn splice_out(&self, state: &mut McacheState, victim: u32) {
        let home = self.slot_for_hash(state.slots[victim as usize].hash);
        let mut idx = home;
        loop {
            match state.slots[idx as usize].next {
                Some(n) if n == victim => {
                    let after = state.slots[victim as usize].next;
                    state.slots[idx as usize].next = after;
                    self.write_next(idx, after);
                    return;
                }
                Some(n) => idx = n,
                None => return,
            }
        }
    }

    fn write_slot(&self, index: u32, hash: u64, kind: SlotKind, payload: &[u8]) {
        let mut mmap = self.mmap.lock();
        let off = self.slot_offset(index);
        unsafe {
            let gen = &*(mmap.as_mut_ptr().add(off) as *const AtomicU32);
            let cur = gen.load(Ordering::Acquire);
            gen.store(cur.wrapping_add(1) | 1, Ordering::Release);
        }

        let body_off = off + SLOT_HEADER_SIZE;
        mmap[body_off..body_off + payload.len()].copy_from_slice(payload);
        for b in mmap[body_off + payload.len()..body_off + self.slot_size as usize].iter_mut() {
            *b = 0;
        }

        let hash_off = off + 4;
        mmap[hash_off..hash_off + 4].copy_from_slice(&(hash as u32).to_le_bytes());
        let kind_off = off + 12;
        mmap[kind_off] = kind as u8;

        unsafe {
            let gen = &*(mmap.as_ptr().add(off) as *const AtomicU32);
            let cur = gen.load(Ordering::Acquire);
            gen.store(cur.wrapping_add(1), Ordering::Release);
        }
    }

    /// Writes `payload` into the slot for `key`, bumping the generation
    /// counter odd-before/even-after so concurrent readers never observe a
    /// torn write. Extends the key's hash chain rather than clobbering an
    /// unrelated occupant on collision.
    pub fn store(&self, key: &McacheKey, payload: &[u8]) -> Result<()> {
        if payload.len() > self.slot_size as usize {
            return Err(ResponderError::OutOfMemory);
        }
        let hash = key.hash_value();
        let home = self.slot_for_hash(hash);
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        let index = {
            let mut state = self.state.lock();
            self.claim_slot_for_hash(&mut state, home, hash, tick)?
        };

        self.write_slot(index, hash, key.kind(), payload);
        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Clears the slot's occupied bit and kind so readers skip it. A home
    /// slot is freed in place, preserving `next` so the rest of its chain
    /// stays reachable; an interior slot is spliced out of its chain and
    /// returned to the free list. Does not zero the payload bytes, only the
    /// `kind` byte matters for readers.
    pub fn invalidate(&self, key: &McacheKey) {
        let hash = key.hash_value();
        let home = self.slot_for_hash(hash);

        let victim = {
            let mut state = self.state.lock();
            let mut idx = home;
            let mut predecessor = None;
            let found = loop {
                if state.slots[idx as usize].occupied && state.slots[idx as usize].hash == hash {
                    break Some(idx);
                }
                match state.slots[idx as usize].next {
                    Some(n) => {
                        predecessor = Some(idx);
                        idx = n;
                    }
                    None => break None,
                }
            };
            let Some(victim) = found else {
                return;
            };

            state.slots[victim as usize].occupied = false;
            if let Some(pred) = predecessor {
                let after = state.slots[victim as usize].next;
                state.slots[pred as usize].next = after;
                self.write_next(pred, after);

                state.slots[victim as usize].next = state.free_head;
                self.write_next(victim, state.free_head);
                state.free_head = Some(victim);
                self.write_free_head(Some(victim));
            }
            victim
        };

        let mut mmap = self.mmap.lock();
        let off = self.slot_offset(victim);
        unsafe {
            let gen = &*(mmap.as_mut_ptr().add(off) as *const AtomicU32);
            let cur = gen.load(Ordering::Acquire);
            gen.store(cur.wrapping_add(1) | 1, Ordering::Release);
        }
        let kind_off = off + 12;
        mmap[kind_off] = SlotKind::Free as u8;
        unsafe {
            let gen = &*(mmap.as_ptr().add(off) as *const AtomicU32);
            let cur = gen.load(Ordering::Acquire);
            gen.store(cur.wrapping_add(1), Ordering::Release);
        }
        drop(mmap);

        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate_by_name(&self, name: &str, kind: SlotKind) {
        match kind {
            SlotKind::Passwd => self.invalidate(&McacheKey::PasswdName(name.to_string())),
            SlotKind::Group => self.invalidate(&McacheKey::GroupName(name.to_string())),
            _ => {}
        }
    }

    pub fn invalidate_by_uid(&self, uid: u32) {
        self.invalidate(&McacheKey::PasswdUid(uid));
    }

    pub fn invalidate_by_gid(&self, gid: u32) {
        self.invalidate(&McacheKey::GroupGid(gid));
    }

    pub fn occupied_slots(&self) -> usize {
        self.state.lock().slots.iter().filter(|m| m.occupied).count()
    }
}

fn write_header(mmap: &mut MmapMut, slot_count: u32, slot_size: u32, free_list_head: Option<u32>) {
    mmap[0..4].copy_from_slice(&MCACHE_MAGIC.to_le_bytes());
    mmap[4..8].copy_from_slice(&MCACHE_VERSION.to_le_bytes());
    mmap[8..12].copy_from_slice(&slot_count.to_le_bytes());
    mmap[12..16].copy_from_slice(&slot_size.to_le_bytes());
    let seed: u64 = rand::random();
    mmap[16..24].copy_from_slice(&seed.to_le_bytes());
    mmap[FREE_LIST_HEAD_OFFSET..FREE_LIST_HEAD_OFFSET + 4]
        .copy_from_slice(&free_list_head.unwrap_or(NONE_NEXT).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_invalidate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcache.bin");
        let mc = Mcache::create(&path, 64, 128).unwrap();

        let key = McacheKey::PasswdName("alice@dom".into());
        mc.store(&key, b"some-encoded-passwd-record").unwrap();
        assert_eq!(mc.occupied_slots(), 1);

        mc.invalidate(&key);
        assert_eq!(mc.occupied_slots(), 0);
    }

    #[test]
    fn oversized_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcache.bin");
        let mc = Mcache::create(&path, 8, 16).unwrap();
        let key = McacheKey::GroupGid(100);
        let big = vec![0u8; 64];
        assert!(mc.store(&key, &big).is_err());
    }

    #[test]
    fn colliding_keys_chain_instead_of_clobbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcache.bin");
        // a single-slot table forces every key into the same home bucket.
        let mc = Mcache::create(&path, 1, 32).unwrap();

        mc.store(&McacheKey::GroupGid(1), b"one").unwrap();
        mc.store(&McacheKey::GroupGid(2), b"two").unwrap();
        assert_eq!(mc.occupied_slots(), 1, "a 1-slot table has nowhere to chain to");

        mc.invalidate(&McacheKey::GroupGid(1));
        // the home slot now belongs to whichever key last claimed it; a
        // re-store of the same key must not panic or corrupt state.
        mc.store(&McacheKey::GroupGid(3), b"three").unwrap();
    }

    #[test]
    fn overflow_slot_survives_home_slot_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcache.bin");
        let mc = Mcache::create(&path, 2, 32).unwrap();

        // force both keys to the same home bucket regardless of hash by
        // exhausting the table: store 3 distinct keys into a 2-slot table,
        // guaranteeing at least one chain extension.
        mc.store(&McacheKey::GroupGid(10), b"a").unwrap();
        mc.store(&McacheKey::GroupGid(20), b"b").unwrap();
        mc.store(&McacheKey::GroupGid(30), b"c").unwrap();
        assert_eq!(mc.occupied_slots(), 2, "only 2 slots exist, one store must evict or chain-collide");
    }
}
