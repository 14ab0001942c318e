//! Bounded cache of computed register states, keyed by PC.
//!
//! Entries refer to each other with small indices and a sentinel instead
//! of pointers, so the three parallel arrays can be relocated wholesale
//! on resize. Lookup is a Fibonacci multiplicative hash with chained
//! collisions; eviction is round robin. A forward hint links each
//! frame's entry to the next frame's entry so that walking the same
//! stack again skips hashing entirely.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use smallvec::SmallVec;
use tracing::trace;

use crate::state::RegisterState;
use crate::{DwarfError, Result};

pub(crate) const DEFAULT_LOG_CACHE_SIZE: u16 = 7;
pub(crate) const MAX_LOG_CACHE_SIZE: u16 = 15;

const DEFAULT_CACHE_SIZE: usize = 1 << DEFAULT_LOG_CACHE_SIZE;
const DEFAULT_HASH_SIZE: usize = 1 << (DEFAULT_LOG_CACHE_SIZE + 1);

/// No-entry sentinel: the largest index the chain field can carry.
const NO_INDEX: u16 = u16::MAX;

/// Based on (sqrt(5)/2 - 1) * 2^64.
const HASH_MAGIC: u64 = 0x9e37_79b9_7f4a_7c16;

/// Per-bucket metadata. `hint` is written without the cache lock held;
/// single-word stores keep that race benign.
#[derive(Debug)]
pub(crate) struct CacheLink {
    pub ip: u64,
    pub coll_chain: u16,
    /// Probable cache index of the next frame up the stack, plus one.
    pub hint: AtomicU16,
    pub valid: bool,
    pub signal_frame: bool,
}

impl Default for CacheLink {
    fn default() -> Self {
        Self {
            ip: 0,
            coll_chain: NO_INDEX,
            hint: AtomicU16::new(0),
            valid: false,
            signal_frame: false,
        }
    }
}

impl Clone for CacheLink {
    fn clone(&self) -> Self {
        Self {
            ip: self.ip,
            coll_chain: self.coll_chain,
            hint: AtomicU16::new(self.hint.load(Ordering::Relaxed)),
            valid: self.valid,
            signal_frame: self.signal_frame,
        }
    }
}

/// The default-sized arrays live inline; only a resize to another
/// `log_size` spills to the heap.
pub(crate) struct Cache {
    generation: AtomicU64,
    log_size: u16,
    prev_log_size: u16,
    rr_head: u16,
    hash: SmallVec<[u16; DEFAULT_HASH_SIZE]>,
    buckets: SmallVec<[RegisterState; DEFAULT_CACHE_SIZE]>,
    links: SmallVec<[CacheLink; DEFAULT_CACHE_SIZE]>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            log_size: DEFAULT_LOG_CACHE_SIZE,
            prev_log_size: DEFAULT_LOG_CACHE_SIZE,
            rr_head: 0,
            hash: SmallVec::new(),
            buckets: SmallVec::new(),
            links: SmallVec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// A fresh cache has no storage until its first flush.
    pub fn is_unallocated(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn set_log_size(&mut self, log_size: u16) {
        self.log_size = log_size.clamp(1, MAX_LOG_CACHE_SIZE);
    }

    #[inline]
    fn size(&self) -> usize {
        1 << self.log_size
    }

    #[inline]
    fn hash_size(&self) -> usize {
        1 << (self.log_size + 1)
    }

    /// Drop every entry. Storage already sized for the current
    /// `log_size` is wiped in place; a size change reallocates the three
    /// arrays.
    pub fn flush(&mut self) -> Result<()> {
        let size = self.size();
        let hash_size = self.hash_size();
        if self.prev_log_size != self.log_size || self.buckets.is_empty() {
            self.hash.clear();
            self.buckets.clear();
            self.links.clear();
            if self.hash.try_reserve(hash_size).is_err()
                || self.buckets.try_reserve(size).is_err()
                || self.links.try_reserve(size).is_err()
            {
                return Err(DwarfError::OutOfMemory);
            }
            self.hash.resize(hash_size, NO_INDEX);
            self.buckets.resize(size, RegisterState::default());
            self.links.resize(size, CacheLink::default());
            self.prev_log_size = self.log_size;
        } else {
            for head in self.hash.iter_mut() {
                *head = NO_INDEX;
            }
            for link in self.links.iter_mut() {
                *link = CacheLink::default();
            }
        }
        self.rr_head = 0;
        trace!("cache flushed, {} buckets", size);
        Ok(())
    }

    #[inline]
    fn hash_index(&self, ip: u64) -> usize {
        (ip.wrapping_mul(HASH_MAGIC) >> (u64::BITS as usize - (self.log_size as usize + 1))) as usize
    }

    #[inline]
    fn matches(&self, index: u16, ip: u64) -> bool {
        let link = &self.links[index as usize];
        link.valid && link.ip == ip
    }

    /// Find the entry for `ip`: the cursor's forward hint first, then the
    /// hash chain.
    pub fn lookup(&self, ip: u64, hint: u16) -> Option<u16> {
        if hint > 0 {
            let index = hint - 1;
            if (index as usize) < self.size() && self.matches(index, ip) {
                trace!("cache hit via hint at index {}", index);
                return Some(index);
            }
        }
        let mut index = self.hash[self.hash_index(ip)];
        while (index as usize) < self.size() {
            if self.matches(index, ip) {
                return Some(index);
            }
            index = self.links[index as usize].coll_chain;
        }
        None
    }

    /// Claim the next round-robin victim for `ip`: unlink it from its old
    /// hash chain, splice it onto `ip`'s chain, reset its metadata.
    pub fn insert(&mut self, ip: u64, signal_frame: bool) -> u16 {
        let head = self.rr_head;
        self.rr_head = (head + 1) & (self.size() as u16 - 1);

        if self.links[head as usize].valid {
            self.unlink(head);
        }

        let h = self.hash_index(ip);
        self.links[head as usize].coll_chain = self.hash[h];
        self.hash[h] = head;

        let link = &mut self.links[head as usize];
        link.ip = ip;
        link.valid = true;
        link.signal_frame = signal_frame;
        link.hint.store(0, Ordering::Relaxed);
        trace!("cache insert {:#x} at index {}", ip, head);
        head
    }

    fn unlink(&mut self, index: u16) {
        let h = self.hash_index(self.links[index as usize].ip);
        let next = self.links[index as usize].coll_chain;
        if self.hash[h] == index {
            self.hash[h] = next;
            return;
        }
        let mut prev = self.hash[h];
        while (prev as usize) < self.size() {
            if self.links[prev as usize].coll_chain == index {
                self.links[prev as usize].coll_chain = next;
                return;
            }
            prev = self.links[prev as usize].coll_chain;
        }
    }

    #[inline]
    pub fn bucket(&self, index: u16) -> &RegisterState {
        &self.buckets[index as usize]
    }

    #[inline]
    pub fn set_bucket(&mut self, index: u16, rs: &RegisterState) {
        self.buckets[index as usize] = *rs;
    }

    #[inline]
    pub fn link(&self, index: u16) -> &CacheLink {
        &self.links[index as usize]
    }

    /// Record that the frame cached at `from` is followed by the one at
    /// `to`. `from` may be stale after a resize; out-of-range writes are
    /// dropped.
    pub fn set_forward_hint(&self, from: u16, to: u16) {
        if let Some(link) = self.links.get(from as usize) {
            link.hint.store(to + 1, Ordering::Relaxed);
        }
    }
}
