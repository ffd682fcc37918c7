#![forbid(unsafe_code)]
//! Bounded page cache with LRU-2Q and set-associative replacement.
//!
//! The cache owns a fixed arena of page frames (`cache_size / PAGE_SIZE`,
//! allocated at construction) and maps `(file, page-aligned offset)`
//! identities onto them. The central invariant: at most one frame holds a
//! given identity, and at most one read is in flight per identity.
//!
//! [`PageCache::search`] is the whole lookup-or-replace protocol in one
//! atomic step: a hit comes back pinned; a miss comes back with the new
//! identity already installed and `io_pending` already set, so concurrent
//! searchers of the same identity observe a pending hit instead of issuing
//! a second read. Dirty victims are never silently dropped: the caller
//! receives a [`WritebackTicket`] carrying the old payload and flushes it
//! through the engine before retrying.

mod assoc;
mod frame;
mod lru2q;
mod policy;

pub use frame::FrameFlags;

use crate::assoc::Assoc;
use crate::frame::FrameArena;
use crate::lru2q::Lru2q;
use crate::policy::Access;
use spate_error::{CoreError, Result};
use spate_types::{
    CacheConfig, CachePolicyKind, FrameId, PageBuf, PageLocation, PAGE_SIZE,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Bounded attempts before a search with no eligible victim gives up.
const MAX_SEARCH_ATTEMPTS: u32 = 8;
/// Base backoff between victim-search attempts; doubles per attempt.
const SEARCH_BACKOFF: Duration = Duration::from_micros(20);

/// Outcome of [`PageCache::search`].
#[derive(Debug)]
pub enum Lookup {
    /// The identity is resident; the pin is taken. `pending` means a read
    /// is in flight and the caller must wait for the frame to turn valid.
    Hit { frame: FrameId, pending: bool },
    /// The frame is assigned to the searched identity, pinned, and marked
    /// `io_pending`; the caller fills it (engine read or full-page
    /// overwrite).
    Miss { frame: FrameId },
    /// Replacement chose a dirty victim. Flush the ticket through the
    /// engine, complete it, then search again.
    Writeback(WritebackTicket),
}

/// A dirty page handed out for write-back.
///
/// The payload is a snapshot of the frame at selection time; the sequence
/// number lets completion detect writes that dirtied the frame again while
/// the flush was in flight.
#[derive(Debug)]
pub struct WritebackTicket {
    pub frame: FrameId,
    pub loc: PageLocation,
    payload: Option<PageBuf>,
    seq: u64,
}

impl WritebackTicket {
    /// Take the flush payload to hand to the engine. Panics on double-take.
    pub fn take_payload(&mut self) -> PageBuf {
        self.payload.take().expect("write-back payload already taken")
    }
}

/// Snapshot of cache statistics, taken with one pass over shared state.
/// All counters are monotonically increasing for the lifetime of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Lookups satisfied by a resident identity (including pending hits).
    pub hits: u64,
    /// Lookups that assigned a frame and required a read.
    pub misses: u64,
    /// Resident identities displaced to make room.
    pub evictions: u64,
    /// Dirty payloads handed out for write-back.
    pub writebacks: u64,
    /// Searches that exhausted their backoff without finding a victim.
    pub out_of_frames: u64,
    /// Currently installed identities.
    pub resident: usize,
    /// Frame count (`cache_size / PAGE_SIZE`).
    pub capacity: usize,
    /// LRU-2Q recency queue length (zero under the associative policy).
    pub a1_len: usize,
    /// LRU-2Q frequency queue length (zero under the associative policy).
    pub am_len: usize,
    /// LRU-2Q target capacity for A1, ~25% of frames (zero under the
    /// associative policy).
    pub a1_target: usize,
}

impl CacheMetrics {
    /// Cache hit ratio in the range [0.0, 1.0]; 0.0 before any access.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
enum Policy {
    Lru2q(Lru2q),
    Assoc(Assoc),
}

impl Policy {
    fn access(&self, arena: &FrameArena, loc: PageLocation) -> Access {
        match self {
            Self::Lru2q(p) => p.access(arena, loc),
            Self::Assoc(p) => p.access(arena, loc),
        }
    }

    fn contains(&self, loc: PageLocation) -> bool {
        match self {
            Self::Lru2q(p) => p.contains(loc),
            Self::Assoc(p) => p.contains(loc),
        }
    }

    fn resident_count(&self) -> usize {
        match self {
            Self::Lru2q(p) => p.resident_count(),
            Self::Assoc(p) => p.resident_count(),
        }
    }

    fn queue_lens(&self) -> (usize, usize, usize) {
        match self {
            Self::Lru2q(p) => p.queue_lens(),
            Self::Assoc(_) => (0, 0, 0),
        }
    }
}

/// Shared page cache over a fixed frame arena.
#[derive(Debug)]
pub struct PageCache {
    arena: FrameArena,
    policy: Policy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
    out_of_frames: AtomicU64,
}

impl PageCache {
    /// Pre-allocate `cache_size / PAGE_SIZE` frames and initialize policy
    /// state.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let config = config
            .clone()
            .validated()
            .map_err(|err| CoreError::Init(err.to_string()))?;
        let frames = config.frame_count();
        let policy = match config.policy {
            CachePolicyKind::Lru2q => Policy::Lru2q(Lru2q::new(frames)),
            // HashIndex selects the hash-partitioned associative engine.
            CachePolicyKind::Associative | CachePolicyKind::HashIndex => {
                Policy::Assoc(Assoc::new(frames))
            }
        };
        debug!(
            target: "spate::cache",
            event = "cache_init",
            frames = frames,
            bytes = frames * PAGE_SIZE,
            policy = ?config.policy
        );
        Ok(Self {
            arena: FrameArena::new(frames),
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
            out_of_frames: AtomicU64::new(0),
        })
    }

    /// Look up `loc`, assigning a frame on a miss.
    ///
    /// Atomic with respect to concurrent searchers of the same identity.
    /// When every eviction candidate is pinned or io-pending, retries with
    /// exponential backoff up to a bound, then fails with `OutOfFrames`;
    /// the caller recovers by draining engine completions.
    pub fn search(&self, loc: PageLocation) -> Result<Lookup> {
        let mut backoff = SEARCH_BACKOFF;
        for attempt in 0..MAX_SEARCH_ATTEMPTS {
            match self.policy.access(&self.arena, loc) {
                Access::Hit { frame, pending } => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        target: "spate::cache",
                        event = "hit",
                        loc = %loc,
                        frame = frame.0,
                        pending = pending
                    );
                    return Ok(Lookup::Hit { frame, pending });
                }
                Access::Assigned { frame, evicted } => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    if evicted {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    trace!(
                        target: "spate::cache",
                        event = "miss",
                        loc = %loc,
                        frame = frame.0,
                        evicted = evicted
                    );
                    return Ok(Lookup::Miss { frame });
                }
                Access::Writeback {
                    frame,
                    loc: old,
                    payload,
                    seq,
                } => {
                    self.writebacks.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        target: "spate::cache",
                        event = "victim_writeback",
                        loc = %old,
                        frame = frame.0
                    );
                    return Ok(Lookup::Writeback(WritebackTicket {
                        frame,
                        loc: old,
                        payload: Some(payload),
                        seq,
                    }));
                }
                Access::Busy => {
                    trace!(
                        target: "spate::cache",
                        event = "search_busy",
                        loc = %loc,
                        attempt = attempt
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
        self.out_of_frames.fetch_add(1, Ordering::Relaxed);
        warn!(
            target: "spate::cache",
            event = "out_of_frames",
            loc = %loc,
            attempts = MAX_SEARCH_ATTEMPTS
        );
        Err(CoreError::OutOfFrames)
    }

    /// Drop one pin.
    pub fn release(&self, frame: FrameId) {
        let prev = self.arena.get(frame).pin.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release of unpinned frame {}", frame.0);
    }

    /// Take the payload of a frame whose read the caller is about to issue.
    ///
    /// Panics if the frame is not in the assigned-for-read state; that is a
    /// caller bug, not an I/O failure.
    pub fn take_read_payload(&self, frame: FrameId) -> PageBuf {
        let mut slot = self.arena.get(frame).slot.lock();
        assert!(
            slot.io_pending && !slot.valid,
            "frame {} is not awaiting a read",
            frame.0
        );
        slot.payload.take().expect("read payload already taken")
    }

    /// Install a freshly read payload: the frame turns valid and servable.
    pub fn install_payload(&self, frame: FrameId, payload: PageBuf) {
        let mut slot = self.arena.get(frame).slot.lock();
        slot.payload = Some(payload);
        slot.valid = true;
        slot.io_pending = false;
    }

    /// Record a failed read: the buffer returns, the frame stays invalid
    /// (not poisoned), and a later search re-issues the I/O.
    pub fn fail_read(&self, frame: FrameId, payload: PageBuf) {
        let mut slot = self.arena.get(frame).slot.lock();
        slot.payload = Some(payload);
        slot.valid = false;
        slot.io_pending = false;
    }

    /// Overwrite the whole page without reading it first (full-page write
    /// to a missed frame). The frame turns valid and dirty.
    pub fn write_full_page(&self, frame: FrameId, src: &[u8]) {
        debug_assert_eq!(src.len(), PAGE_SIZE);
        let mut slot = self.arena.get(frame).slot.lock();
        slot.payload
            .as_mut()
            .expect("frame payload owned by a read")
            .as_mut_slice()
            .copy_from_slice(src);
        slot.valid = true;
        slot.dirty = true;
        slot.io_pending = false;
        slot.dirty_seq += 1;
    }

    /// Copy bytes out of a valid frame. Returns `false` (copying nothing)
    /// if the frame is not servable.
    pub fn copy_from_frame(&self, frame: FrameId, page_off: usize, dst: &mut [u8]) -> bool {
        let slot = self.arena.get(frame).slot.lock();
        if !slot.valid {
            return false;
        }
        let payload = slot.payload.as_ref().expect("valid frame holds payload");
        dst.copy_from_slice(&payload.as_slice()[page_off..page_off + dst.len()]);
        true
    }

    /// Copy bytes into a valid frame and mark it dirty. Returns `false` if
    /// the frame is not servable (e.g. its read is still in flight).
    pub fn write_into_frame(&self, frame: FrameId, page_off: usize, src: &[u8]) -> bool {
        let mut slot = self.arena.get(frame).slot.lock();
        if !slot.valid {
            return false;
        }
        slot.payload
            .as_mut()
            .expect("valid frame holds payload")
            .as_mut_slice()[page_off..page_off + src.len()]
            .copy_from_slice(src);
        slot.dirty = true;
        slot.dirty_seq += 1;
        true
    }

    /// Start a write-back of a dirty frame outside the replacement path
    /// (explicit flush). Returns `None` if the frame is not flushable right
    /// now.
    pub fn begin_writeback(&self, frame: FrameId) -> Option<WritebackTicket> {
        let mut slot = self.arena.get(frame).slot.lock();
        if !slot.dirty || !slot.valid || slot.io_pending {
            return None;
        }
        let loc = slot.loc?;
        slot.io_pending = true;
        self.writebacks.fetch_add(1, Ordering::Relaxed);
        Some(WritebackTicket {
            frame,
            loc,
            payload: Some(slot.payload.clone().expect("valid frame holds payload")),
            seq: slot.dirty_seq,
        })
    }

    /// Complete a write-back: clears `io_pending`, and clears `dirty`
    /// unless the frame was dirtied again after the ticket was issued.
    pub fn complete_writeback(&self, ticket: &WritebackTicket) {
        let mut slot = self.arena.get(ticket.frame).slot.lock();
        slot.io_pending = false;
        if slot.dirty_seq == ticket.seq {
            slot.dirty = false;
        }
    }

    /// Abort a write-back whose engine write failed: the frame keeps its
    /// dirty bit and becomes flushable again.
    pub fn abort_writeback(&self, ticket: &WritebackTicket) {
        let mut slot = self.arena.get(ticket.frame).slot.lock();
        slot.io_pending = false;
    }

    /// Observable flags of a frame.
    #[must_use]
    pub fn flags(&self, frame: FrameId) -> FrameFlags {
        self.arena.get(frame).slot.lock().flags()
    }

    /// Identity currently installed on a frame.
    #[must_use]
    pub fn location_of(&self, frame: FrameId) -> Option<PageLocation> {
        self.arena.get(frame).slot.lock().loc
    }

    /// Whether an identity is resident (side-effect free).
    #[must_use]
    pub fn contains(&self, loc: PageLocation) -> bool {
        self.policy.contains(loc)
    }

    /// Frames whose payload is dirty and flushable.
    #[must_use]
    pub fn dirty_frames(&self) -> Vec<FrameId> {
        self.arena
            .iter_ids()
            .filter(|&id| {
                let slot = self.arena.get(id).slot.lock();
                slot.dirty && slot.valid && !slot.io_pending
            })
            .collect()
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.policy.resident_count()
    }

    /// Sum of all pin counts (invariant checks in tests).
    #[must_use]
    pub fn total_pins(&self) -> u64 {
        self.arena.total_pins()
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let (a1_len, am_len, a1_target) = self.policy.queue_lens();
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            out_of_frames: self.out_of_frames.load(Ordering::Relaxed),
            resident: self.policy.resident_count(),
            capacity: self.arena.len(),
            a1_len,
            am_len,
            a1_target,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
