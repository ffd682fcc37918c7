#![forbid(unsafe_code)]
//! Globally cached asynchronous I/O.
//!
//! [`GlobalCachedIo`] is the per-worker client handle: it slices byte-range
//! requests on page boundaries, serves hits straight from the shared
//! [`spate_cache::PageCache`], coalesces adjacent misses into multi-segment
//! engine requests, and re-enters queued user computations when the pages
//! they depend on become resident.
//!
//! Control flow is cooperative: the only blocking operation is draining the
//! private engine's completions, entered when the engine has no free slots,
//! when the cache has no unpinned victim, or when the client waits on a
//! pending page. Backpressure that outlives the configured bound surfaces
//! as an advisory `Stuck` warning and the wait continues.

mod pending;
mod view;

pub use pending::{ClientCallback, RequestOutcome};
pub use view::{PageByteArray, UserCompute};

use crate::pending::{PendingRequest, Progress};
use parking_lot::Mutex;
use spate_aio::{AioEngine, CompleteFn, CompletionStatus, ControlBlock};
use spate_cache::{CacheMetrics, Lookup, PageCache, WritebackTicket};
use spate_error::{CoreError, Result};
use spate_types::{
    ByteOffset, CacheConfig, FileId, FrameId, IoDir, PageBuf, PageLocation, PAGE_SIZE,
};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

const INFLIGHT_SHARDS: usize = 16;

// ── Shared state: cache + in-flight map ────────────────────────────────────

/// Per-page queue of computations awaiting a read.
///
/// Sharded by page identity. The invariant "at most one read in flight per
/// identity" lives in the cache's `io_pending` flag; this map only queues
/// the computations to re-enter when that read lands.
struct InflightMap {
    shards: Vec<Mutex<HashMap<PageLocation, Vec<Arc<PendingRequest>>>>>,
}

impl InflightMap {
    fn new() -> Self {
        Self {
            shards: (0..INFLIGHT_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, loc: PageLocation) -> &Mutex<HashMap<PageLocation, Vec<Arc<PendingRequest>>>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        loc.hash(&mut hasher);
        &self.shards[(hasher.finish() % INFLIGHT_SHARDS as u64) as usize]
    }
}

/// Cache state shared by every worker's [`GlobalCachedIo`] handle.
pub struct CacheShared {
    cache: PageCache,
    inflight: InflightMap,
}

impl CacheShared {
    pub fn new(config: &CacheConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            cache: PageCache::new(config)?,
            inflight: InflightMap::new(),
        }))
    }

    #[must_use]
    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Queue a computation on a page whose read is in flight.
    ///
    /// Returns `false` if the page turned valid in the meantime; the caller
    /// then counts the page as already resident. The validity check and the
    /// queue push happen under the shard lock, the same lock completions
    /// install under, so a waiter is never orphaned.
    fn register_waiter(
        &self,
        loc: PageLocation,
        frame: FrameId,
        req: &Arc<PendingRequest>,
    ) -> bool {
        let mut shard = self.inflight.shard(loc).lock();
        if self.cache.flags(frame).valid {
            return false;
        }
        shard.entry(loc).or_default().push(Arc::clone(req));
        true
    }

    /// Install a completed read and drain the page's waiters, in enqueue
    /// order.
    fn complete_read_page(
        &self,
        loc: PageLocation,
        frame: FrameId,
        payload: PageBuf,
    ) -> Vec<Arc<PendingRequest>> {
        let mut shard = self.inflight.shard(loc).lock();
        self.cache.install_payload(frame, payload);
        shard.remove(&loc).unwrap_or_default()
    }

    /// Record a failed read and drain the page's waiters for discard.
    fn fail_read_page(
        &self,
        loc: PageLocation,
        frame: FrameId,
        payload: PageBuf,
    ) -> Vec<Arc<PendingRequest>> {
        let mut shard = self.inflight.shard(loc).lock();
        self.cache.fail_read(frame, payload);
        shard.remove(&loc).unwrap_or_default()
    }

    /// Overwrite a whole missed page without reading it, draining any
    /// waiters that queued on the (never issued) read.
    fn complete_overwrite_page(
        &self,
        loc: PageLocation,
        frame: FrameId,
        src: &[u8],
    ) -> Vec<Arc<PendingRequest>> {
        let mut shard = self.inflight.shard(loc).lock();
        self.cache.write_full_page(frame, src);
        shard.remove(&loc).unwrap_or_default()
    }
}

impl std::fmt::Debug for CacheShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheShared")
            .field("cache", &self.cache.metrics())
            .finish_non_exhaustive()
    }
}

/// Completion closure for a (possibly merged) read covering `pages`.
///
/// Runs in the issuing thread's `wait` context; installs each page, then
/// re-enters every computation whose countdown reached zero.
fn read_completion(shared: Arc<CacheShared>, pages: Vec<(PageLocation, FrameId)>) -> CompleteFn {
    Box::new(move |status, segments| {
        let mut segments = segments.into_iter();
        match status {
            CompletionStatus::Done { .. } => {
                for (loc, frame) in &pages {
                    let payload = segments.next().expect("one segment per page");
                    let waiters = shared.complete_read_page(*loc, *frame, payload);
                    for req in waiters {
                        if let Progress::Ready = req.page_done() {
                            req.run(shared.cache());
                        }
                    }
                }
            }
            CompletionStatus::Error { errno } => {
                error!(
                    target: "spate::io",
                    event = "read_failed",
                    errno = errno,
                    pages = pages.len(),
                    first = %pages[0].0
                );
                for (loc, frame) in &pages {
                    let payload = segments.next().expect("one segment per page");
                    let waiters = shared.fail_read_page(*loc, *frame, payload);
                    for req in waiters {
                        req.fail(shared.cache(), errno);
                    }
                }
            }
        }
    })
}

// ── Miss coalescing ────────────────────────────────────────────────────────

struct Run {
    pages: Vec<(PageLocation, FrameId)>,
    segments: Vec<PageBuf>,
}

/// Greedy merger of consecutive-page misses within one submission batch.
#[derive(Default)]
struct RunBuilder {
    runs: Vec<Run>,
    current: Option<Run>,
}

impl RunBuilder {
    fn add(&mut self, loc: PageLocation, frame: FrameId, payload: PageBuf) {
        if let Some(run) = &mut self.current {
            let last = run.pages.last().expect("run is never empty").0;
            if last.next() == loc {
                run.pages.push((loc, frame));
                run.segments.push(payload);
                return;
            }
            let finished = self.current.take().expect("checked above");
            self.runs.push(finished);
        }
        self.current = Some(Run {
            pages: vec![(loc, frame)],
            segments: vec![payload],
        });
    }

    fn finish(mut self) -> Vec<Run> {
        if let Some(run) = self.current.take() {
            self.runs.push(run);
        }
        self.runs
    }
}

// ── Client handle ──────────────────────────────────────────────────────────

/// A read request carrying a user computation, for the batch interface.
pub struct ComputeRequest {
    /// Page-aligned start of the range.
    pub offset: ByteOffset,
    /// Range length in bytes; a non-zero multiple of `PAGE_SIZE`.
    pub len: usize,
    /// Computation re-entered once the whole range is resident.
    pub compute: Box<dyn UserCompute>,
}

/// Snapshot of per-handle statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Page slices served from the cache without waiting.
    pub cache_hits: u64,
    /// Times this handle drained completions to make progress.
    pub num_waits: u64,
    /// Advisory stuck episodes (backpressure beyond the configured bound).
    pub stuck_events: u64,
}

struct PageSlice {
    loc: PageLocation,
    page_off: usize,
    buf_start: usize,
    len: usize,
}

/// Per-worker cached I/O handle over one file.
///
/// The cache (and its in-flight map) is shared; the engine is private to
/// this handle, so completion callbacks for requests it submitted run in
/// submission order during its own waits.
pub struct GlobalCachedIo {
    shared: Arc<CacheShared>,
    engine: AioEngine,
    file: FileId,
    file_len: u64,
    entry_size: usize,
    node_id: Option<u32>,
    stuck_after: Duration,
    callback: Mutex<Option<ClientCallback>>,
    cache_hits: AtomicU64,
    num_waits: AtomicU64,
    stuck_events: AtomicU64,
}

impl std::fmt::Debug for GlobalCachedIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalCachedIo")
            .field("file", &self.file)
            .field("file_len", &self.file_len)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl GlobalCachedIo {
    /// Bind a handle to `file` over the shared cache and a private engine.
    pub fn new(
        shared: Arc<CacheShared>,
        engine: AioEngine,
        file: FileId,
        config: &CacheConfig,
    ) -> Result<Self> {
        let config = config
            .clone()
            .validated()
            .map_err(|err| CoreError::Init(err.to_string()))?;
        let file_len = engine.backend().file_len(file)?;
        debug!(
            target: "spate::io",
            event = "handle_init",
            file = file.0,
            file_len = file_len,
            entry_size = config.entry_size
        );
        Ok(Self {
            shared,
            engine,
            file,
            file_len,
            entry_size: config.entry_size,
            node_id: config.node_id,
            stuck_after: config.stuck_after,
            callback: Mutex::new(None),
            cache_hits: AtomicU64::new(0),
            num_waits: AtomicU64::new(0),
            stuck_events: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn file(&self) -> FileId {
        self.file
    }

    #[must_use]
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Client value size this handle validates request alignment against.
    #[must_use]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// NUMA locality hint carried from the configuration.
    #[must_use]
    pub fn node_id(&self) -> Option<u32> {
        self.node_id
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<CacheShared> {
        &self.shared
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        IoStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            num_waits: self.num_waits.load(Ordering::Relaxed),
            stuck_events: self.stuck_events.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.shared.cache.metrics()
    }

    #[must_use]
    pub fn engine_stats(&self) -> spate_aio::EngineStats {
        self.engine.stats()
    }

    /// Install a per-completion client callback.
    ///
    /// Returns `false` (leaving the callback unset) when the engine cannot
    /// deliver asynchronous completions.
    pub fn set_callback(&self, cb: ClientCallback) -> bool {
        if !self.engine.supports_async() {
            return false;
        }
        *self.callback.lock() = Some(cb);
        true
    }

    /// Drain up to all parked completions, requesting at least `min`.
    pub fn drain(&self, min: usize) -> usize {
        self.num_waits.fetch_add(1, Ordering::Relaxed);
        self.engine.wait(None, min)
    }

    // ── Synchronous byte-range interface ──────────────────────────────

    /// Read `buf.len()` bytes at `offset` through the cache.
    ///
    /// Returns the byte count; the errno rendition of a failure is
    /// `CoreError::to_errno`.
    pub fn read(&self, buf: &mut [u8], offset: ByteOffset) -> Result<usize> {
        self.validate_range(offset, buf.len())?;
        let slices = self.page_slices(offset.0, buf.len());
        // Requests may span far more pages than the cache holds; pins are
        // taken a bounded chunk at a time so a large scan cannot starve
        // itself of frames.
        for chunk in slices.chunks(self.max_pinned_pages()) {
            let mut deferred: Vec<(usize, FrameId)> = Vec::new();
            let mut runs = RunBuilder::default();
            for (idx, slice) in chunk.iter().enumerate() {
                self.resolve_slice(slice, idx, &mut runs, &mut deferred, None)?;
            }
            self.submit_runs(runs.finish());

            let mut failed: Option<CoreError> = None;
            for (idx, frame) in deferred {
                if failed.is_some() {
                    self.shared.cache.release(frame);
                    continue;
                }
                let slice = &chunk[idx];
                match self.wait_frame_valid(frame) {
                    Ok(()) => {
                        let dst = &mut buf[slice.buf_start..slice.buf_start + slice.len];
                        let ok = self.shared.cache.copy_from_frame(frame, slice.page_off, dst);
                        debug_assert!(ok, "waited frame must be servable");
                        self.shared.cache.release(frame);
                    }
                    // The failed frame's pin is already consumed.
                    Err(err) => failed = Some(err),
                }
            }
            if let Some(err) = failed {
                return Err(err);
            }
        }
        Ok(buf.len())
    }

    /// Write `buf.len()` bytes at `offset` through the cache.
    ///
    /// A write covering a whole page skips the read; a partial-page write
    /// does read-modify-write. Pages are marked dirty and flushed on
    /// eviction or [`flush`](Self::flush).
    pub fn write(&self, buf: &[u8], offset: ByteOffset) -> Result<usize> {
        self.validate_range(offset, buf.len())?;
        let slices = self.page_slices(offset.0, buf.len());
        for chunk in slices.chunks(self.max_pinned_pages()) {
            let mut deferred: Vec<(usize, FrameId)> = Vec::new();
            let mut runs = RunBuilder::default();
            for (idx, slice) in chunk.iter().enumerate() {
                self.resolve_slice(slice, idx, &mut runs, &mut deferred, Some(buf))?;
            }
            self.submit_runs(runs.finish());

            let mut failed: Option<CoreError> = None;
            for (idx, frame) in deferred {
                if failed.is_some() {
                    self.shared.cache.release(frame);
                    continue;
                }
                let slice = &chunk[idx];
                match self.wait_frame_valid(frame) {
                    Ok(()) => {
                        let src = &buf[slice.buf_start..slice.buf_start + slice.len];
                        let ok = self.shared.cache.write_into_frame(frame, slice.page_off, src);
                        debug_assert!(ok, "waited frame must be servable");
                        self.shared.cache.release(frame);
                    }
                    Err(err) => failed = Some(err),
                }
            }
            if let Some(err) = failed {
                return Err(err);
            }
        }
        Ok(buf.len())
    }

    /// Resolve one page slice of a synchronous request.
    ///
    /// `write_src = None` means a read. Full-page overwrites complete in
    /// place; everything else lands in `runs` (misses to issue) and
    /// `deferred` (pinned frames the caller finishes once they are valid).
    fn resolve_slice(
        &self,
        slice: &PageSlice,
        idx: usize,
        runs: &mut RunBuilder,
        deferred: &mut Vec<(usize, FrameId)>,
        write_src: Option<&[u8]>,
    ) -> Result<()> {
        let mut window = Instant::now();
        loop {
            match self.shared.cache.search(slice.loc) {
                Ok(Lookup::Hit {
                    frame,
                    pending: false,
                }) => {
                    // Valid and pinned: the caller's finish loop observes
                    // `valid` immediately and copies without waiting.
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    deferred.push((idx, frame));
                    return Ok(());
                }
                Ok(Lookup::Hit {
                    frame,
                    pending: true,
                }) => {
                    deferred.push((idx, frame));
                    return Ok(());
                }
                Ok(Lookup::Miss { frame }) => {
                    let full_page = slice.len == PAGE_SIZE;
                    if let (Some(buf), true) = (write_src, full_page) {
                        let src = &buf[slice.buf_start..slice.buf_start + slice.len];
                        let waiters = self.shared.complete_overwrite_page(slice.loc, frame, src);
                        for req in waiters {
                            if let Progress::Ready = req.page_done() {
                                req.run(self.shared.cache());
                            }
                        }
                        self.shared.cache.release(frame);
                        return Ok(());
                    }
                    let payload = self.shared.cache.take_read_payload(frame);
                    runs.add(slice.loc, frame, payload);
                    deferred.push((idx, frame));
                    return Ok(());
                }
                Ok(Lookup::Writeback(ticket)) => {
                    self.flush_ticket(ticket)?;
                }
                Err(CoreError::OutOfFrames) => {
                    // Our own gathered misses may be what pins the frames:
                    // get them moving before waiting on completions.
                    self.submit_runs(std::mem::take(runs).finish());
                    self.wait_some();
                    self.advise_stuck(&mut window, "unpinned frame");
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ── Batch interface with computations ─────────────────────────────

    /// Submit a batch of compute-reads.
    ///
    /// Each request's computation runs exactly once, after every page of
    /// its range is resident: inline for all-hit requests, otherwise in the
    /// `wait` context of whichever handle completes the last page. Queued
    /// computations on one page run in enqueue order.
    pub fn access_batch(&self, requests: Vec<ComputeRequest>) -> Result<()> {
        for req in &requests {
            if req.len == 0 || req.len % PAGE_SIZE != 0 || !req.offset.is_page_aligned() {
                return Err(CoreError::BadRequest(format!(
                    "compute request [{}, +{}) is not page-aligned",
                    req.offset, req.len
                )));
            }
            if req.offset.0 + req.len as u64 > self.file_len {
                return Err(CoreError::BadRequest(format!(
                    "compute request [{}, +{}) exceeds file length {}",
                    req.offset, req.len, self.file_len
                )));
            }
            // A computation needs all its pages resident (and pinned) at
            // once; a request wider than the cache can never satisfy that.
            if req.len / PAGE_SIZE > self.shared.cache.frame_count() {
                return Err(CoreError::BadRequest(format!(
                    "compute request of {} pages exceeds cache capacity of {} frames",
                    req.len / PAGE_SIZE,
                    self.shared.cache.frame_count()
                )));
            }
        }

        let callback = self.callback.lock().clone();
        let mut runs = RunBuilder::default();
        for ComputeRequest {
            offset,
            len,
            compute,
        } in requests
        {
            let request = PendingRequest::new(self.file, offset, len, compute, callback.clone());
            for page_idx in 0..len / PAGE_SIZE {
                let loc = PageLocation {
                    file: self.file,
                    offset: ByteOffset(offset.0 + (page_idx * PAGE_SIZE) as u64),
                };
                self.resolve_batch_page(loc, &request, &mut runs)?;
            }
        }
        self.submit_runs(runs.finish());
        Ok(())
    }

    fn resolve_batch_page(
        &self,
        loc: PageLocation,
        request: &Arc<PendingRequest>,
        runs: &mut RunBuilder,
    ) -> Result<()> {
        let mut window = Instant::now();
        loop {
            match self.shared.cache.search(loc) {
                Ok(Lookup::Hit {
                    frame,
                    pending: false,
                }) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    if request.add_frame(loc, frame) {
                        if let Progress::Ready = request.page_done() {
                            request.run(self.shared.cache());
                        }
                    } else {
                        self.shared.cache.release(frame);
                    }
                    return Ok(());
                }
                Ok(Lookup::Hit {
                    frame,
                    pending: true,
                }) => {
                    if request.add_frame(loc, frame) {
                        if !self.shared.register_waiter(loc, frame, request) {
                            // Turned valid between search and registration.
                            if let Progress::Ready = request.page_done() {
                                request.run(self.shared.cache());
                            }
                        }
                    } else {
                        self.shared.cache.release(frame);
                    }
                    return Ok(());
                }
                Ok(Lookup::Miss { frame }) => {
                    let payload = self.shared.cache.take_read_payload(frame);
                    if request.add_frame(loc, frame) {
                        let registered = self.shared.register_waiter(loc, frame, request);
                        debug_assert!(registered, "missed page cannot be valid yet");
                    } else {
                        // The request already failed on an earlier page; the
                        // read still goes out to leave the frame healthy.
                        self.shared.cache.release(frame);
                    }
                    runs.add(loc, frame, payload);
                    return Ok(());
                }
                Ok(Lookup::Writeback(ticket)) => {
                    self.flush_ticket(ticket)?;
                }
                Err(CoreError::OutOfFrames) => {
                    // Completions of already-gathered misses (ours or other
                    // requests') are what will release frames.
                    self.submit_runs(std::mem::take(runs).finish());
                    self.wait_some();
                    self.advise_stuck(&mut window, "unpinned frame");
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ── Cache warm-up and flush ───────────────────────────────────────

    /// Warm the cache for `[offset, offset + size)` without copying to a
    /// user buffer. Returns the number of pages touched.
    pub fn preload(&self, offset: ByteOffset, size: usize) -> Result<usize> {
        if size == 0 {
            return Ok(0);
        }
        if offset.0 + size as u64 > self.file_len {
            return Err(CoreError::BadRequest(format!(
                "preload [{offset}, +{size}) exceeds file length {}",
                self.file_len
            )));
        }
        let first = spate_types::floor_to_page(offset.0);
        let last = spate_types::ceil_to_page(offset.0 + size as u64);
        let mut pages = 0_usize;

        // Pin at most a chunk of pages at a time, like the synchronous
        // paths, so warming a range larger than the cache cannot wedge.
        let chunk_bytes = (self.max_pinned_pages() * PAGE_SIZE) as u64;
        let mut chunk_start = first;
        while chunk_start < last {
            let chunk_end = (chunk_start + chunk_bytes).min(last);
            let mut runs = RunBuilder::default();
            let mut held: Vec<FrameId> = Vec::new();

            let mut page_off = chunk_start;
            while page_off < chunk_end {
                let loc = PageLocation {
                    file: self.file,
                    offset: ByteOffset(page_off),
                };
                let mut window = Instant::now();
                loop {
                    match self.shared.cache.search(loc) {
                        Ok(Lookup::Hit {
                            frame,
                            pending: false,
                        }) => {
                            self.cache_hits.fetch_add(1, Ordering::Relaxed);
                            self.shared.cache.release(frame);
                        }
                        Ok(Lookup::Hit {
                            frame,
                            pending: true,
                        }) => held.push(frame),
                        Ok(Lookup::Miss { frame }) => {
                            let payload = self.shared.cache.take_read_payload(frame);
                            runs.add(loc, frame, payload);
                            held.push(frame);
                        }
                        Ok(Lookup::Writeback(ticket)) => {
                            self.flush_ticket(ticket)?;
                            continue;
                        }
                        Err(CoreError::OutOfFrames) => {
                            self.submit_runs(std::mem::take(&mut runs).finish());
                            self.wait_some();
                            self.advise_stuck(&mut window, "unpinned frame");
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                    break;
                }
                pages += 1;
                page_off += PAGE_SIZE as u64;
            }

            self.submit_runs(runs.finish());
            let mut failed: Option<CoreError> = None;
            for frame in held {
                if failed.is_some() {
                    self.shared.cache.release(frame);
                    continue;
                }
                match self.wait_frame_valid(frame) {
                    Ok(()) => self.shared.cache.release(frame),
                    Err(err) => failed = Some(err),
                }
            }
            if let Some(err) = failed {
                return Err(err);
            }
            chunk_start = chunk_end;
        }
        Ok(pages)
    }

    /// Write back every dirty frame in the shared cache and wait for the
    /// writes to land.
    pub fn flush(&self) -> Result<()> {
        let dirty = self.shared.cache.dirty_frames();
        if dirty.is_empty() {
            return Ok(());
        }
        debug!(
            target: "spate::io",
            event = "flush_start",
            dirty_frames = dirty.len()
        );
        let remaining = Arc::new(AtomicUsize::new(0));
        let mut batch: Vec<ControlBlock> = Vec::new();
        for frame in dirty {
            let Some(mut ticket) = self.shared.cache.begin_writeback(frame) else {
                continue;
            };
            let payload = ticket.take_payload();
            let file = ticket_file(&ticket);
            let offset = ticket_offset(&ticket);
            let slot = self.reserve_slot_blocking(&mut batch);
            remaining.fetch_add(1, Ordering::AcqRel);
            let shared = Arc::clone(&self.shared);
            let remaining2 = Arc::clone(&remaining);
            let on_complete: CompleteFn = Box::new(move |status, _segments| {
                finish_writeback(&shared, &ticket, status);
                remaining2.fetch_sub(1, Ordering::AcqRel);
            });
            batch.push(self.engine.make_request(
                slot,
                file,
                offset,
                IoDir::Write,
                payload,
                on_complete,
            ));
        }
        self.engine.submit(batch);

        let mut window = Instant::now();
        while remaining.load(Ordering::Acquire) != 0 {
            self.wait_some();
            self.advise_stuck(&mut window, "flush write-back");
        }
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────

    /// Most pages a synchronous request pins at once; half the frames, so
    /// concurrent workers always leave each other room.
    fn max_pinned_pages(&self) -> usize {
        (self.shared.cache.frame_count() / 2).max(1)
    }

    fn validate_range(&self, offset: ByteOffset, len: usize) -> Result<()> {
        if len == 0 {
            return Err(CoreError::BadRequest("zero-length request".to_owned()));
        }
        let entry = self.entry_size as u64;
        if offset.0 % entry != 0 || len as u64 % entry != 0 {
            return Err(CoreError::BadRequest(format!(
                "request [{offset}, +{len}) not aligned to entry size {entry}"
            )));
        }
        if offset.0 + len as u64 > self.file_len {
            return Err(CoreError::BadRequest(format!(
                "request [{offset}, +{len}) exceeds file length {}",
                self.file_len
            )));
        }
        Ok(())
    }

    fn page_slices(&self, offset: u64, len: usize) -> Vec<PageSlice> {
        let end = offset + len as u64;
        let mut slices = Vec::with_capacity(len.div_ceil(PAGE_SIZE) + 1);
        let mut cur = offset;
        while cur < end {
            let loc = PageLocation::containing(self.file, ByteOffset(cur));
            let page_off = (cur - loc.offset.0) as usize;
            let chunk = ((PAGE_SIZE - page_off) as u64).min(end - cur) as usize;
            slices.push(PageSlice {
                loc,
                page_off,
                buf_start: (cur - offset) as usize,
                len: chunk,
            });
            cur += chunk as u64;
        }
        slices
    }

    /// Issue the merged miss runs as one engine batch.
    fn submit_runs(&self, runs: Vec<Run>) {
        if runs.is_empty() {
            return;
        }
        let mut batch: Vec<ControlBlock> = Vec::with_capacity(runs.len());
        for run in runs {
            let slot = self.reserve_slot_blocking(&mut batch);
            let Run { pages, segments } = run;
            let offset = pages[0].0.offset;
            trace!(
                target: "spate::io",
                event = "issue_read",
                offset = offset.0,
                pages = pages.len()
            );
            let on_complete = read_completion(Arc::clone(&self.shared), pages);
            batch.push(self.engine.make_iovec_request(
                slot,
                self.file,
                offset,
                IoDir::Read,
                segments,
                on_complete,
            ));
        }
        self.engine.submit(batch);
    }

    /// Reserve an engine slot, draining completions (and flushing the
    /// partially built batch so they can exist) while the budget is
    /// exhausted.
    fn reserve_slot_blocking(&self, batch: &mut Vec<ControlBlock>) -> spate_aio::SlotReservation {
        let mut window = Instant::now();
        loop {
            match self.engine.reserve_slot() {
                Ok(slot) => return slot,
                Err(CoreError::OutOfSlots) => {
                    if !batch.is_empty() {
                        self.engine.submit(std::mem::take(batch));
                    }
                    self.wait_some();
                    self.advise_stuck(&mut window, "engine slot");
                }
                Err(err) => unreachable!("reserve_slot returns only OutOfSlots: {err}"),
            }
        }
    }

    /// Flush one dirty victim through the engine and wait for it, so the
    /// frame can be reused.
    fn flush_ticket(&self, mut ticket: WritebackTicket) -> Result<()> {
        let payload = ticket.take_payload();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        let shared = Arc::clone(&self.shared);
        let file = ticket_file(&ticket);
        let offset = ticket_offset(&ticket);

        let mut none = Vec::new();
        let slot = self.reserve_slot_blocking(&mut none);
        let on_complete: CompleteFn = Box::new(move |status, _segments| {
            finish_writeback(&shared, &ticket, status);
            done2.store(true, Ordering::Release);
        });
        let req = self
            .engine
            .make_request(slot, file, offset, IoDir::Write, payload, on_complete);
        self.engine.submit(vec![req]);

        let mut window = Instant::now();
        while !done.load(Ordering::Acquire) {
            self.wait_some();
            self.advise_stuck(&mut window, "victim write-back");
        }
        Ok(())
    }

    /// Spin until a pinned frame turns valid, draining our own completions.
    ///
    /// Consumes the pin and reports `Io` if the frame's read failed (the
    /// frame itself stays re-readable).
    fn wait_frame_valid(&self, frame: FrameId) -> Result<()> {
        let mut window = Instant::now();
        loop {
            let flags = self.shared.cache.flags(frame);
            if flags.valid {
                return Ok(());
            }
            if !flags.io_pending {
                self.shared.cache.release(frame);
                return Err(CoreError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
            }
            self.wait_some();
            self.advise_stuck(&mut window, "pending page");
        }
    }

    fn wait_some(&self) {
        self.num_waits.fetch_add(1, Ordering::Relaxed);
        self.engine.wait(None, 1);
        std::thread::yield_now();
    }

    /// Advisory backpressure check: surfaces a `Stuck` warning once per
    /// bound-sized window and keeps waiting.
    fn advise_stuck(&self, window: &mut Instant, waiting_on: &str) {
        if window.elapsed() >= self.stuck_after {
            let advisory = CoreError::Stuck {
                waited_ms: window.elapsed().as_millis() as u64,
            };
            warn!(
                target: "spate::io",
                event = "stuck",
                waiting_on = waiting_on,
                advisory = %advisory
            );
            self.stuck_events.fetch_add(1, Ordering::Relaxed);
            *window = Instant::now();
        }
    }
}

fn ticket_file(ticket: &WritebackTicket) -> FileId {
    ticket.loc.file
}

fn ticket_offset(ticket: &WritebackTicket) -> ByteOffset {
    ticket.loc.offset
}

fn finish_writeback(shared: &CacheShared, ticket: &WritebackTicket, status: CompletionStatus) {
    match status {
        CompletionStatus::Done { .. } => shared.cache().complete_writeback(ticket),
        CompletionStatus::Error { errno } => {
            warn!(
                target: "spate::io",
                event = "writeback_failed",
                loc = %ticket.loc,
                errno = errno
            );
            shared.cache().abort_writeback(ticket);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use spate_aio::{Backend, MemStore};
    use spate_types::CachePolicyKind;

    fn config(frames: usize, max_aio: usize) -> CacheConfig {
        CacheConfig {
            policy: CachePolicyKind::Lru2q,
            cache_size: (frames * PAGE_SIZE) as u64,
            max_aio,
            entry_size: 1,
            node_id: None,
            stuck_after: Duration::from_secs(5),
        }
    }

    fn setup(pages: usize, frames: usize, max_aio: usize) -> (MemStore, GlobalCachedIo) {
        let cfg = config(frames, max_aio);
        let store = MemStore::new();
        let file = store.create(pages * PAGE_SIZE);
        let shared = CacheShared::new(&cfg).unwrap();
        let engine = AioEngine::new(Backend::Mem(store.clone()), max_aio, None).unwrap();
        let io = GlobalCachedIo::new(shared, engine, file, &cfg).unwrap();
        (store, io)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    struct ProbeCompute {
        rel_off: usize,
        len: usize,
        captured: Arc<Mutex<Vec<u8>>>,
        ran: Arc<AtomicBool>,
        done: bool,
    }

    impl UserCompute for ProbeCompute {
        fn run(&mut self, view: &PageByteArray<'_>) {
            let mut buf = vec![0_u8; self.len];
            view.copy_out(self.rel_off, &mut buf);
            *self.captured.lock() = buf;
            self.ran.store(true, Ordering::Release);
            self.done = true;
        }

        fn has_completed(&self) -> bool {
            self.done
        }
    }

    fn probe(rel_off: usize, len: usize) -> (Box<ProbeCompute>, Arc<Mutex<Vec<u8>>>, Arc<AtomicBool>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let ran = Arc::new(AtomicBool::new(false));
        (
            Box::new(ProbeCompute {
                rel_off,
                len,
                captured: Arc::clone(&captured),
                ran: Arc::clone(&ran),
                done: false,
            }),
            captured,
            ran,
        )
    }

    #[test]
    fn cold_read_merges_pages_and_warm_read_hits() {
        let (store, io) = setup(8, 8, 16);
        let data = pattern(8 * PAGE_SIZE, 3);
        store.write_raw(io.file(), 0, &data);

        let mut buf = vec![0_u8; 2 * PAGE_SIZE];
        assert_eq!(io.read(&mut buf, ByteOffset::ZERO).unwrap(), buf.len());
        assert_eq!(buf, data[..2 * PAGE_SIZE]);

        // Adjacent cold pages coalesce into a single engine request.
        let stats = io.engine_stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.bytes_read, 2 * PAGE_SIZE as u64);

        let hits_before = io.stats().cache_hits;
        let mut again = vec![0_u8; 2 * PAGE_SIZE];
        io.read(&mut again, ByteOffset::ZERO).unwrap();
        assert_eq!(again, data[..2 * PAGE_SIZE]);
        assert_eq!(io.engine_stats().reads, 1, "warm read must not touch the engine");
        assert!(io.stats().cache_hits > hits_before);
    }

    #[test]
    fn misaligned_and_oversized_requests_are_rejected() {
        let cfg = CacheConfig {
            entry_size: 8,
            ..config(4, 8)
        };
        let store = MemStore::new();
        let file = store.create(4 * PAGE_SIZE);
        let shared = CacheShared::new(&cfg).unwrap();
        let engine = AioEngine::new(Backend::Mem(store), 8, None).unwrap();
        let io = GlobalCachedIo::new(shared, engine, file, &cfg).unwrap();

        let mut buf = vec![0_u8; 16];
        assert!(matches!(
            io.read(&mut buf, ByteOffset(4)),
            Err(CoreError::BadRequest(_))
        ));
        let mut odd = vec![0_u8; 13];
        assert!(matches!(
            io.read(&mut odd, ByteOffset::ZERO),
            Err(CoreError::BadRequest(_))
        ));
        let mut empty = vec![0_u8; 0];
        assert!(matches!(
            io.read(&mut empty, ByteOffset::ZERO),
            Err(CoreError::BadRequest(_))
        ));
        let mut big = vec![0_u8; PAGE_SIZE];
        assert!(matches!(
            io.read(&mut big, ByteOffset((4 * PAGE_SIZE) as u64)),
            Err(CoreError::BadRequest(_))
        ));
    }

    #[test]
    fn partial_write_does_read_modify_write() {
        let (store, io) = setup(4, 4, 8);
        let data = pattern(4 * PAGE_SIZE, 9);
        store.write_raw(io.file(), 0, &data);

        let new_bytes = vec![0xEE_u8; 100];
        assert_eq!(io.write(&new_bytes, ByteOffset(50)).unwrap(), 100);
        assert_eq!(io.engine_stats().reads, 1, "partial write fetches the page");

        let mut page = vec![0_u8; PAGE_SIZE];
        io.read(&mut page, ByteOffset::ZERO).unwrap();
        assert_eq!(&page[..50], &data[..50]);
        assert_eq!(&page[50..150], new_bytes.as_slice());
        assert_eq!(&page[150..], &data[150..PAGE_SIZE]);

        // The backing store only changes on flush.
        assert_eq!(store.read_raw(io.file(), 50, 100), data[50..150].to_vec());
        io.flush().unwrap();
        assert_eq!(store.read_raw(io.file(), 50, 100), new_bytes);
    }

    #[test]
    fn full_page_write_skips_the_read() {
        let (store, io) = setup(4, 4, 8);
        let page = pattern(PAGE_SIZE, 77);
        assert_eq!(
            io.write(&page, ByteOffset((2 * PAGE_SIZE) as u64)).unwrap(),
            PAGE_SIZE
        );
        assert_eq!(io.engine_stats().reads, 0);

        // Reading it back is a pure cache hit.
        let mut back = vec![0_u8; PAGE_SIZE];
        io.read(&mut back, ByteOffset((2 * PAGE_SIZE) as u64)).unwrap();
        assert_eq!(back, page);
        assert_eq!(io.engine_stats().reads, 0);

        io.flush().unwrap();
        assert_eq!(store.read_raw(io.file(), 2 * PAGE_SIZE as u64, PAGE_SIZE), page);
        assert_eq!(io.engine_stats().writes, 1);
    }

    #[test]
    fn dirty_eviction_flushes_before_reuse() {
        // Two frames, both dirtied: the next miss must write one back
        // before stealing its frame, and the written page must read back
        // intact afterwards.
        let (store, io) = setup(8, 2, 8);
        let base = pattern(8 * PAGE_SIZE, 1);
        store.write_raw(io.file(), 0, &base);

        let page0 = pattern(PAGE_SIZE, 100);
        let page1 = pattern(PAGE_SIZE, 101);
        io.write(&page0, ByteOffset::ZERO).unwrap();
        io.write(&page1, ByteOffset(PAGE_SIZE as u64)).unwrap();

        // Cold page 2 forces eviction of a dirty frame.
        let mut buf = vec![0_u8; PAGE_SIZE];
        io.read(&mut buf, ByteOffset((2 * PAGE_SIZE) as u64)).unwrap();
        assert_eq!(buf, base[2 * PAGE_SIZE..3 * PAGE_SIZE]);
        assert!(io.engine_stats().writes >= 1, "dirty victim was flushed");

        // The evicted page reads back with its written content.
        let mut back = vec![0_u8; PAGE_SIZE];
        io.read(&mut back, ByteOffset::ZERO).unwrap();
        assert_eq!(back, page0);
        let metrics = io.cache_metrics();
        assert!(metrics.writebacks >= 1);
    }

    #[test]
    fn concurrent_readers_share_one_device_read() {
        let cfg = config(8, 8);
        let store = MemStore::new();
        let file = store.create(4 * PAGE_SIZE);
        let data = pattern(4 * PAGE_SIZE, 42);
        store.write_raw(file, 0, &data);
        let shared = CacheShared::new(&cfg).unwrap();

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let engine = AioEngine::new(Backend::Mem(store.clone()), 8, None).unwrap();
            let io = GlobalCachedIo::new(Arc::clone(&shared), engine, file, &cfg).unwrap();
            let barrier = Arc::clone(&barrier);
            let expect = data[..PAGE_SIZE].to_vec();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                let mut buf = vec![0_u8; PAGE_SIZE];
                io.read(&mut buf, ByteOffset::ZERO).unwrap();
                assert_eq!(buf, expect);
                io.engine_stats().reads
            }));
        }
        let total_reads: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total_reads, 1, "exactly one underlying read for one page");
    }

    #[test]
    fn io_error_surfaces_then_reissue_succeeds() {
        let (store, io) = setup(8, 8, 8);
        let data = pattern(8 * PAGE_SIZE, 5);
        store.write_raw(io.file(), 0, &data);

        let loc = PageLocation::containing(io.file(), ByteOffset((3 * PAGE_SIZE) as u64));
        store.inject_read_error(loc);

        let mut buf = vec![0_u8; PAGE_SIZE];
        assert!(matches!(
            io.read(&mut buf, ByteOffset((3 * PAGE_SIZE) as u64)),
            Err(CoreError::Io(_))
        ));
        assert_eq!(io.engine_stats().errors, 1);

        // The frame is invalid, not poisoned: the next read re-issues.
        io.read(&mut buf, ByteOffset((3 * PAGE_SIZE) as u64)).unwrap();
        assert_eq!(buf, data[3 * PAGE_SIZE..4 * PAGE_SIZE]);
        // Two engine round-trips happened: the failed one and the re-issue.
        assert_eq!(io.engine_stats().completions, 2);
        assert_eq!(io.engine_stats().reads, 1);
        assert_eq!(io.shared().cache().total_pins(), 0);
    }

    #[test]
    fn batch_compute_runs_inline_on_full_hit() {
        let (store, io) = setup(4, 4, 8);
        let data = pattern(4 * PAGE_SIZE, 8);
        store.write_raw(io.file(), 0, &data);

        io.preload(ByteOffset::ZERO, 2 * PAGE_SIZE).unwrap();
        let (compute, captured, ran) = probe(10, 64);
        io.access_batch(vec![ComputeRequest {
            offset: ByteOffset::ZERO,
            len: 2 * PAGE_SIZE,
            compute,
        }])
        .unwrap();

        // All pages were resident: the computation ran inline, before any
        // drain.
        assert!(ran.load(Ordering::Acquire));
        assert_eq!(*captured.lock(), data[10..74].to_vec());
        assert_eq!(io.shared().cache().total_pins(), 0);
    }

    #[test]
    fn batch_compute_runs_on_completion_after_miss() {
        let (store, io) = setup(4, 4, 8);
        let data = pattern(4 * PAGE_SIZE, 21);
        store.write_raw(io.file(), 0, &data);

        let (compute, captured, ran) = probe(PAGE_SIZE + 8, 16);
        io.access_batch(vec![ComputeRequest {
            offset: ByteOffset::ZERO,
            len: 2 * PAGE_SIZE,
            compute,
        }])
        .unwrap();
        assert!(!ran.load(Ordering::Acquire), "misses defer the computation");

        io.drain(1);
        assert!(ran.load(Ordering::Acquire));
        assert_eq!(
            *captured.lock(),
            data[PAGE_SIZE + 8..PAGE_SIZE + 24].to_vec()
        );
        assert_eq!(io.shared().cache().total_pins(), 0);
    }

    #[test]
    fn batch_compute_on_faulted_page_is_discarded() {
        let (store, io) = setup(4, 4, 8);
        let loc = PageLocation::containing(io.file(), ByteOffset::ZERO);
        store.inject_read_error(loc);

        let outcomes: Arc<Mutex<Vec<RequestOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        assert!(io.set_callback(Arc::new(move |outcome: &RequestOutcome| {
            sink.lock().push(*outcome);
        })));

        let (compute, _captured, ran) = probe(0, 8);
        io.access_batch(vec![ComputeRequest {
            offset: ByteOffset::ZERO,
            len: PAGE_SIZE,
            compute,
        }])
        .unwrap();
        io.drain(1);

        assert!(!ran.load(Ordering::Acquire), "failed computation never runs");
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0].status,
            CompletionStatus::Error { errno: libc::EIO }
        ));
        assert_eq!(io.shared().cache().total_pins(), 0, "pins released on discard");

        // A later plain read re-issues the I/O and succeeds.
        let mut buf = vec![0_u8; PAGE_SIZE];
        io.read(&mut buf, ByteOffset::ZERO).unwrap();
    }

    #[test]
    fn batch_callback_reports_success() {
        let (store, io) = setup(4, 4, 8);
        store.write_raw(io.file(), 0, &pattern(4 * PAGE_SIZE, 2));

        let outcomes: Arc<Mutex<Vec<RequestOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        io.set_callback(Arc::new(move |outcome: &RequestOutcome| {
            sink.lock().push(*outcome);
        }));

        let (compute, _captured, _ran) = probe(0, 8);
        io.access_batch(vec![ComputeRequest {
            offset: ByteOffset((2 * PAGE_SIZE) as u64),
            len: PAGE_SIZE,
            compute,
        }])
        .unwrap();
        io.drain(1);

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].offset, ByteOffset((2 * PAGE_SIZE) as u64));
        assert_eq!(outcomes[0].len, PAGE_SIZE);
        assert!(outcomes[0].status.is_ok());
    }

    #[test]
    fn preload_warms_without_copying() {
        let (store, io) = setup(8, 8, 8);
        let data = pattern(8 * PAGE_SIZE, 14);
        store.write_raw(io.file(), 0, &data);

        assert_eq!(io.preload(ByteOffset::ZERO, 4 * PAGE_SIZE).unwrap(), 4);
        assert_eq!(io.engine_stats().reads, 1, "contiguous preload is one request");

        let reads_before = io.engine_stats().reads;
        let mut buf = vec![0_u8; 4 * PAGE_SIZE];
        io.read(&mut buf, ByteOffset::ZERO).unwrap();
        assert_eq!(buf, data[..4 * PAGE_SIZE]);
        assert_eq!(io.engine_stats().reads, reads_before, "preloaded pages hit");
    }

    #[test]
    fn misaligned_batch_request_is_rejected() {
        let (_store, io) = setup(4, 4, 8);
        let (compute, _c, _r) = probe(0, 8);
        assert!(matches!(
            io.access_batch(vec![ComputeRequest {
                offset: ByteOffset(17),
                len: PAGE_SIZE,
                compute,
            }]),
            Err(CoreError::BadRequest(_))
        ));
        let (compute, _c, _r) = probe(0, 8);
        assert!(matches!(
            io.access_batch(vec![ComputeRequest {
                offset: ByteOffset::ZERO,
                len: 100,
                compute,
            }]),
            Err(CoreError::BadRequest(_))
        ));
    }
}
