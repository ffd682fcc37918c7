#![forbid(unsafe_code)]
//! Asynchronous block I/O engine with a bounded pool of in-flight control
//! blocks.
//!
//! The engine models kernel async I/O semantics (bounded submission queue,
//! completions reaped by an explicit wait, callbacks run in the reaper's
//! context) over pluggable storage backends:
//!
//! - **[`Backend::File`]**: positional `pread`/`pwrite` through
//!   `std::os::unix::fs::FileExt`, optionally opened with `O_DIRECT`.
//!   Operations execute at submission time and their completions are parked
//!   until [`AioEngine::wait`] reaps them, preserving the submit/reap shape
//!   of the kernel interface without per-operation threads.
//! - **[`Backend::Mem`]**: byte-vector backing for tests and benchmarks,
//!   with one-shot read fault injection.
//!
//! Buffers *move* through the engine: the caller hands page segments to a
//! control block, the backend fills (or consumes) them, and the completion
//! callback receives them back. No aliasing, no raw pointers.

use parking_lot::Mutex;
use spate_error::{CoreError, Result};
use spate_pool::Pool;
use spate_types::{ByteOffset, FileId, IoDir, PageBuf, PageLocation, PAGE_SIZE};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Outcome of one I/O request, delivered to its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The full byte count was transferred.
    Done { bytes: usize },
    /// The backend failed with the given errno.
    Error { errno: i32 },
}

impl CompletionStatus {
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Completion callback attached to a control block.
///
/// Runs in the context of [`AioEngine::wait`] on the submitting thread and
/// receives the request's segments back.
pub type CompleteFn = Box<dyn FnOnce(CompletionStatus, Vec<PageBuf>) + Send>;

/// A prepared I/O request occupying one engine slot.
///
/// Dropping an unsubmitted control block returns its slot.
pub struct ControlBlock {
    file: FileId,
    offset: ByteOffset,
    dir: IoDir,
    segments: Vec<PageBuf>,
    on_complete: CompleteFn,
    slot: SlotToken,
}

impl ControlBlock {
    #[must_use]
    pub fn file(&self) -> FileId {
        self.file
    }

    #[must_use]
    pub fn offset(&self) -> ByteOffset {
        self.offset
    }

    #[must_use]
    pub fn dir(&self) -> IoDir {
        self.dir
    }

    /// Total request length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len() * PAGE_SIZE
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("file", &self.file)
            .field("offset", &self.offset)
            .field("dir", &self.dir)
            .field("segments", &self.segments.len())
            .finish_non_exhaustive()
    }
}

/// RAII slot reservation against the engine's control block pool.
///
/// Obtained from [`AioEngine::reserve_slot`]; dropping it unused returns
/// the slot. Reserving before building a request keeps buffer ownership
/// simple: once a reservation exists, attaching segments cannot fail for
/// resource reasons.
pub struct SlotReservation {
    token: SlotToken,
}

impl std::fmt::Debug for SlotReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotReservation").finish_non_exhaustive()
    }
}

struct SlotToken {
    pool: Option<Pool<()>>,
}

impl SlotToken {
    fn disarm(mut self) {
        self.pool = None;
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(());
        }
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Total read requests executed.
    pub reads: u64,
    /// Total write requests executed.
    pub writes: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Total submission batches.
    pub batches: u64,
    /// Total completions reaped.
    pub completions: u64,
    /// Completions that carried an error status.
    pub errors: u64,
}

// ── File-backed storage ────────────────────────────────────────────────────

#[derive(Debug)]
struct OpenFile {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

/// Registry of files opened for engine I/O.
///
/// Shared across engines so multiple worker threads can address the same
/// `FileId` space.
#[derive(Debug, Clone, Default)]
pub struct FileStore {
    inner: Arc<FileStoreInner>,
}

#[derive(Debug, Default)]
struct FileStoreInner {
    files: Mutex<HashMap<FileId, OpenFile>>,
    next_id: AtomicU32,
}

impl FileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file for engine I/O.
    ///
    /// Opens read-write if possible, read-only otherwise. With `direct`,
    /// the file is opened `O_DIRECT`; all engine buffers are page-aligned
    /// page multiples, which satisfies the alignment contract.
    pub fn open(&self, path: impl AsRef<Path>, direct: bool) -> Result<FileId> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if direct {
            opts.custom_flags(libc::O_DIRECT);
        }
        let (file, writable) = match opts.open(path.as_ref()) {
            Ok(file) => (file, true),
            Err(_) => {
                let mut ro = OpenOptions::new();
                ro.read(true);
                if direct {
                    ro.custom_flags(libc::O_DIRECT);
                }
                (
                    ro.open(path.as_ref())
                        .map_err(|err| CoreError::Init(format!("open failed: {err}")))?,
                    false,
                )
            }
        };
        let len = file
            .metadata()
            .map_err(|err| CoreError::Init(format!("stat failed: {err}")))?
            .len();
        let id = FileId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.files.lock().insert(
            id,
            OpenFile {
                file: Arc::new(file),
                len,
                writable,
            },
        );
        debug!(
            target: "spate::aio",
            event = "file_open",
            file = id.0,
            len = len,
            direct = direct,
            writable = writable
        );
        Ok(id)
    }

    /// Length of a registered file in bytes.
    pub fn len(&self, file: FileId) -> Result<u64> {
        self.inner
            .files
            .lock()
            .get(&file)
            .map(|f| f.len)
            .ok_or_else(|| CoreError::BadRequest(format!("unknown {file}")))
    }

    fn handle(&self, file: FileId) -> Option<(Arc<File>, u64, bool)> {
        self.inner
            .files
            .lock()
            .get(&file)
            .map(|f| (Arc::clone(&f.file), f.len, f.writable))
    }
}

// ── In-memory storage ──────────────────────────────────────────────────────

/// In-memory backing store for tests and benchmarks.
///
/// Cloning shares the store, so several engines (one per worker thread) can
/// operate on the same files. Read faults can be injected per page and fire
/// once.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<MemStoreInner>,
}

#[derive(Debug, Default)]
struct MemStoreInner {
    files: Mutex<HashMap<FileId, Vec<u8>>>,
    read_faults: Mutex<HashSet<PageLocation>>,
    next_id: AtomicU32,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-filled in-memory file of `len` bytes.
    pub fn create(&self, len: usize) -> FileId {
        let id = FileId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.files.lock().insert(id, vec![0_u8; len]);
        id
    }

    /// Write raw bytes, bypassing the engine. Test setup only.
    pub fn write_raw(&self, file: FileId, offset: u64, bytes: &[u8]) {
        let mut files = self.inner.files.lock();
        let data = files.get_mut(&file).expect("unknown mem file");
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Read raw bytes, bypassing the engine. Test assertions only.
    #[must_use]
    pub fn read_raw(&self, file: FileId, offset: u64, len: usize) -> Vec<u8> {
        let files = self.inner.files.lock();
        let data = files.get(&file).expect("unknown mem file");
        let start = offset as usize;
        data[start..start + len].to_vec()
    }

    pub fn len(&self, file: FileId) -> Result<u64> {
        self.inner
            .files
            .lock()
            .get(&file)
            .map(|data| data.len() as u64)
            .ok_or_else(|| CoreError::BadRequest(format!("unknown {file}")))
    }

    /// Arm a one-shot read fault: the next read covering this page fails
    /// with `EIO`.
    pub fn inject_read_error(&self, loc: PageLocation) {
        self.inner.read_faults.lock().insert(loc);
    }

    fn take_fault_in_range(&self, file: FileId, offset: u64, len: usize) -> bool {
        let mut faults = self.inner.read_faults.lock();
        if faults.is_empty() {
            return false;
        }
        let end = offset + len as u64;
        let hit = faults
            .iter()
            .copied()
            .find(|loc| loc.file == file && loc.offset.0 >= offset && loc.offset.0 < end);
        if let Some(loc) = hit {
            faults.remove(&loc);
            return true;
        }
        false
    }
}

// ── Backend dispatch ───────────────────────────────────────────────────────

/// Storage backend for an engine. Closed set; enum-dispatched.
#[derive(Debug, Clone)]
pub enum Backend {
    File(FileStore),
    Mem(MemStore),
}

impl Backend {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "pread/pwrite",
            Self::Mem(_) => "memory",
        }
    }

    /// Length of a file addressed by this backend.
    pub fn file_len(&self, file: FileId) -> Result<u64> {
        match self {
            Self::File(store) => store.len(file),
            Self::Mem(store) => store.len(file),
        }
    }

    fn execute(
        &self,
        file: FileId,
        offset: ByteOffset,
        dir: IoDir,
        segments: &mut [PageBuf],
    ) -> CompletionStatus {
        let total = segments.len() * PAGE_SIZE;
        let Ok(len) = self.file_len(file) else {
            return CompletionStatus::Error { errno: libc::EBADF };
        };
        if offset.0 + total as u64 > len {
            return CompletionStatus::Error {
                errno: libc::EINVAL,
            };
        }

        match self {
            Self::File(store) => {
                let Some((handle, _, writable)) = store.handle(file) else {
                    return CompletionStatus::Error { errno: libc::EBADF };
                };
                if matches!(dir, IoDir::Write) && !writable {
                    return CompletionStatus::Error {
                        errno: libc::EACCES,
                    };
                }
                for (i, seg) in segments.iter_mut().enumerate() {
                    let seg_off = offset.0 + (i * PAGE_SIZE) as u64;
                    let res = match dir {
                        IoDir::Read => handle.read_exact_at(seg.as_mut_slice(), seg_off),
                        IoDir::Write => handle.write_all_at(seg.as_slice(), seg_off),
                    };
                    if let Err(err) = res {
                        return CompletionStatus::Error {
                            errno: err.raw_os_error().unwrap_or(libc::EIO),
                        };
                    }
                }
                CompletionStatus::Done { bytes: total }
            }
            Self::Mem(store) => {
                if matches!(dir, IoDir::Read)
                    && store.take_fault_in_range(file, offset.0, total)
                {
                    return CompletionStatus::Error { errno: libc::EIO };
                }
                let mut files = store.inner.files.lock();
                let Some(data) = files.get_mut(&file) else {
                    return CompletionStatus::Error { errno: libc::EBADF };
                };
                for (i, seg) in segments.iter_mut().enumerate() {
                    let start = offset.0 as usize + i * PAGE_SIZE;
                    match dir {
                        IoDir::Read => {
                            seg.as_mut_slice()
                                .copy_from_slice(&data[start..start + PAGE_SIZE]);
                        }
                        IoDir::Write => {
                            data[start..start + PAGE_SIZE].copy_from_slice(seg.as_slice());
                        }
                    }
                }
                CompletionStatus::Done { bytes: total }
            }
        }
    }
}

// ── Engine ─────────────────────────────────────────────────────────────────

struct ReadyCompletion {
    status: CompletionStatus,
    segments: Vec<PageBuf>,
    on_complete: CompleteFn,
}

/// Asynchronous block I/O engine.
///
/// One engine per worker thread; the backend may be shared. The engine has
/// no internal threads: backends execute at submission and completions are
/// delivered strictly in submission order during [`wait`](Self::wait).
pub struct AioEngine {
    backend: Backend,
    slots: Pool<()>,
    ready: Mutex<VecDeque<ReadyCompletion>>,
    busy: AtomicUsize,
    max_aio: usize,
    stats: Mutex<EngineStats>,
}

impl std::fmt::Debug for AioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioEngine")
            .field("backend", &self.backend.name())
            .field("max_aio", &self.max_aio)
            .field("busy", &self.busy_count())
            .finish_non_exhaustive()
    }
}

impl AioEngine {
    /// Construct an engine with `max_aio` in-flight slots.
    ///
    /// This is the only fatal failure point of the engine; everything after
    /// construction reports errors through completion statuses.
    pub fn new(backend: Backend, max_aio: usize, node_id: Option<u32>) -> Result<Self> {
        if max_aio == 0 {
            return Err(CoreError::Init("max_aio must be non-zero".to_owned()));
        }
        debug!(
            target: "spate::aio",
            event = "engine_init",
            backend = backend.name(),
            max_aio = max_aio,
            node_id = node_id.map_or(-1_i64, i64::from)
        );
        Ok(Self {
            backend,
            slots: Pool::new(max_aio, node_id, || ()),
            ready: Mutex::new(VecDeque::new()),
            busy: AtomicUsize::new(0),
            max_aio,
            stats: Mutex::new(EngineStats::default()),
        })
    }

    #[must_use]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Whether completions are delivered asynchronously through `wait`.
    #[must_use]
    pub fn supports_async(&self) -> bool {
        true
    }

    /// Reserve one in-flight slot.
    ///
    /// Fails with `OutOfSlots` when the control block pool is exhausted;
    /// the caller must drain completions and retry.
    pub fn reserve_slot(&self) -> Result<SlotReservation> {
        if self.slots.acquire().is_none() {
            return Err(CoreError::OutOfSlots);
        }
        Ok(SlotReservation {
            token: SlotToken {
                pool: Some(self.slots.clone()),
            },
        })
    }

    /// Build a single-page request on a reserved slot.
    pub fn make_request(
        &self,
        slot: SlotReservation,
        file: FileId,
        offset: ByteOffset,
        dir: IoDir,
        segment: PageBuf,
        on_complete: CompleteFn,
    ) -> ControlBlock {
        self.make_iovec_request(slot, file, offset, dir, vec![segment], on_complete)
    }

    /// Build a scatter/gather request over page segments covering the
    /// contiguous byte range starting at `offset`.
    ///
    /// The offset must be page-aligned and `segments` non-empty; both are
    /// request-construction bugs, not runtime conditions, hence the
    /// assertions.
    pub fn make_iovec_request(
        &self,
        slot: SlotReservation,
        file: FileId,
        offset: ByteOffset,
        dir: IoDir,
        segments: Vec<PageBuf>,
        on_complete: CompleteFn,
    ) -> ControlBlock {
        assert!(!segments.is_empty(), "empty request");
        assert!(
            offset.is_page_aligned(),
            "request offset {offset} not page-aligned"
        );
        ControlBlock {
            file,
            offset,
            dir,
            segments,
            on_complete,
            slot: slot.token,
        }
    }

    /// Remaining submission budget.
    #[must_use]
    pub fn max_io_slot(&self) -> usize {
        self.slots.available()
    }

    /// Requests submitted and not yet reaped.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Submit a batch of control blocks.
    ///
    /// Returns how many were accepted. The synchronous backends accept every
    /// request whose slot was already reserved, execute it immediately, and
    /// park its completion for [`wait`](Self::wait); a partial count means
    /// the caller must retry the tail after draining.
    pub fn submit(&self, requests: Vec<ControlBlock>) -> usize {
        if requests.is_empty() {
            return 0;
        }
        let accepted = requests.len();
        {
            let mut stats = self.stats.lock();
            stats.batches += 1;
        }
        trace!(
            target: "spate::aio",
            event = "submit",
            batch = accepted,
            busy = self.busy_count()
        );
        for req in requests {
            let ControlBlock {
                file,
                offset,
                dir,
                mut segments,
                on_complete,
                slot,
            } = req;
            self.busy.fetch_add(1, Ordering::AcqRel);
            let status = self.backend.execute(file, offset, dir, &mut segments);
            {
                let mut stats = self.stats.lock();
                match (dir, status) {
                    (IoDir::Read, CompletionStatus::Done { bytes }) => {
                        stats.reads += 1;
                        stats.bytes_read += bytes as u64;
                    }
                    (IoDir::Write, CompletionStatus::Done { bytes }) => {
                        stats.writes += 1;
                        stats.bytes_written += bytes as u64;
                    }
                    (_, CompletionStatus::Error { .. }) => {}
                }
            }
            if let CompletionStatus::Error { errno } = status {
                warn!(
                    target: "spate::aio",
                    event = "io_error",
                    file = file.0,
                    offset = offset.0,
                    dir = ?dir,
                    errno = errno
                );
            }
            // The slot stays reserved until the completion is reaped.
            slot.disarm();
            self.ready.lock().push_back(ReadyCompletion {
                status,
                segments,
                on_complete,
            });
        }
        accepted
    }

    /// Reap parked completions, invoking each callback in submission order.
    ///
    /// Returns the number reaped. `min_completions` expresses how many the
    /// caller needs; the synchronous backends have already materialized
    /// every outstanding completion, so `wait` never blocks and `_timeout`
    /// exists to keep the kernel-interface shape (a timeout expiring with
    /// fewer than `min_completions` available is indistinguishable from
    /// this immediate return).
    pub fn wait(&self, _timeout: Option<Duration>, min_completions: usize) -> usize {
        let mut reaped = 0_usize;
        loop {
            let Some(completion) = self.ready.lock().pop_front() else {
                break;
            };
            let ReadyCompletion {
                status,
                segments,
                on_complete,
            } = completion;
            {
                let mut stats = self.stats.lock();
                stats.completions += 1;
                if !status.is_ok() {
                    stats.errors += 1;
                }
            }
            (on_complete)(status, segments);
            self.busy.fetch_sub(1, Ordering::AcqRel);
            self.slots.release(());
            reaped += 1;
        }
        if reaped < min_completions {
            trace!(
                target: "spate::aio",
                event = "wait_short",
                reaped = reaped,
                min = min_completions
            );
        }
        reaped
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        *self.stats.lock()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn engine_with_mem(pages: usize, max_aio: usize) -> (AioEngine, MemStore, FileId) {
        let store = MemStore::new();
        let file = store.create(pages * PAGE_SIZE);
        let engine = AioEngine::new(Backend::Mem(store.clone()), max_aio, None).unwrap();
        (engine, store, file)
    }

    fn read_req(engine: &AioEngine, file: FileId, offset: ByteOffset, cb: CompleteFn) -> ControlBlock {
        let slot = engine.reserve_slot().unwrap();
        engine.make_request(slot, file, offset, IoDir::Read, PageBuf::zeroed(), cb)
    }

    #[test]
    fn read_delivers_backing_bytes_in_wait() {
        let (engine, store, file) = engine_with_mem(4, 8);
        store.write_raw(file, 0, &[7_u8; PAGE_SIZE]);

        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = Arc::clone(&seen);
        let req = read_req(
            &engine,
            file,
            ByteOffset::ZERO,
            Box::new(move |status, segments| {
                assert_eq!(status, CompletionStatus::Done { bytes: PAGE_SIZE });
                assert!(segments[0].as_slice().iter().all(|&b| b == 7));
                seen2.store(true, Ordering::Release);
            }),
        );

        assert_eq!(engine.submit(vec![req]), 1);
        // The callback must not run before wait.
        assert!(!seen.load(Ordering::Acquire));
        assert_eq!(engine.busy_count(), 1);

        assert_eq!(engine.wait(None, 1), 1);
        assert!(seen.load(Ordering::Acquire));
        assert_eq!(engine.busy_count(), 0);
    }

    #[test]
    fn iovec_write_then_read_roundtrip() {
        let (engine, store, file) = engine_with_mem(4, 8);

        let mut seg0 = PageBuf::zeroed();
        seg0.as_mut_slice().fill(1);
        let mut seg1 = PageBuf::zeroed();
        seg1.as_mut_slice().fill(2);

        let slot = engine.reserve_slot().unwrap();
        let req = engine.make_iovec_request(
            slot,
            file,
            ByteOffset(PAGE_SIZE as u64),
            IoDir::Write,
            vec![seg0, seg1],
            Box::new(|status, _| {
                assert!(status.is_ok());
            }),
        );
        engine.submit(vec![req]);
        engine.wait(None, 1);

        assert_eq!(store.read_raw(file, PAGE_SIZE as u64, 1), vec![1]);
        assert_eq!(store.read_raw(file, 2 * PAGE_SIZE as u64, 1), vec![2]);
        let stats = engine.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_written, 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn slot_budget_is_enforced_and_recycled() {
        let (engine, _store, file) = engine_with_mem(8, 2);
        assert_eq!(engine.max_io_slot(), 2);

        let a = read_req(&engine, file, ByteOffset::ZERO, Box::new(|_, _| {}));
        let b = read_req(&engine, file, ByteOffset::ZERO, Box::new(|_, _| {}));
        assert!(matches!(engine.reserve_slot(), Err(CoreError::OutOfSlots)));
        assert_eq!(engine.max_io_slot(), 0);

        engine.submit(vec![a, b]);
        // Slots stay occupied until reaped.
        assert!(matches!(engine.reserve_slot(), Err(CoreError::OutOfSlots)));
        assert_eq!(engine.wait(None, 2), 2);
        assert_eq!(engine.max_io_slot(), 2);

        // Dropping an unsubmitted request also frees its slot.
        let c = read_req(&engine, file, ByteOffset::ZERO, Box::new(|_, _| {}));
        drop(c);
        assert_eq!(engine.max_io_slot(), 2);
    }

    #[test]
    fn completions_reaped_in_submission_order() {
        let (engine, _store, file) = engine_with_mem(8, 8);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut batch = Vec::new();
        for i in 0..4_u64 {
            let order = Arc::clone(&order);
            batch.push(read_req(
                &engine,
                file,
                ByteOffset(i * PAGE_SIZE as u64),
                Box::new(move |_, _| order.lock().push(i)),
            ));
        }
        engine.submit(batch);
        engine.wait(None, 4);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn out_of_bounds_read_reports_einval() {
        let (engine, _store, file) = engine_with_mem(1, 4);
        let req = read_req(
            &engine,
            file,
            ByteOffset(PAGE_SIZE as u64),
            Box::new(|status, _| {
                assert_eq!(
                    status,
                    CompletionStatus::Error {
                        errno: libc::EINVAL
                    }
                );
            }),
        );
        engine.submit(vec![req]);
        assert_eq!(engine.wait(None, 1), 1);
        assert_eq!(engine.stats().errors, 1);
    }

    #[test]
    fn injected_fault_fires_once() {
        let (engine, store, file) = engine_with_mem(4, 8);
        let loc = PageLocation::containing(file, ByteOffset(2 * PAGE_SIZE as u64));
        store.inject_read_error(loc);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let statuses = Arc::clone(&statuses);
            let req = read_req(
                &engine,
                file,
                loc.offset,
                Box::new(move |status, _| statuses.lock().push(status)),
            );
            engine.submit(vec![req]);
            engine.wait(None, 1);
        }
        let statuses = statuses.lock();
        assert_eq!(statuses[0], CompletionStatus::Error { errno: libc::EIO });
        assert!(statuses[1].is_ok());
    }

    #[test]
    fn file_backend_roundtrip_via_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.img");
        std::fs::write(&path, vec![0_u8; 4 * PAGE_SIZE]).unwrap();

        let store = FileStore::new();
        let file = store.open(&path, false).unwrap();
        let engine = AioEngine::new(Backend::File(store), 4, None).unwrap();

        let mut seg = PageBuf::zeroed();
        seg.as_mut_slice().fill(0x5A);
        let slot = engine.reserve_slot().unwrap();
        let write = engine.make_request(
            slot,
            file,
            ByteOffset(PAGE_SIZE as u64),
            IoDir::Write,
            seg,
            Box::new(|status, _| assert!(status.is_ok())),
        );
        engine.submit(vec![write]);
        engine.wait(None, 1);

        let read = read_req(
            &engine,
            file,
            ByteOffset(PAGE_SIZE as u64),
            Box::new(|status, segments| {
                assert!(status.is_ok());
                assert!(segments[0].as_slice().iter().all(|&b| b == 0x5A));
            }),
        );
        engine.submit(vec![read]);
        assert_eq!(engine.wait(None, 1), 1);
    }

    #[test]
    fn zero_slots_is_an_init_failure() {
        let store = MemStore::new();
        assert!(matches!(
            AioEngine::new(Backend::Mem(store), 0, None),
            Err(CoreError::Init(_))
        ));
    }
}
