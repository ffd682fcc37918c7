#![forbid(unsafe_code)]
//! Key-value batch dispatcher over cached asynchronous I/O.
//!
//! A [`KvStore`] buffers user tasks in a min-heap keyed by entry index and,
//! on [`flush_requests`](KvStore::flush_requests), merges them into the
//! minimum number of page-aligned read requests: a task whose target pages
//! are already covered joins the pending request; a task whose last page is
//! exactly the next page extends the request by that one page; anything
//! farther starts a new request. The one-page extension limit bounds
//! coalescing across sparse gaps.
//!
//! Each merged request carries a [`KvCompute`] that is re-entered when the
//! whole range is resident and applies every subsumed task to the fetched
//! bytes. The store serves one thread; the I/O handle underneath does the
//! cross-thread coordination.

use spate_error::Result;
use spate_io::{ComputeRequest, GlobalCachedIo, PageByteArray, UserCompute};
use spate_pool::Pool;
use spate_types::{ceil_to_page, floor_to_page, ByteOffset, PAGE_SIZE};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::trace;

/// Capacity of the recycled task-vector pool.
const COMPUTE_POOL_SIZE: usize = 256;

/// One unit of user work over a contiguous run of values.
pub trait KvTask: Send + 'static {
    /// Index of the first value, in units of the store's entry size.
    fn index(&self) -> u64;

    /// Number of consecutive values this task covers.
    fn num_entries(&self) -> u32;

    /// Apply the task to its `num_entries * entry_size` bytes.
    fn run(&mut self, values: &[u8]);
}

/// Heap adapter ordering tasks by ascending index.
struct ByIndex<T>(T);

impl<T: KvTask> PartialEq for ByIndex<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.index() == other.0.index()
    }
}

impl<T: KvTask> Eq for ByIndex<T> {}

impl<T: KvTask> PartialOrd for ByIndex<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T: KvTask> Ord for ByIndex<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.index().cmp(&other.0.index())
    }
}

/// Computation attached to one merged read: the ordered tasks it subsumes.
struct KvCompute<T: KvTask> {
    tasks: Vec<T>,
    entry_size: usize,
    has_run: bool,
    /// Pool to return the task vector's storage to; `None` for vectors
    /// allocated past the pool's bound.
    pool: Option<Pool<Vec<T>>>,
}

impl<T: KvTask> UserCompute for KvCompute<T> {
    fn run(&mut self, view: &PageByteArray<'_>) {
        let entry = self.entry_size as u64;
        let first_entry = view.offset() / entry;
        let end_entry = (view.offset() + view.size() as u64) / entry;
        let mut scratch = Vec::new();
        for task in &mut self.tasks {
            let idx = task.index();
            debug_assert!(
                idx >= first_entry && idx < end_entry,
                "task {idx} outside view entries [{first_entry}, {end_entry})"
            );
            let bytes = task.num_entries() as usize * self.entry_size;
            scratch.resize(bytes, 0);
            view.copy_out(((idx - first_entry) as usize) * self.entry_size, &mut scratch);
            task.run(&scratch);
        }
        self.has_run = true;
    }

    fn has_completed(&self) -> bool {
        self.has_run
    }
}

impl<T: KvTask> Drop for KvCompute<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let mut storage = std::mem::take(&mut self.tasks);
            storage.clear();
            pool.release(storage);
        }
    }
}

/// Simple key-value store over a single cached file.
///
/// Values are fixed-size (the handle's `entry_size`, a divisor of
/// `PAGE_SIZE`); tasks are executed asynchronously. One store serves one
/// thread.
pub struct KvStore<T: KvTask> {
    io: Arc<GlobalCachedIo>,
    entry_size: usize,
    tasks: BinaryHeap<Reverse<ByIndex<T>>>,
    pool: Pool<Vec<T>>,
}

impl<T: KvTask> KvStore<T> {
    /// Create a store over `io`; the entry size and pool locality come from
    /// the handle's configuration.
    #[must_use]
    pub fn new(io: Arc<GlobalCachedIo>) -> Self {
        let entry_size = io.entry_size();
        debug_assert_eq!(PAGE_SIZE % entry_size, 0);
        let pool = Pool::new(COMPUTE_POOL_SIZE, io.node_id(), Vec::new);
        Self {
            io,
            entry_size,
            tasks: BinaryHeap::new(),
            pool,
        }
    }

    /// Number of tasks buffered and not yet flushed.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Queue a task for asynchronous execution.
    pub fn async_request(&mut self, task: T) {
        self.tasks.push(Reverse(ByIndex(task)));
    }

    /// Merge all buffered tasks into page-aligned reads and submit them as
    /// one batch.
    pub fn flush_requests(&mut self) -> Result<()> {
        let Some(Reverse(ByIndex(top))) = self.tasks.pop() else {
            return Ok(());
        };
        let entry = self.entry_size as u64;
        let mut requests: Vec<ComputeRequest> = Vec::new();

        // Offsets of the first page covered and of the page after the last
        // one covered by the pending request.
        let mut first_off = floor_to_page(top.index() * entry);
        let mut last_off = ceil_to_page((top.index() + u64::from(top.num_entries())) * entry);
        let (mut batch, mut batch_pooled) = self.acquire_storage();
        batch.push(top);

        while let Some(Reverse(ByIndex(task))) = self.tasks.pop() {
            let end_off = ceil_to_page((task.index() + u64::from(task.num_entries())) * entry);
            // Task lands on pages the pending request already covers.
            if end_off <= last_off {
                batch.push(task);
                continue;
            }
            // Task ends on the page right behind the covered range: extend
            // the request by exactly that one page.
            if end_off == last_off + PAGE_SIZE as u64 {
                last_off = end_off;
                batch.push(task);
                continue;
            }
            // Too far: finalize the pending request, start a new one.
            requests.push(self.build_request(first_off, last_off, batch, batch_pooled));
            let (fresh, fresh_pooled) = self.acquire_storage();
            batch = fresh;
            batch_pooled = fresh_pooled;
            first_off = floor_to_page(task.index() * entry);
            last_off = end_off;
            batch.push(task);
        }

        debug_assert!(!batch.is_empty());
        requests.push(self.build_request(first_off, last_off, batch, batch_pooled));
        trace!(
            target: "spate::kv",
            event = "flush_requests",
            requests = requests.len()
        );
        self.io.access_batch(requests)
    }

    /// Drain completions of the underlying handle, running finished
    /// computations.
    pub fn poll_completions(&self, min: usize) -> usize {
        self.io.drain(min)
    }

    #[must_use]
    pub fn io(&self) -> &Arc<GlobalCachedIo> {
        &self.io
    }

    /// Take recycled task storage; past the pool bound, fall back to a
    /// plain allocation that will not be returned.
    fn acquire_storage(&self) -> (Vec<T>, bool) {
        match self.pool.acquire() {
            Some(storage) => (storage, true),
            None => (Vec::new(), false),
        }
    }

    fn build_request(
        &self,
        first_off: u64,
        last_off: u64,
        tasks: Vec<T>,
        pooled: bool,
    ) -> ComputeRequest {
        ComputeRequest {
            offset: ByteOffset(first_off),
            len: (last_off - first_off) as usize,
            compute: Box::new(KvCompute {
                tasks,
                entry_size: self.entry_size,
                has_run: false,
                pool: pooled.then(|| self.pool.clone()),
            }),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use spate_aio::{AioEngine, Backend, MemStore};
    use spate_io::CacheShared;
    use spate_types::{CacheConfig, CachePolicyKind};
    use std::time::Duration;

    const ENTRY: usize = 8;

    /// A store over a file where `value[i] = i` as little-endian u64.
    fn setup(entries: u64) -> KvStore<RecTask> {
        let cfg = CacheConfig {
            policy: CachePolicyKind::Lru2q,
            cache_size: (64 * PAGE_SIZE) as u64,
            max_aio: 32,
            entry_size: ENTRY,
            node_id: Some(0),
            stuck_after: Duration::from_secs(5),
        };
        let store = MemStore::new();
        let len = ceil_to_page(entries * ENTRY as u64) as usize;
        let file = store.create(len);
        let mut data = vec![0_u8; len];
        for i in 0..entries {
            let at = i as usize * ENTRY;
            data[at..at + ENTRY].copy_from_slice(&i.to_le_bytes());
        }
        store.write_raw(file, 0, &data);

        let shared = CacheShared::new(&cfg).unwrap();
        let engine = AioEngine::new(Backend::Mem(store), 32, None).unwrap();
        let io = Arc::new(GlobalCachedIo::new(shared, engine, file, &cfg).unwrap());
        KvStore::new(io)
    }

    type Sink = Arc<Mutex<Vec<(u64, Vec<u8>)>>>;

    struct RecTask {
        idx: u64,
        n: u32,
        sink: Sink,
    }

    impl KvTask for RecTask {
        fn index(&self) -> u64 {
            self.idx
        }

        fn num_entries(&self) -> u32 {
            self.n
        }

        fn run(&mut self, values: &[u8]) {
            self.sink.lock().push((self.idx, values.to_vec()));
        }
    }

    fn task(idx: u64, n: u32, sink: &Sink) -> RecTask {
        RecTask {
            idx,
            n,
            sink: Arc::clone(sink),
        }
    }

    fn value_bytes(idx: u64, n: u32) -> Vec<u8> {
        (idx..idx + u64::from(n))
            .flat_map(u64::to_le_bytes)
            .collect()
    }

    fn drain_all(store: &KvStore<RecTask>) {
        store.poll_completions(1);
    }

    #[test]
    fn adjacent_tasks_merge_into_one_request() {
        // Indices 0 and 1 live in page 0; index 513 lives in page 1, which
        // the extension rule folds into the same request.
        let mut store = setup(2048);
        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        for idx in [0_u64, 1, 513] {
            store.async_request(task(idx, 1, &sink));
        }
        store.flush_requests().unwrap();
        drain_all(&store);

        assert_eq!(store.io().engine_stats().reads, 1, "one merged request");
        let results = sink.lock();
        assert_eq!(results.len(), 3);
        for (idx, values) in results.iter() {
            assert_eq!(values, &value_bytes(*idx, 1), "task {idx}");
        }
    }

    #[test]
    fn distant_tasks_become_separate_requests() {
        let mut store = setup(10_240);
        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        store.async_request(task(0, 1, &sink));
        store.async_request(task(10_000, 1, &sink));
        store.flush_requests().unwrap();
        drain_all(&store);

        assert_eq!(store.io().engine_stats().reads, 2, "disjoint ranges split");
        let results = sink.lock();
        assert_eq!(results.len(), 2);
        for (idx, values) in results.iter() {
            assert_eq!(values, &value_bytes(*idx, 1));
        }
    }

    #[test]
    fn extension_is_limited_to_one_page() {
        // End offset exactly one page past the range extends it...
        let mut store = setup(4096);
        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        store.async_request(task(0, 1, &sink));
        store.async_request(task(512, 1, &sink));
        store.flush_requests().unwrap();
        drain_all(&store);
        assert_eq!(store.io().engine_stats().reads, 1);

        // ...but two pages past starts a new request, even though the gap
        // is small.
        let mut store = setup(4096);
        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        store.async_request(task(0, 1, &sink));
        store.async_request(task(1024, 1, &sink));
        store.flush_requests().unwrap();
        drain_all(&store);
        assert_eq!(store.io().engine_stats().reads, 2);
    }

    #[test]
    fn request_count_follows_the_gap_rule() {
        // {0} and {600} merge via extension; {5000} is far away: exactly
        // two requests for the three tasks.
        let mut store = setup(10_240);
        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        for idx in [5000_u64, 0, 600] {
            store.async_request(task(idx, 1, &sink));
        }
        assert_eq!(store.pending_tasks(), 3);
        store.flush_requests().unwrap();
        assert_eq!(store.pending_tasks(), 0);
        drain_all(&store);

        assert_eq!(store.io().engine_stats().reads, 2);
        assert_eq!(sink.lock().len(), 3);
    }

    #[test]
    fn tasks_run_in_ascending_index_order() {
        let mut store = setup(2048);
        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        for idx in [513_u64, 0, 1] {
            store.async_request(task(idx, 1, &sink));
        }
        store.flush_requests().unwrap();
        drain_all(&store);

        let order: Vec<u64> = sink.lock().iter().map(|(idx, _)| *idx).collect();
        assert_eq!(order, vec![0, 1, 513]);
    }

    #[test]
    fn multi_entry_task_crosses_a_page_boundary() {
        let mut store = setup(2048);
        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        // Entries 510..514 straddle the page 0 / page 1 boundary.
        store.async_request(task(510, 4, &sink));
        store.flush_requests().unwrap();
        drain_all(&store);

        let results = sink.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, value_bytes(510, 4));
    }

    #[test]
    fn flush_of_empty_buffer_is_a_noop() {
        let mut store = setup(64);
        store.flush_requests().unwrap();
        assert_eq!(store.io().engine_stats().reads, 0);
    }

    #[test]
    fn warm_cache_runs_tasks_inline() {
        let mut store = setup(2048);
        store.io().preload(ByteOffset::ZERO, 2 * PAGE_SIZE).unwrap();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        store.async_request(task(7, 2, &sink));
        store.flush_requests().unwrap();
        // All pages resident: no drain needed.
        assert_eq!(sink.lock().len(), 1);
        assert_eq!(sink.lock()[0].1, value_bytes(7, 2));
    }

    #[test]
    fn repeated_flush_cycles_recycle_compute_storage() {
        let mut store = setup(4096);
        for round in 0..20_u64 {
            let sink: Sink = Arc::new(Mutex::new(Vec::new()));
            store.async_request(task(round * 3, 1, &sink));
            store.async_request(task(round * 3 + 1, 1, &sink));
            store.flush_requests().unwrap();
            drain_all(&store);
            assert_eq!(sink.lock().len(), 2, "round {round}");
        }
    }
}
