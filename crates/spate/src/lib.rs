#![forbid(unsafe_code)]
//! Spate public API facade.
//!
//! Re-exports the cached I/O stack through a stable external interface.
//! This is the crate that downstream consumers (benchmark drivers, the
//! harness) depend on.

pub use spate_aio::{AioEngine, Backend, CompletionStatus, EngineStats, FileStore, MemStore};
pub use spate_cache::{CacheMetrics, FrameFlags, Lookup, PageCache, WritebackTicket};
pub use spate_error::{CoreError, Result};
pub use spate_io::{
    CacheShared, ClientCallback, ComputeRequest, GlobalCachedIo, IoStats, PageByteArray,
    RequestOutcome, UserCompute,
};
pub use spate_kv::{KvStore, KvTask};
pub use spate_pool::Pool;
pub use spate_types::{
    ByteOffset, CacheConfig, CachePolicyKind, FileId, IoDir, PageBuf, PageLocation,
    WorkloadEntry, PAGE_SIZE,
};
pub use spate_workload::{WorkloadGen, WorkloadChunk};
