#![forbid(unsafe_code)]
//! Replay infrastructure for driving workloads through the cached I/O
//! stack and reporting what happened, as machine-readable JSON.

use serde::{Deserialize, Serialize};
use spate::{ByteOffset, CacheConfig, GlobalCachedIo, Result};
use spate_workload::WorkloadGen;

/// Outcome of one workload replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub accesses: u64,
    pub reads: u64,
    pub writes: u64,
    pub bytes_transferred: u64,
}

/// Cache and engine counters after a run, flattened for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub policy: String,
    pub frames: usize,
    pub replay: ReplaySummary,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub hit_ratio: f64,
    pub resident: usize,
    pub engine_reads: u64,
    pub engine_writes: u64,
    pub num_waits: u64,
    pub stuck_events: u64,
}

impl RunReport {
    #[must_use]
    pub fn collect(config: &CacheConfig, io: &GlobalCachedIo, replay: ReplaySummary) -> Self {
        let cache = io.cache_metrics();
        let engine = io.engine_stats();
        let stats = io.stats();
        Self {
            policy: format!("{:?}", config.policy),
            frames: config.frame_count(),
            replay,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            evictions: cache.evictions,
            writebacks: cache.writebacks,
            hit_ratio: cache.hit_ratio(),
            resident: cache.resident,
            engine_reads: engine.reads,
            engine_writes: engine.writes,
            num_waits: stats.num_waits,
            stuck_events: stats.stuck_events,
        }
    }
}

/// Drive every access a generator produces through `io`.
///
/// Reads land in a scratch buffer; writes send a repeating byte pattern
/// derived from the offset, so replays are deterministic.
pub fn replay(io: &GlobalCachedIo, gen: &mut dyn WorkloadGen) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary {
        accesses: 0,
        reads: 0,
        writes: 0,
        bytes_transferred: 0,
    };
    let mut scratch = Vec::new();
    while gen.has_next() {
        let access = gen.next();
        let size = access.size as usize;
        scratch.resize(size, 0);
        let transferred = if access.is_read {
            summary.reads += 1;
            io.read(&mut scratch, ByteOffset(access.offset))?
        } else {
            summary.writes += 1;
            scratch.fill((access.offset >> 3) as u8);
            io.write(&scratch, ByteOffset(access.offset))?
        };
        summary.accesses += 1;
        summary.bytes_transferred += transferred as u64;
    }
    io.flush()?;
    Ok(summary)
}
