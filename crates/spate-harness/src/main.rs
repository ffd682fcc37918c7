#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use spate::{
    AioEngine, Backend, CacheConfig, CachePolicyKind, CacheShared, GlobalCachedIo, MemStore,
    PAGE_SIZE,
};
use spate_harness::{replay, RunReport};
use spate_workload::{load_offset_dump, RandPermuteWorkload, SeqWorkload, TraceWorkload};
use std::env;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage();
        return Ok(());
    };

    match cmd.as_str() {
        "demo" => {
            let pages: usize = match args.next() {
                Some(arg) => arg.parse().context("pages must be an integer")?,
                None => 256,
            };
            let policy = match args.next().as_deref() {
                None | Some("lru2q") => CachePolicyKind::Lru2q,
                Some("associative") => CachePolicyKind::Associative,
                Some(other) => bail!("unknown policy: {other}"),
            };
            demo(pages, policy)
        }
        "trace" => {
            let Some(path) = args.next() else {
                bail!("trace requires a dump path");
            };
            trace_replay(&path)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {cmd}")
        }
    }
}

/// Run a sequential pass and a random-permuted pass over an in-memory file
/// and print both reports.
fn demo(pages: usize, policy: CachePolicyKind) -> Result<()> {
    let config = CacheConfig {
        policy,
        // Cache a quarter of the file so the replacement policy works.
        cache_size: (pages * PAGE_SIZE / 4) as u64,
        ..CacheConfig::default()
    };
    let entry_size = config.entry_size as u32;
    let entries = (pages * PAGE_SIZE / config.entry_size) as u64;

    let store = MemStore::new();
    let file = store.create(pages * PAGE_SIZE);
    let shared = CacheShared::new(&config)?;

    for (name, mut gen) in [
        (
            "sequential",
            Box::new(SeqWorkload::new(0, entries, entry_size, true)) as Box<dyn spate_workload::WorkloadGen>,
        ),
        (
            "random",
            Box::new(RandPermuteWorkload::new(0, entries, entry_size, true, 42)),
        ),
    ] {
        let engine = AioEngine::new(Backend::Mem(store.clone()), config.max_aio, config.node_id)?;
        let io = GlobalCachedIo::new(shared.clone(), engine, file, &config)?;
        let summary = replay(&io, gen.as_mut())?;
        let report = RunReport::collect(&config, &io, summary);
        println!("== {name} ==");
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Replay a big-endian offset dump as page-sized reads over an in-memory
/// file sized to cover the trace.
fn trace_replay(path: &str) -> Result<()> {
    let offsets = load_offset_dump(path).context("loading offset dump")?;
    if offsets.is_empty() {
        bail!("trace is empty");
    }
    let max = offsets.iter().copied().max().unwrap_or(0);
    let file_len = (max as usize / PAGE_SIZE + 2) * PAGE_SIZE;

    let config = CacheConfig::default();
    let store = MemStore::new();
    let file = store.create(file_len);
    let shared = CacheShared::new(&config)?;
    let engine = AioEngine::new(Backend::Mem(store), config.max_aio, config.node_id)?;
    let io = GlobalCachedIo::new(shared, engine, file, &config)?;

    let mut gen = TraceWorkload::new(offsets, config.entry_size as u32, true);
    let summary = replay(&io, &mut gen)?;
    let report = RunReport::collect(&config, &io, summary);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_usage() {
    println!("spate-harness");
    println!();
    println!("USAGE:");
    println!("  spate-harness demo [pages] [lru2q|associative]");
    println!("  spate-harness trace <offset-dump>");
}
