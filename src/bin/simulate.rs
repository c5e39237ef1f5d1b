//! lookaside Simulator Binary
//!
//! Drives a synthetic mixed workload through the request router against
//! in-memory devices and prints what the cache did with it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use lookaside::device::{BlockDevice, MemoryDevice};
use lookaside::{CacheEngine, CacheMode, Config, IoRequest, StatsSnapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{fmt, EnvFilter};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// lookaside workload simulator
#[derive(Parser, Debug)]
#[command(name = "lookaside-sim")]
#[command(about = "Run a synthetic workload through the look-aside cache")]
#[command(version)]
struct Args {
    /// Cache mode to simulate (writethrough, writeback, writearound, none); all when omitted
    #[arg(short, long)]
    mode: Option<CacheMode>,

    /// Requests per caller
    #[arg(short, long, default_value = "2000")]
    requests: usize,

    /// Concurrent callers
    #[arg(short, long, default_value = "8")]
    callers: u64,

    /// Backing device size in MiB
    #[arg(long, default_value = "256")]
    backing_mb: u64,

    /// Cache device size in MiB
    #[arg(long, default_value = "32")]
    cache_mb: u64,

    /// Percentage of requests that continue the caller's previous request
    #[arg(long, default_value = "30")]
    sequential_percent: u32,

    /// Percentage of requests that are writes
    #[arg(long, default_value = "40")]
    write_percent: u32,

    /// Sequential cutoff in KiB (0 disables)
    #[arg(long, default_value = "512")]
    sequential_cutoff_kb: u64,

    /// Added latency per cache-device I/O, in microseconds
    #[arg(long, default_value = "0")]
    cache_latency_us: u64,

    /// Journal file (recreated for every run)
    #[arg(short, long, default_value = "./lookaside_sim_journal.log")]
    journal: PathBuf,

    /// RNG seed
    #[arg(long, default_value = "42")]
    seed: u64,
}

#[tokio::main]
async fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lookaside=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("lookaside simulator v{}", lookaside::VERSION);

    let modes = match args.mode {
        Some(mode) => vec![mode],
        None => vec![
            CacheMode::WriteThrough,
            CacheMode::WriteBack,
            CacheMode::WriteAround,
            CacheMode::None,
        ],
    };

    for mode in modes {
        match run(&args, mode).await {
            Ok(report) => report.print(),
            Err(e) => {
                tracing::error!(%mode, "simulation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = std::fs::remove_file(&args.journal) {
        tracing::debug!("journal cleanup: {}", e);
    }
}

struct Report {
    mode: CacheMode,
    elapsed: Duration,
    requests: u64,
    errors: u64,
    stats: StatsSnapshot,
    backing_reads: u64,
    backing_writes: u64,
    flushed_sectors: u64,
}

impl Report {
    fn print(&self) {
        println!("== {} ==", self.mode);
        println!(
            "  requests          {} in {:.2?} ({} errors)",
            self.requests, self.elapsed, self.errors
        );
        println!("  hit ratio         {:.1}%", self.stats.hit_ratio() * 100.0);
        println!(
            "  bypassed          sequential={} congested={} other={}",
            self.stats.bypass_sequential, self.stats.bypass_congested, self.stats.bypass_other
        );
        println!(
            "  forced writeback  {}   collisions {}   stale sectors {}",
            self.stats.forced_writeback, self.stats.collisions, self.stats.stale_pointers
        );
        println!(
            "  backing I/O       reads={} writes={}   detach flushed {} sectors",
            self.backing_reads, self.backing_writes, self.flushed_sectors
        );
    }
}

async fn run(args: &Args, mode: CacheMode) -> lookaside::Result<Report> {
    if args.journal.exists() {
        std::fs::remove_file(&args.journal)?;
    }

    let config = Config::builder()
        .cache_mode(mode)
        .sequential_cutoff(args.sequential_cutoff_kb * KIB)
        .bucket_size(256)
        .journal_path(&args.journal)
        .build();

    let backing = Arc::new(MemoryDevice::new(args.backing_mb * MIB));
    let mut cache = MemoryDevice::new(args.cache_mb * MIB);
    if args.cache_latency_us > 0 {
        cache = cache.with_latency(Duration::from_micros(args.cache_latency_us));
    }

    let engine = Arc::new(
        CacheEngine::open(
            config,
            Arc::clone(&backing) as Arc<dyn BlockDevice>,
            Arc::new(cache),
        )
        .await?,
    );

    let started = Instant::now();
    let workers: Vec<_> = (0..args.callers)
        .map(|caller| {
            let engine = Arc::clone(&engine);
            let workload = Workload {
                caller,
                requests: args.requests,
                device_blocks: args.backing_mb * MIB / (4 * KIB),
                sequential_percent: args.sequential_percent,
                write_percent: args.write_percent,
                seed: args.seed.wrapping_add(caller),
            };
            tokio::spawn(async move { workload.run(&engine).await })
        })
        .collect();

    let mut errors = 0;
    for worker in futures::future::join_all(workers).await {
        errors += worker?;
    }
    let elapsed = started.elapsed();

    let flushed = engine.detach().await?;
    let counters = backing.counters();

    Ok(Report {
        mode,
        elapsed,
        requests: args.callers * args.requests as u64,
        errors,
        stats: engine.stats(),
        backing_reads: counters.reads,
        backing_writes: counters.writes,
        flushed_sectors: flushed.flushed_sectors,
    })
}

/// One caller's request stream
struct Workload {
    caller: u64,
    requests: usize,
    device_blocks: u64,
    sequential_percent: u32,
    write_percent: u32,
    seed: u64,
}

impl Workload {
    /// Returns the number of failed requests
    async fn run(self, engine: &CacheEngine) -> u64 {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut next_block = rng.random_range(0..self.device_blocks);
        let mut errors = 0;

        for _ in 0..self.requests {
            let blocks = rng.random_range(1..=16u64);
            let sequential = rng.random_range(0..100) < self.sequential_percent;
            let block = if sequential {
                next_block
            } else {
                rng.random_range(0..self.device_blocks)
            };
            let block = block.min(self.device_blocks - blocks);
            next_block = block + blocks;

            let offset = block * 4 * KIB;
            let len = blocks * 4 * KIB;
            let request = if rng.random_range(0..100) < self.write_percent {
                IoRequest::write(self.caller, 0, offset, vec![self.caller as u8; len as usize])
            } else {
                IoRequest::read(self.caller, 0, offset, len)
            };

            if let Err(e) = engine.execute(request).await {
                tracing::warn!(caller = self.caller, "request failed: {}", e);
                errors += 1;
            }
        }
        errors
    }
}
