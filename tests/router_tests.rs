//! Tests for the Request Router
//!
//! These tests verify:
//! - Write-through, write-back and write-around write paths
//! - Forced write-back over dirty data
//! - Bypass decisions (alignment, sequential streams, meta requests)
//! - Read lookup, read-miss fills, stale pointers and read retries
//! - Flush, discard and detach

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lookaside::alloc::{Allocator, BucketAllocator};
use lookaside::config::JournalSyncStrategy;
use lookaside::device::{BlockDevice, MemoryDevice};
use lookaside::index::{ExtentTree, KeyIndex};
use lookaside::journal::{FileJournal, JournalOp, JournalReader};
use lookaside::lookup::{CacheLookup, SegmentSource};
use lookaside::{
    BypassReason, CacheEngine, CacheError, CacheMode, Config, ExtentKey, IoFlags, IoRequest,
};
use tempfile::TempDir;

const KIB: u64 = 1024;

// =============================================================================
// Helper Functions
// =============================================================================

struct Harness {
    _temp: TempDir,
    journal: PathBuf,
    backing: Arc<MemoryDevice>,
    cache: Arc<MemoryDevice>,
    engine: CacheEngine,
}

fn test_config(mode: CacheMode, journal: &PathBuf) -> Config {
    Config::builder()
        .cache_mode(mode)
        .bucket_size(64)
        .sequential_cutoff(0)
        .congestion_watermarks(0, 0)
        .journal_path(journal)
        .journal_sync(JournalSyncStrategy::EveryWrite)
        .build()
}

async fn setup(mode: CacheMode) -> Harness {
    setup_with(mode, |b| b).await
}

async fn setup_with(mode: CacheMode, tweak: impl FnOnce(Config) -> Config) -> Harness {
    let temp = TempDir::new().unwrap();
    let journal = temp.path().join("journal.log");
    let backing = Arc::new(MemoryDevice::new(4 * 1024 * KIB));
    let cache = Arc::new(MemoryDevice::new(1024 * KIB));

    let engine = CacheEngine::open(
        tweak(test_config(mode, &journal)),
        Arc::clone(&backing) as Arc<dyn BlockDevice>,
        Arc::clone(&cache) as Arc<dyn BlockDevice>,
    )
    .await
    .unwrap();

    Harness {
        _temp: temp,
        journal,
        backing,
        cache,
        engine,
    }
}

fn pattern(len: u64, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i / 512) as u8)).collect()
}

async fn write(h: &Harness, offset: u64, data: Vec<u8>) {
    h.engine
        .execute(IoRequest::write(1, 0, offset, data))
        .await
        .unwrap();
}

async fn read(h: &Harness, offset: u64, len: u64) -> Vec<u8> {
    h.engine
        .execute(IoRequest::read(2, 0, offset, len))
        .await
        .unwrap()
        .unwrap()
        .to_vec()
}

async fn records(h: &Harness, offset: u64, len: u64) -> Vec<lookaside::PointerRecord> {
    let extent = ExtentKey::from_bytes(0, offset, len).unwrap();
    h.engine.index().query_overlap(&extent).await.unwrap()
}

// =============================================================================
// Write-Through Tests
// =============================================================================

#[tokio::test]
async fn test_write_through_read_survives_cache_wipe() {
    let h = setup(CacheMode::WriteThrough).await;
    let data = pattern(16 * KIB, 1);

    write(&h, 0, data.clone()).await;
    assert_eq!(h.backing.snapshot(0, 16 * KIB), data);

    h.cache.wipe();

    assert_eq!(read(&h, 0, 16 * KIB).await, data);
    assert!(h.engine.stats().read_retries >= 1);
}

#[tokio::test]
async fn test_partial_read_of_wiped_cache_comes_from_backing() {
    let h = setup(CacheMode::WriteThrough).await;
    let data = pattern(16 * KIB, 1);
    write(&h, 0, data.clone()).await;

    h.cache.wipe();

    assert_eq!(read(&h, 4 * KIB, 4 * KIB).await, data[4096..8192].to_vec());
    assert_eq!(h.engine.stats().read_retries, 1);
}

#[tokio::test]
async fn test_write_through_populates_cache() {
    let h = setup(CacheMode::WriteThrough).await;
    let data = pattern(8 * KIB, 3);
    write(&h, 8 * KIB, data.clone()).await;

    let before = h.backing.counters().reads;
    assert_eq!(read(&h, 8 * KIB, 8 * KIB).await, data);
    assert_eq!(h.backing.counters().reads, before);
    assert_eq!(h.engine.stats().cache_hit_sectors, 16);
}

#[tokio::test]
async fn test_full_coverage_lookup_has_no_gaps() {
    let h = setup(CacheMode::WriteThrough).await;
    let data = pattern(32 * KIB, 9);
    write(&h, 0, data.clone()).await;

    let extent = ExtentKey::from_bytes(0, 0, 32 * KIB).unwrap();
    let result = CacheLookup::new(h.engine.index(), h.engine.allocator())
        .lookup(&extent)
        .await
        .unwrap();

    assert_eq!(result.gaps().count(), 0);
    assert_eq!(result.hit_sectors(), 64);

    let mut cached = Vec::new();
    for segment in &result.segments {
        let SegmentSource::Cache(record) = segment.source else {
            panic!("unexpected gap");
        };
        cached.extend(h.cache.snapshot(record.cache_byte_offset(), record.key.byte_len()));
    }
    assert_eq!(cached, data);
}

#[tokio::test]
async fn test_failed_cache_write_invalidates_old_copy() {
    let h = setup(CacheMode::WriteThrough).await;
    write(&h, 0, pattern(4 * KIB, 1)).await;
    assert_eq!(records(&h, 0, 4 * KIB).await.len(), 1);

    h.cache.set_fail_writes(true);
    let newer = pattern(4 * KIB, 50);
    write(&h, 0, newer.clone()).await;

    assert!(records(&h, 0, 4 * KIB).await.is_empty());
    assert_eq!(h.engine.stats().insert_failures, 1);

    h.cache.set_fail_writes(false);
    assert_eq!(read(&h, 0, 4 * KIB).await, newer);
}

// =============================================================================
// Write-Back Tests
// =============================================================================

#[tokio::test]
async fn test_write_back_4k_is_dirty_and_journaled() {
    let h = setup(CacheMode::WriteBack).await;
    write(&h, 0, pattern(4 * KIB, 7)).await;

    let recs = records(&h, 0, 4 * KIB).await;
    assert_eq!(recs.len(), 1);
    assert!(recs[0].dirty);
    assert_eq!(recs[0].key, ExtentKey::new(0, 0, 8));

    assert_eq!(h.backing.counters().writes, 0);

    let journaled: Vec<_> = JournalReader::open(&h.journal)
        .unwrap()
        .map(|entry| entry.unwrap().op)
        .collect();
    assert!(journaled.iter().any(|op| matches!(
        op,
        JournalOp::Insert { records } if records == &recs
    )));
}

#[tokio::test]
async fn test_write_back_reads_dirty_data_from_cache() {
    let h = setup(CacheMode::WriteBack).await;
    let data = pattern(12 * KIB, 4);
    write(&h, 4 * KIB, data.clone()).await;

    assert_eq!(read(&h, 4 * KIB, 12 * KIB).await, data);
    assert_eq!(h.backing.counters().reads, 0);
}

#[tokio::test]
async fn test_dirty_read_error_is_not_retried() {
    let h = setup(CacheMode::WriteBack).await;
    write(&h, 0, pattern(4 * KIB, 4)).await;

    h.cache.fail_next_reads(1);
    let result = h.engine.execute(IoRequest::read(2, 0, 0, 4 * KIB)).await;
    assert!(matches!(result, Err(CacheError::CacheDevice(_))));
    assert_eq!(h.engine.stats().read_retries, 0);
}

#[tokio::test]
async fn test_write_back_cache_failure_fails_the_write() {
    let h = setup(CacheMode::WriteBack).await;
    h.cache.set_fail_writes(true);

    let result = h
        .engine
        .execute(IoRequest::write(1, 0, 0, pattern(4 * KIB, 1)))
        .await;
    assert!(result.is_err());
    assert!(records(&h, 0, 4 * KIB).await.is_empty());
}

#[tokio::test]
async fn test_dirty_overlap_forces_write_back_on_write_around_volume() {
    let temp = TempDir::new().unwrap();
    let journal = temp.path().join("journal.log");
    let backing = Arc::new(MemoryDevice::new(4 * 1024 * KIB));
    let cache = Arc::new(MemoryDevice::new(1024 * KIB));

    // Dirty [0, 8K) from an earlier write-back session
    let original = {
        let engine = CacheEngine::open(
            test_config(CacheMode::WriteBack, &journal),
            Arc::clone(&backing) as Arc<dyn BlockDevice>,
            Arc::clone(&cache) as Arc<dyn BlockDevice>,
        )
        .await
        .unwrap();
        engine
            .execute(IoRequest::write(1, 0, 0, pattern(8 * KIB, 1)))
            .await
            .unwrap();
        engine
            .index()
            .query_overlap(&ExtentKey::new(0, 0, 16))
            .await
            .unwrap()[0]
    };

    let engine = CacheEngine::open(
        test_config(CacheMode::WriteAround, &journal),
        Arc::clone(&backing) as Arc<dyn BlockDevice>,
        Arc::clone(&cache) as Arc<dyn BlockDevice>,
    )
    .await
    .unwrap();

    engine
        .execute(IoRequest::write(1, 0, 4 * KIB, pattern(8 * KIB, 100)))
        .await
        .unwrap();

    let recs = engine
        .index()
        .query_overlap(&ExtentKey::new(0, 0, 24))
        .await
        .unwrap();
    assert_eq!(recs.len(), 2);

    assert_eq!(recs[0].key, ExtentKey::new(0, 0, 8));
    assert!(recs[0].dirty);
    assert_eq!(recs[0].cache_offset, original.cache_offset);
    assert_eq!(recs[0].bucket, original.bucket);

    assert_eq!(recs[1].key, ExtentKey::new(0, 8, 16));
    assert!(recs[1].dirty);

    assert_eq!(backing.counters().writes, 0);
    assert_eq!(engine.stats().forced_writeback, 1);
}

// =============================================================================
// Write-Around Tests
// =============================================================================

#[tokio::test]
async fn test_write_around_skips_cache_then_read_fills() {
    let h = setup(CacheMode::WriteAround).await;
    let data = pattern(8 * KIB, 2);
    write(&h, 0, data.clone()).await;

    assert!(records(&h, 0, 8 * KIB).await.is_empty());
    assert_eq!(h.cache.counters().writes, 0);
    assert_eq!(h.backing.snapshot(0, 8 * KIB), data);

    // Miss, filled after the acknowledgement
    assert_eq!(read(&h, 0, 8 * KIB).await, data);
    let recs = records(&h, 0, 8 * KIB).await;
    assert_eq!(recs.len(), 1);
    assert!(!recs[0].dirty);
    assert!(!recs[0].is_placeholder());

    // Hit
    let before = h.backing.counters().reads;
    assert_eq!(read(&h, 0, 8 * KIB).await, data);
    assert_eq!(h.backing.counters().reads, before);
}

#[tokio::test]
async fn test_read_of_partially_cached_range_yields_gap_cache_gap() {
    let h = setup(CacheMode::WriteThrough).await;
    write(&h, 4 * KIB, pattern(4 * KIB, 5)).await;

    let extent = ExtentKey::from_bytes(0, 0, 16 * KIB).unwrap();
    let result = CacheLookup::new(h.engine.index(), h.engine.allocator())
        .lookup(&extent)
        .await
        .unwrap();

    let shape: Vec<(u64, u64, bool)> = result
        .segments
        .iter()
        .map(|s| (s.extent.byte_offset(), s.extent.byte_offset() + s.extent.byte_len(), s.is_gap()))
        .collect();
    assert_eq!(
        shape,
        vec![
            (0, 4 * KIB, true),
            (4 * KIB, 8 * KIB, false),
            (8 * KIB, 16 * KIB, true),
        ]
    );
}

// =============================================================================
// Bypass Tests
// =============================================================================

#[tokio::test]
async fn test_unaligned_requests_always_bypass() {
    let h = setup(CacheMode::WriteBack).await;

    let requests = [
        IoRequest::write(1, 0, 512, pattern(4 * KIB, 1)),
        IoRequest::write(1, 0, 4 * KIB, pattern(1536, 1)),
        IoRequest::read(1, 0, 4 * KIB + 512, 512),
        IoRequest::read(1, 0, 0, 4 * KIB + 512).with_flags(IoFlags {
            meta: true,
            ..IoFlags::default()
        }),
    ];
    for request in requests {
        let extent = request.extent().unwrap();
        assert_eq!(
            h.engine.should_bypass(&request, &extent),
            Some(BypassReason::Unaligned),
            "{:?}",
            request
        );
    }

    // An unaligned write lands on the backing device, never in the cache
    write(&h, 512, pattern(4 * KIB, 1)).await;
    assert!(records(&h, 0, 8 * KIB).await.is_empty());
    assert_eq!(h.backing.snapshot(512, 4 * KIB), pattern(4 * KIB, 1));
}

#[tokio::test]
async fn test_sub_sector_request_is_rejected() {
    let h = setup(CacheMode::WriteThrough).await;
    let result = h.engine.execute(IoRequest::read(1, 0, 100, 512)).await;
    assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_sequential_stream_bypasses() {
    let h = setup_with(CacheMode::WriteThrough, |c| Config {
        sequential_cutoff: 64 * KIB,
        ..c
    })
    .await;

    for i in 0..16 {
        write(&h, i * 4 * KIB, pattern(4 * KIB, i as u8)).await;
    }

    assert_eq!(h.engine.stats().bypass_sequential, 1);
    assert_eq!(records(&h, 0, 60 * KIB).await.len(), 15);
    assert!(records(&h, 60 * KIB, 4 * KIB).await.is_empty());
}

#[tokio::test]
async fn test_meta_requests_skip_sequential_bypass() {
    let h = setup_with(CacheMode::WriteThrough, |c| Config {
        sequential_cutoff: 4 * KIB,
        ..c
    })
    .await;

    let meta = IoRequest::write(1, 0, 0, pattern(8 * KIB, 1)).with_flags(IoFlags {
        meta: true,
        ..IoFlags::default()
    });
    h.engine.execute(meta).await.unwrap();
    assert_eq!(records(&h, 0, 8 * KIB).await.len(), 1);

    write(&h, 16 * KIB, pattern(8 * KIB, 1)).await;
    assert!(records(&h, 16 * KIB, 8 * KIB).await.is_empty());
    assert_eq!(h.engine.stats().bypass_sequential, 1);
}

#[tokio::test]
async fn test_slow_cache_device_bypasses_as_congested() {
    let temp = TempDir::new().unwrap();
    let journal = temp.path().join("journal.log");
    let backing = Arc::new(MemoryDevice::new(4 * 1024 * KIB));
    let cache = Arc::new(
        MemoryDevice::new(1024 * KIB).with_latency(Duration::from_millis(1100)),
    );
    let config = Config {
        congestion_low_us: 100,
        congestion_high_us: 1000,
        congestion_jitter: false,
        ..test_config(CacheMode::WriteThrough, &journal)
    };
    let engine = CacheEngine::open(
        config,
        Arc::clone(&backing) as Arc<dyn BlockDevice>,
        Arc::clone(&cache) as Arc<dyn BlockDevice>,
    )
    .await
    .unwrap();

    // Nothing sampled yet: cached, and its cache write runs over the watermark
    engine
        .execute(IoRequest::write(1, 0, 0, pattern(4 * KIB, 1)))
        .await
        .unwrap();
    assert_eq!(engine.stats().bypass_congested, 0);

    let request = IoRequest::write(3, 0, 1024 * KIB, pattern(64 * KIB, 2));
    let extent = request.extent().unwrap();
    assert_eq!(
        engine.should_bypass(&request, &extent),
        Some(BypassReason::Congested)
    );

    engine.execute(request).await.unwrap();
    assert_eq!(engine.stats().bypass_congested, 1);
    assert_eq!(backing.snapshot(1024 * KIB, 64 * KIB), pattern(64 * KIB, 2));
    let extent = ExtentKey::from_bytes(0, 1024 * KIB, 64 * KIB).unwrap();
    assert!(engine.index().query_overlap(&extent).await.unwrap().is_empty());
}

// =============================================================================
// Stale Pointer Tests
// =============================================================================

/// Write 4 KiB at `offset`, reuse its bucket underneath it, then read it back
async fn read_through_reused_bucket(offset: u64) {
    let temp = TempDir::new().unwrap();
    let journal_path = temp.path().join("journal.log");
    let config = test_config(CacheMode::WriteThrough, &journal_path);

    let backing = Arc::new(MemoryDevice::new(4 * 1024 * KIB));
    let cache = Arc::new(MemoryDevice::new(1024 * KIB));
    let allocator = Arc::new(BucketAllocator::for_device(1024 * KIB, 64, 2));
    let (journal, _, _) = FileJournal::open(&journal_path, config.journal_sync).unwrap();

    let engine = CacheEngine::with_components(
        config,
        Arc::clone(&backing) as Arc<dyn BlockDevice>,
        Arc::clone(&cache) as Arc<dyn BlockDevice>,
        Arc::new(ExtentTree::new()),
        Arc::clone(&allocator) as Arc<dyn Allocator>,
        Arc::new(journal),
    );

    let data = pattern(4 * KIB, 8);
    engine
        .execute(IoRequest::write(1, 0, offset, data.clone()))
        .await
        .unwrap();
    let extent = ExtentKey::from_bytes(0, offset, 4 * KIB).unwrap();
    let record = engine.index().query_overlap(&extent).await.unwrap()[0];

    // Reuse the bucket underneath the record and scribble over it
    assert!(allocator.invalidate_bucket(record.bucket.index));
    cache.wipe();

    let got = engine
        .execute(IoRequest::read(2, 0, offset, 4 * KIB))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.to_vec(), data);
    assert_eq!(engine.stats().stale_pointers, 8);

    // The stale record was replaced by a fresh fill
    let refilled = engine.index().query_overlap(&extent).await.unwrap();
    assert_eq!(refilled.len(), 1);
    assert!(!allocator.is_stale(&refilled[0]));
    assert!(!refilled[0].is_placeholder());
}

#[tokio::test]
async fn test_stale_pointer_reads_from_backing_and_refills() {
    read_through_reused_bucket(0).await;
}

#[tokio::test]
async fn test_stale_pointer_past_its_cache_offset_is_refilled() {
    read_through_reused_bucket(2048 * KIB).await;
}

#[tokio::test]
async fn test_clean_read_error_retries_backing() {
    let h = setup(CacheMode::WriteThrough).await;
    let data = pattern(4 * KIB, 6);
    write(&h, 0, data.clone()).await;

    h.cache.fail_next_reads(1);
    assert_eq!(read(&h, 0, 4 * KIB).await, data);
    assert_eq!(h.engine.stats().read_retries, 1);
}

// =============================================================================
// Flush / Discard / Detach Tests
// =============================================================================

#[tokio::test]
async fn test_flush_reaches_backing_and_cache() {
    let h = setup(CacheMode::WriteBack).await;
    h.engine.execute(IoRequest::flush(1, 0)).await.unwrap();

    assert_eq!(h.backing.counters().flushes, 1);
    assert_eq!(h.cache.counters().flushes, 1);
}

#[tokio::test]
async fn test_discard_drops_dirty_data() {
    let h = setup(CacheMode::WriteBack).await;
    write(&h, 0, pattern(8 * KIB, 1)).await;

    h.engine
        .execute(IoRequest::discard(1, 0, 0, 8 * KIB))
        .await
        .unwrap();

    assert!(records(&h, 0, 8 * KIB).await.is_empty());
    assert_eq!(h.backing.counters().discards, 1);
    assert_eq!(h.backing.counters().writes, 0);
}

#[tokio::test]
async fn test_detach_flushes_dirty_data_and_bypasses_after() {
    let h = setup(CacheMode::WriteBack).await;
    let data = pattern(12 * KIB, 11);
    write(&h, 0, data.clone()).await;
    write(&h, 64 * KIB, pattern(4 * KIB, 12)).await;

    let report = h.engine.detach().await.unwrap();
    assert_eq!(report.flushed_records, 2);
    assert_eq!(report.flushed_sectors, 32);
    assert!(h.engine.is_detaching());
    assert_eq!(h.backing.snapshot(0, 12 * KIB), data);
    assert!(records(&h, 0, 128 * KIB).await.iter().all(|r| !r.dirty));

    // New writes go straight to the backing device
    let cache_writes = h.cache.counters().writes;
    write(&h, 256 * KIB, pattern(4 * KIB, 13)).await;
    assert_eq!(h.cache.counters().writes, cache_writes);
    assert!(records(&h, 256 * KIB, 4 * KIB).await.is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_all_complete() {
    let h = setup_with(CacheMode::WriteThrough, |c| Config {
        pending_low_watermark: 1,
        pending_high_watermark: 2,
        ..c
    })
    .await;
    let engine = Arc::new(h.engine);

    let tasks: Vec<_> = (0..16u64)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let offset = i * 8 * KIB;
                engine
                    .execute(IoRequest::write(i, 0, offset, pattern(8 * KIB, i as u8)))
                    .await
                    .unwrap();
                engine
                    .execute(IoRequest::read(i, 0, offset, 8 * KIB))
                    .await
                    .unwrap()
                    .unwrap()
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().to_vec(), pattern(8 * KIB, i as u8));
    }
    assert_eq!(engine.pending(), 0);
}
