//! End-to-end streaming over tar shards on disk and over HTTP

mod common;

use anyhow::Result;
use common::{init_logging, key, local_manifest, truncate, write_dataset, FileServer};
use data_shard::{resolve_with, ShardSpec};
use shard_core::{
    CacheConfig, Error, ErrorPolicy, FieldValue, ReaderConfig, RetryConfig, StreamConfig,
    Topology,
};
use shard_pipeline::{Decoder, Loader, StreamPipeline};
use std::collections::HashSet;
use std::sync::Arc;
use storage::{CacheManager, LocalOpener, OpenerRegistry};

fn config(batch_size: usize) -> StreamConfig {
    StreamConfig {
        batch_size,
        shuffle_buffer: 16,
        remix_buffer: 16,
        ..StreamConfig::default()
    }
}

#[test]
fn test_single_pass_decodes_every_sample() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let manifest = local_manifest(dir.path(), 4, 6)?;
    assert_eq!(manifest.total_samples, Some(24));

    let pipeline = StreamPipeline::builder(manifest, Arc::new(LocalOpener::new()))
        .config(config(5))
        .decode(Decoder::standard())
        .build()?;

    let mut keys = HashSet::new();
    for sample in pipeline.samples()? {
        let sample = sample?;
        let Some(FieldValue::Structured(json)) = sample.get("json") else {
            anyhow::bail!("json field not decoded for {}", sample.key);
        };
        let expected = key(
            json["shard"].as_u64().unwrap_or_default() as usize,
            json["index"].as_u64().unwrap_or_default() as usize,
        );
        assert_eq!(sample.key, expected);
        assert!(sample.text("txt").is_some_and(|t| t.starts_with("caption")));
        assert!(keys.insert(sample.key));
    }
    assert_eq!(keys.len(), 24);
    Ok(())
}

#[test]
fn test_with_epoch_on_resampled_source() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manifest = local_manifest(dir.path(), 3, 4)?;

    let pipeline = StreamPipeline::builder(manifest, Arc::new(LocalOpener::new()))
        .config(StreamConfig {
            resampled: true,
            ..config(7)
        })
        .topology(Topology::new(1, 4, 0, 1))
        .build()?;

    // Far more batches than one pass over 12 samples could give
    let mut epoch = pipeline.with_epoch(25)?;
    for _ in 0..2 {
        let batches: Vec<_> = epoch.by_ref().collect::<shard_core::Result<_>>()?;
        assert_eq!(batches.len(), 25);
        assert!(batches.iter().all(|b: &shard_pipeline::Batch| b.len() == 7));
        epoch.next_epoch();
    }
    Ok(())
}

#[test]
fn test_broken_and_truncated_shards_are_skipped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manifest = local_manifest(dir.path(), 4, 6)?;

    // Shard 1 loses its second half, shard 2 disappears
    let shard1 = dir.path().join("shard-001.tar");
    let len = std::fs::metadata(&shard1)?.len();
    truncate(&shard1, len / 2 / 512 * 512 + 100)?;
    std::fs::remove_file(dir.path().join("shard-002.tar"))?;

    let pipeline = StreamPipeline::builder(manifest, Arc::new(LocalOpener::new()))
        .config(config(4))
        .build()?;

    let samples: Vec<_> = pipeline.samples()?.collect::<shard_core::Result<_>>()?;
    let keys: HashSet<String> = samples.iter().map(|s| s.key.clone()).collect();

    for index in 0..6 {
        assert!(keys.contains(&key(0, index)));
        assert!(keys.contains(&key(3, index)));
        assert!(!keys.contains(&key(2, index)));
    }
    // Shard 1 contributes a complete prefix of its records
    let from_truncated: Vec<usize> = (0..6).filter(|i| keys.contains(&key(1, *i))).collect();
    assert!(from_truncated.len() < 6);
    assert_eq!(from_truncated, (0..from_truncated.len()).collect::<Vec<_>>());
    assert!(samples
        .iter()
        .all(|s| s.fields.len() == common::FIELDS_PER_SAMPLE));
    Ok(())
}

#[test]
fn test_strict_policy_surfaces_truncation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut manifest = local_manifest(dir.path(), 2, 6)?;
    manifest.shards.truncate(1);
    manifest.total_samples = None;

    let shard0 = dir.path().join("shard-000.tar");
    let len = std::fs::metadata(&shard0)?.len();
    truncate(&shard0, len / 2 / 512 * 512 + 100)?;

    let pipeline = StreamPipeline::builder(manifest, Arc::new(LocalOpener::new()))
        .config(StreamConfig {
            shuffle_buffer: 0,
            ..config(4)
        })
        .reader_config(ReaderConfig {
            policy: ErrorPolicy::Strict,
            ..ReaderConfig::default()
        })
        .build()?;

    let results: Vec<_> = pipeline.samples()?.collect();
    let (last, complete) = results
        .split_last()
        .ok_or_else(|| anyhow::anyhow!("stream was empty"))?;
    assert!(matches!(last, Err(Error::TruncatedArchive { .. })));
    assert!(complete.iter().all(|r| r.is_ok()));
    assert!(complete.len() < 6);
    Ok(())
}

#[test]
fn test_http_shards_are_downloaded_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let shard_dir = dir.path().join("shards");
    std::fs::create_dir_all(&shard_dir)?;
    write_dataset(&shard_dir, 3, 4)?;
    let server = FileServer::start(&shard_dir)?;

    let registry = Arc::new(OpenerRegistry::new()?);
    let manifest_url = format!("{}/manifest.json", server.base_url);
    let manifest = resolve_with(&ShardSpec::ManifestAt(manifest_url), |url| {
        registry.read_to_string(url)
    })?;
    assert!(manifest.shards[0].url.starts_with(&server.base_url));

    let cache = Arc::new(CacheManager::new(
        CacheConfig {
            dir: dir.path().join("cache"),
            retry: RetryConfig::none(),
            ..CacheConfig::default()
        },
        registry.clone(),
    )?);

    let mut pipeline = StreamPipeline::builder(manifest, registry)
        .config(config(4))
        .cache(Arc::clone(&cache))
        .build()?;

    for epoch in 0..2 {
        pipeline.set_epoch(epoch);
        let count = pipeline.samples()?.collect::<shard_core::Result<Vec<_>>>()?.len();
        assert_eq!(count, 12);
    }

    // One manifest fetch plus one download per shard
    assert_eq!(server.requests(), 4);
    let stats = cache.stats();
    assert_eq!(stats.downloads, 3);
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.entries, 3);
    Ok(())
}

#[test]
fn test_loader_remixes_all_workers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manifest = local_manifest(dir.path(), 6, 5)?;

    let pipeline = StreamPipeline::builder(manifest, Arc::new(LocalOpener::new()))
        .config(StreamConfig {
            prefetch_batches: 2,
            ..config(4)
        })
        .build()?;
    let loader = Loader::new(pipeline, 3)?;

    for epoch in 0..2 {
        let mut keys = HashSet::new();
        let mut batches = 0;
        for batch in loader.epoch(epoch)? {
            batches += 1;
            for sample in batch? {
                assert!(keys.insert(sample.key));
            }
        }
        assert_eq!(keys.len(), 30);
        assert_eq!(batches, 8);
    }
    Ok(())
}
