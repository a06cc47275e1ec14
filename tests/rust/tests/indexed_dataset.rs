//! Sampler-driven random access over cached shards

mod common;

use anyhow::Result;
use common::{key, local_manifest, write_dataset, write_shard, FileServer};
use data_shard::ChunkedSampler;
use shard_core::{CacheConfig, Error, Manifest, RetryConfig, SamplerConfig, ShardLocator, Topology};
use shard_pipeline::{DecodeKind, Decoder, IndexedDataset};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{CacheManager, LocalOpener, OpenerRegistry, ShardOpener, ShardStream};
use tokio::runtime::Handle;

/// Serves shard bytes from memory under `mem://`
struct MemOpener {
    shards: HashMap<String, Vec<u8>>,
    opens: AtomicUsize,
}

impl ShardOpener for MemOpener {
    fn open(&self, url: &str) -> shard_core::Result<ShardStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let data = self
            .shards
            .get(url)
            .cloned()
            .ok_or_else(|| Error::open(url, "not in memory"))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn name(&self) -> &'static str {
        "mem"
    }
}

fn cache_config(dir: &std::path::Path) -> CacheConfig {
    CacheConfig {
        dir: dir.join("cache"),
        retry: RetryConfig::none(),
        ..CacheConfig::default()
    }
}

#[test]
fn test_sampler_partitions_indexed_epoch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manifest = local_manifest(dir.path(), 5, 7)?;
    let cache = Arc::new(CacheManager::new(
        cache_config(dir.path()),
        Arc::new(LocalOpener::new()),
    )?);
    let dataset = IndexedDataset::new(manifest, cache)?
        .with_decoder(Decoder::new().with("cls", DecodeKind::Text));
    assert_eq!(dataset.len(), 35);

    let config = SamplerConfig {
        chunk_size: 4,
        shuffle: true,
        seed: 1234,
    };
    let mut all = HashSet::new();
    for rank in 0..2 {
        for worker in 0..2 {
            let topology = Topology::new(rank, 2, worker, 2);
            let mut sampler = ChunkedSampler::new(dataset.len(), config.clone(), topology)?;

            sampler.set_epoch(5);
            let first: Vec<String> = dataset
                .iter_epoch(&mut sampler)?
                .map(|s| s.map(|s| s.key))
                .collect::<shard_core::Result<_>>()?;

            // Same epoch again: identical order
            sampler.set_epoch(5);
            let again: Vec<String> = dataset
                .iter_epoch(&mut sampler)?
                .map(|s| s.map(|s| s.key))
                .collect::<shard_core::Result<_>>()?;
            assert_eq!(first, again);

            for k in first {
                assert!(all.insert(k), "index served to two slots");
            }
        }
    }
    assert_eq!(all.len(), 35);
    Ok(())
}

#[test]
fn test_http_random_access_with_eviction() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let shard_dir = dir.path().join("shards");
    std::fs::create_dir_all(&shard_dir)?;
    let manifest_path = write_dataset(&shard_dir, 4, 5)?;
    let server = FileServer::start(&shard_dir)?;

    let mut manifest = server.manifest(&manifest_path)?;
    let shard_size = manifest.shards[0].nbytes;
    // Counts are probed on first use
    for shard in &mut manifest.shards {
        shard.nsamples = 0;
    }
    manifest.total_samples = None;

    let cache = Arc::new(CacheManager::new(
        CacheConfig {
            max_bytes: Some(shard_size * 2),
            ..cache_config(dir.path())
        },
        Arc::new(OpenerRegistry::new()?),
    )?);
    let dataset = IndexedDataset::with_probe(manifest, Arc::clone(&cache))?.with_open_shards(1);
    assert_eq!(dataset.len(), 20);

    for i in (0..20u64).rev() {
        let sample = dataset.get(i)?;
        let (shard, index) = (i as usize / 5, i as usize % 5);
        assert_eq!(sample.key, key(shard, index));
        assert_eq!(
            sample.bytes("txt").map(|b| b.to_vec()),
            Some(format!("caption {} {}", shard, index).into_bytes())
        );
    }

    let stats = cache.stats();
    assert!(stats.evictions > 0);
    assert!(stats.used_bytes <= shard_size * 2);
    assert!(matches!(
        dataset.get(20),
        Err(Error::IndexOutOfRange { index: 20, total: 20 })
    ));
    Ok(())
}

#[test]
fn test_missing_remote_shard_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let shard_dir = dir.path().join("shards");
    std::fs::create_dir_all(&shard_dir)?;
    let manifest_path = write_dataset(&shard_dir, 2, 3)?;
    std::fs::remove_file(shard_dir.join("shard-001.tar"))?;
    let server = FileServer::start(&shard_dir)?;

    let cache = Arc::new(CacheManager::new(
        cache_config(dir.path()),
        Arc::new(OpenerRegistry::new()?),
    )?);
    let dataset = IndexedDataset::new(server.manifest(&manifest_path)?, cache)?;

    assert!(dataset.get(2).is_ok());
    assert!(matches!(dataset.get(3), Err(Error::Download { .. })));
    Ok(())
}

#[tokio::test]
async fn test_cleanup_task_expires_idle_shards() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut shards = HashMap::new();
    let mut locators = Vec::new();
    for shard in 0..3 {
        let path = dir.path().join(format!("src-{}.tar", shard));
        write_shard(&path, shard, 2)?;
        let url = format!("mem://bucket/shard-{}.tar", shard);
        shards.insert(url.clone(), std::fs::read(&path)?);
        locators.push(ShardLocator::with_counts(url, 0, 2));
    }
    let opener = Arc::new(MemOpener {
        shards,
        opens: AtomicUsize::new(0),
    });

    let mut registry = OpenerRegistry::local_only();
    registry.register("mem", opener.clone());
    let cache = Arc::new(CacheManager::new(
        CacheConfig {
            max_age: Duration::ZERO,
            cleanup_interval: Duration::from_millis(50),
            ..cache_config(dir.path())
        },
        Arc::new(registry),
    )?);

    let dataset = IndexedDataset::new(Manifest::new(locators), Arc::clone(&cache))?
        .with_open_shards(1);
    for i in 0..6 {
        dataset.get(i)?;
    }
    assert_eq!(opener.opens.load(Ordering::SeqCst), 3);

    let task = cache.start_cleanup(&Handle::current());
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Only the shard still pinned by the dataset survives
    let remaining: Vec<ShardLocator> = cache
        .entries()
        .into_iter()
        .filter_map(|e| e.url.map(ShardLocator::new))
        .collect();
    assert_eq!(remaining, vec![ShardLocator::new("mem://bucket/shard-2.tar")]);

    task.stop().await?;
    drop(dataset);
    assert_eq!(cache.cleanup_expired(), 1);
    assert_eq!(cache.stats().entries, 0);
    Ok(())
}
