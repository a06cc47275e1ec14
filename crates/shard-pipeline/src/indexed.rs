//! Indexed random-access dataset
//!
//! `get(i)` locates sample `i` through the global index, makes the shard
//! local through the cache, and seeks to the sample using a per-shard
//! record index. Record indexes of recently used shards are kept in a
//! small LRU together with their cache leases, so hot shards stay pinned.
//!
//! Every error is returned to the caller: a requested index is never
//! silently replaced or skipped.

use std::collections::VecDeque;
use std::io::BufReader;
use std::sync::Arc;

use data_shard::{ChunkedSampler, GlobalIndex, SamplerState};
use parking_lot::Mutex;
use shard_core::{Error, Manifest, Result, Sample};
use storage::{CacheLease, CacheManager};
use tracing::debug;

use crate::decode::Decoder;
use crate::reader::ShardIndex;

/// Shards whose record index is kept by default
pub const DEFAULT_OPEN_SHARDS: usize = 8;

#[derive(Clone)]
struct OpenShard {
    index: Arc<ShardIndex>,
    lease: Arc<CacheLease>,
}

/// Map-style dataset over a manifest of tar shards
pub struct IndexedDataset {
    manifest: Manifest,
    index: GlobalIndex,
    cache: Arc<CacheManager>,
    decoder: Option<Decoder>,
    open_shards: usize,
    open: Mutex<VecDeque<(usize, OpenShard)>>,
}

impl std::fmt::Debug for IndexedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedDataset")
            .field("shards", &self.manifest.len())
            .field("samples", &self.index.total_samples())
            .field("open_shards", &self.open_shards)
            .finish()
    }
}

impl IndexedDataset {
    /// Dataset over a manifest whose per-shard counts are all known
    pub fn new(manifest: Manifest, cache: Arc<CacheManager>) -> Result<Self> {
        manifest.validate()?;
        let index = GlobalIndex::build(&manifest)?;
        Ok(Self::assemble(manifest, index, cache))
    }

    /// Dataset that counts the samples of shards with unknown counts first.
    ///
    /// Each such shard is fetched into the cache and scanned once; the most
    /// recently probed record indexes stay open for `get`.
    pub fn with_probe(mut manifest: Manifest, cache: Arc<CacheManager>) -> Result<Self> {
        let mut unknown = manifest
            .shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.nsamples == 0)
            .map(|(i, _)| i)
            .collect::<Vec<_>>()
            .into_iter();
        let mut probed = VecDeque::new();

        let index = GlobalIndex::build_with_probe(&mut manifest, |locator| {
            let lease = cache.resolve_local(locator)?;
            let shard = ShardIndex::scan_path(lease.path(), &locator.url)?;
            let count = shard.len() as u64;
            if let Some(position) = unknown.next().filter(|_| !shard.is_empty()) {
                let open = OpenShard {
                    index: Arc::new(shard),
                    lease: Arc::new(lease),
                };
                probed.push_front((position, open));
                probed.truncate(DEFAULT_OPEN_SHARDS);
            }
            Ok(count)
        })?;

        let dataset = Self::assemble(manifest, index, cache);
        *dataset.open.lock() = probed;
        Ok(dataset)
    }

    fn assemble(manifest: Manifest, index: GlobalIndex, cache: Arc<CacheManager>) -> Self {
        debug!(
            shards = manifest.len(),
            samples = index.total_samples(),
            "Built indexed dataset"
        );
        Self {
            manifest,
            index,
            cache,
            decoder: None,
            open_shards: DEFAULT_OPEN_SHARDS,
            open: Mutex::new(VecDeque::new()),
        }
    }

    /// Decode fields of every returned sample
    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Number of shard record indexes kept open (at least 1)
    pub fn with_open_shards(mut self, open_shards: usize) -> Self {
        self.open_shards = open_shards.max(1);
        self.open.get_mut().truncate(self.open_shards);
        self
    }

    pub fn len(&self) -> u64 {
        self.index.total_samples()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Manifest with every shard count filled in
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn index(&self) -> &GlobalIndex {
        &self.index
    }

    /// Sample at a global index
    pub fn get(&self, index: u64) -> Result<Sample> {
        let (shard, offset) = self.index.locate(index)?;
        let open = self.open_shard(shard)?;

        let mut file = BufReader::new(open.lease.open()?);
        let sample = open.index.read_sample(&mut file, offset as usize)?;
        match &self.decoder {
            Some(decoder) => decoder.decode(sample),
            None => Ok(sample),
        }
    }

    /// Samples of the sampler's seeded epoch, in sampler order.
    ///
    /// The sampler must be seeded and cover exactly this dataset.
    pub fn iter_epoch<'a>(
        &'a self,
        sampler: &'a mut ChunkedSampler,
    ) -> Result<impl Iterator<Item = Result<Sample>> + 'a> {
        if sampler.state() == SamplerState::Uninitialized {
            return Err(Error::UninitializedSampler);
        }
        if sampler.total_samples() != self.len() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "sampler covers {} samples but dataset has {}",
                    sampler.total_samples(),
                    self.len()
                ),
            });
        }

        Ok(std::iter::from_fn(move || sampler.next_index().transpose())
            .map(move |index| index.and_then(|i| self.get(i))))
    }

    fn open_shard(&self, shard: usize) -> Result<OpenShard> {
        {
            let mut open = self.open.lock();
            if let Some(pos) = open.iter().position(|(s, _)| *s == shard) {
                if let Some(entry) = open.remove(pos) {
                    let found = entry.1.clone();
                    open.push_front(entry);
                    return Ok(found);
                }
            }
        }

        let locator = &self.manifest.shards[shard];
        let lease = self.cache.resolve_local(locator)?;
        let index = ShardIndex::scan_path(lease.path(), &locator.url)?;
        if index.len() as u64 != locator.nsamples {
            return Err(Error::ManifestParse {
                reason: format!(
                    "shard {} declares {} samples but contains {}",
                    locator.url,
                    locator.nsamples,
                    index.len()
                ),
            });
        }
        debug!(url = %locator.url, samples = index.len(), "Opened shard for random access");

        let loaded = OpenShard {
            index: Arc::new(index),
            lease: Arc::new(lease),
        };

        let mut open = self.open.lock();
        if let Some((_, existing)) = open.iter().find(|(s, _)| *s == shard) {
            return Ok(existing.clone());
        }
        open.push_front((shard, loaded.clone()));
        open.truncate(self.open_shards);
        Ok(loaded)
    }
}
