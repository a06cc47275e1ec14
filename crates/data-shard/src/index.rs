//! Global sample index
//!
//! Maps a dataset-wide sample index to `(shard, offset)` by binary search
//! over cumulative per-shard counts. Built once, read-only afterwards, so
//! lookups from many threads need no locking.

use serde::{Deserialize, Serialize};
use shard_core::{Error, Manifest, Result, ShardLocator};
use std::ops::Range;

/// One row of the index table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Position of the shard in the manifest
    pub shard_index: usize,

    /// Samples in shards `0..=shard_index`
    pub cumulative_count: u64,
}

/// Immutable cumulative-count table over a manifest's shards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalIndex {
    entries: Vec<IndexEntry>,
    total: u64,
}

impl GlobalIndex {
    /// Build from a manifest whose shard counts are all known
    pub fn build(manifest: &Manifest) -> Result<Self> {
        if let Some(shard) = manifest.shards.iter().find(|s| s.nsamples == 0) {
            return Err(Error::ManifestParse {
                reason: format!(
                    "shard {} has no sample count; build the index with a probe",
                    shard.url
                ),
            });
        }
        Ok(Self::from_counts(manifest.shards.iter().map(|s| s.nsamples)))
    }

    /// Build from a manifest, probing each shard with an unknown count once.
    ///
    /// Probed counts are written back into the manifest.
    pub fn build_with_probe<F>(manifest: &mut Manifest, mut probe: F) -> Result<Self>
    where
        F: FnMut(&ShardLocator) -> Result<u64>,
    {
        for shard in manifest.shards.iter_mut().filter(|s| s.nsamples == 0) {
            let count = probe(shard)?;
            tracing::debug!(url = %shard.url, count, "Probed shard sample count");
            shard.nsamples = count;
        }
        manifest.validate()?;
        Ok(Self::from_counts(manifest.shards.iter().map(|s| s.nsamples)))
    }

    /// Build directly from per-shard counts
    pub fn from_counts<I: IntoIterator<Item = u64>>(counts: I) -> Self {
        let mut total = 0u64;
        let entries = counts
            .into_iter()
            .enumerate()
            .map(|(shard_index, count)| {
                total += count;
                IndexEntry {
                    shard_index,
                    cumulative_count: total,
                }
            })
            .collect();

        Self { entries, total }
    }

    /// Translate a global index into `(shard index, offset within shard)`
    pub fn locate(&self, global_index: u64) -> Result<(usize, u64)> {
        if global_index >= self.total {
            return Err(Error::IndexOutOfRange {
                index: global_index,
                total: self.total,
            });
        }

        // First shard whose cumulative count exceeds the index; empty shards
        // share their predecessor's cumulative count and are never selected.
        let shard = self
            .entries
            .partition_point(|e| e.cumulative_count <= global_index);
        let start = self.shard_start(shard);
        Ok((shard, global_index - start))
    }

    /// Total number of samples
    pub fn total_samples(&self) -> u64 {
        self.total
    }

    /// Number of shards
    pub fn num_shards(&self) -> usize {
        self.entries.len()
    }

    /// Global index range covered by a shard
    pub fn shard_range(&self, shard: usize) -> Range<u64> {
        let start = self.shard_start(shard);
        let end = self
            .entries
            .get(shard)
            .map(|e| e.cumulative_count)
            .unwrap_or(start);
        start..end
    }

    /// Index table rows
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    fn shard_start(&self, shard: usize) -> u64 {
        if shard == 0 {
            0
        } else {
            self.entries
                .get(shard - 1)
                .map(|e| e.cumulative_count)
                .unwrap_or(self.total)
        }
    }
}
