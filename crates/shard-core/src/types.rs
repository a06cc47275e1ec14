//! Core type definitions for sharded archive datasets

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Training epoch counter
pub type Epoch = u64;

/// Reserved field holding the sample's unique key
pub const KEY_FIELD: &str = "__key__";

/// Reserved field holding the URL of the shard a sample came from
pub const URL_FIELD: &str = "__url__";

/// One shard reference: where it lives plus optional known size and count.
///
/// `nbytes == 0` and `nsamples == 0` both mean "unknown".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardLocator {
    /// URL or filesystem path
    pub url: String,

    /// Size of the shard file in bytes
    #[serde(default)]
    pub nbytes: u64,

    /// Number of samples in the shard
    #[serde(default)]
    pub nsamples: u64,
}

impl ShardLocator {
    /// Locator with unknown size and count
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            nbytes: 0,
            nsamples: 0,
        }
    }

    /// Locator with known size and count
    pub fn with_counts(url: impl Into<String>, nbytes: u64, nsamples: u64) -> Self {
        Self {
            url: url.into(),
            nbytes,
            nsamples,
        }
    }

    /// URL scheme, or `None` for plain filesystem paths
    pub fn scheme(&self) -> Option<&str> {
        scheme_of(&self.url)
    }
}

/// Extract the scheme of a URL (`"s3"` for `s3://bucket/key`)
pub fn scheme_of(url: &str) -> Option<&str> {
    let (scheme, _) = url.split_once("://")?;
    if !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
    {
        Some(scheme)
    } else {
        None
    }
}

/// Ordered list of shards plus dataset-level metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Shards in dataset order
    pub shards: Vec<ShardLocator>,

    /// Prefix applied to relative shard URLs
    #[serde(default)]
    pub base: Option<String>,

    /// Declared total number of samples
    #[serde(default)]
    pub total_samples: Option<u64>,
}

impl Manifest {
    /// Create a manifest from already-resolved shards
    pub fn new(shards: Vec<ShardLocator>) -> Self {
        Self {
            shards,
            base: None,
            total_samples: None,
        }
    }

    /// Number of shards
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the manifest lists no shards
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shard URLs in order
    pub fn urls(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.url.clone()).collect()
    }

    /// Sum of per-shard counts if every shard's count is known
    pub fn known_total(&self) -> Option<u64> {
        if self.shards.iter().all(|s| s.nsamples > 0) {
            Some(self.shards.iter().map(|s| s.nsamples).sum())
        } else {
            None
        }
    }

    /// Check the declared total against the per-shard counts
    pub fn validate(&self) -> Result<()> {
        if let (Some(declared), Some(actual)) = (self.total_samples, self.known_total()) {
            if declared != actual {
                return Err(Error::ManifestParse {
                    reason: format!(
                        "declared total_samples {} does not match sum of shard counts {}",
                        declared, actual
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Rank and worker position of one data-loading process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Node (process group) rank
    pub rank: u32,

    /// Number of nodes
    pub world_size: u32,

    /// Loader worker index within the node
    pub worker_id: u32,

    /// Loader workers per node
    pub num_workers: u32,
}

impl Default for Topology {
    fn default() -> Self {
        Self::single()
    }
}

impl Topology {
    /// One node, one worker
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            worker_id: 0,
            num_workers: 1,
        }
    }

    /// Topology for a given position
    pub fn new(rank: u32, world_size: u32, worker_id: u32, num_workers: u32) -> Self {
        Self {
            rank,
            world_size,
            worker_id,
            num_workers,
        }
    }

    /// Same node, different worker
    pub fn with_worker(self, worker_id: u32, num_workers: u32) -> Self {
        Self {
            worker_id,
            num_workers,
            ..self
        }
    }

    /// Reject empty worlds and out-of-range positions
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 || self.num_workers == 0 {
            return Err(Error::InvalidWorldSize {
                world_size: self.world_size,
                num_workers: self.num_workers,
            });
        }
        if self.rank >= self.world_size || self.worker_id >= self.num_workers {
            return Err(Error::InvalidConfig {
                message: format!(
                    "position rank={} worker={} outside world_size={} num_workers={}",
                    self.rank, self.worker_id, self.world_size, self.num_workers
                ),
            });
        }
        Ok(())
    }

    /// Total number of (rank, worker) slots
    pub fn slots(&self) -> u64 {
        self.world_size as u64 * self.num_workers as u64
    }

    /// Index of this (rank, worker) pair among all slots
    pub fn slot(&self) -> u64 {
        self.rank as u64 * self.num_workers as u64 + self.worker_id as u64
    }
}

/// Decoded raster image, row-major, interleaved channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

/// Payload of one sample field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Raw bytes as stored in the archive
    Bytes(Bytes),

    /// UTF-8 text
    Text(String),

    /// Decoded image
    Image(DecodedImage),

    /// Parsed JSON document
    Structured(serde_json::Value),
}

impl FieldValue {
    /// Raw bytes, if the field has not been decoded
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Text, if the field was decoded as text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Approximate payload size in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            FieldValue::Bytes(b) => b.len(),
            FieldValue::Text(s) => s.len(),
            FieldValue::Image(img) => img.pixels.len(),
            FieldValue::Structured(v) => v.to_string().len(),
        }
    }
}

/// One record: a key, its source shard, and named field payloads
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Unique sample key (archive member stem)
    pub key: String,

    /// URL of the shard the sample was read from
    pub url: String,

    /// Field suffix -> payload
    pub fields: BTreeMap<String, FieldValue>,
}

impl Sample {
    /// Empty sample
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Insert or replace a field
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Look up a non-reserved field
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Raw bytes of a field
    pub fn bytes(&self, name: &str) -> Option<&Bytes> {
        self.get(name).and_then(FieldValue::as_bytes)
    }

    /// Decoded text of a field
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    /// Field values in the requested order; reserved names map to text
    pub fn to_tuple(&self, names: &[&str]) -> Result<Vec<FieldValue>> {
        names
            .iter()
            .map(|name| match *name {
                KEY_FIELD => Ok(FieldValue::Text(self.key.clone())),
                URL_FIELD => Ok(FieldValue::Text(self.url.clone())),
                other => self.fields.get(other).cloned().ok_or_else(|| Error::Decode {
                    url: self.url.clone(),
                    key: self.key.clone(),
                    field: other.to_string(),
                    reason: "field not present".to_string(),
                }),
            })
            .collect()
    }

    /// Total payload size across fields
    pub fn size_bytes(&self) -> usize {
        self.fields.values().map(FieldValue::size_bytes).sum()
    }
}
