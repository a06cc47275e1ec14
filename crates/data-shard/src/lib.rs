//! Shard resolution and sample ordering for distributed ML training
//!
//! This crate provides:
//! - **Shard resolution** from URL lists, brace patterns and JSON manifests
//! - **Global indexing** from a dataset-wide sample index to (shard, offset)
//! - **Shard splitting** across nodes and loader workers, or endless resampling
//! - **Chunked sampling** of per-(rank, worker) index sequences for random access
//!
//! # Example
//!
//! ```rust
//! use data_shard::{resolve, ChunkedSampler, GlobalIndex, ShardSpec};
//! use shard_core::{SamplerConfig, Topology};
//!
//! // Ten shards named shard-000.tar .. shard-009.tar
//! let mut manifest = resolve(&ShardSpec::parse("shard-{000..009}.tar")).unwrap();
//! for shard in &mut manifest.shards {
//!     shard.nsamples = 100;
//! }
//!
//! let index = GlobalIndex::build(&manifest).unwrap();
//! assert_eq!(index.locate(250).unwrap(), (2, 50));
//!
//! // Rank 1 of 2, single worker
//! let topology = Topology::new(1, 2, 0, 1);
//! let mut sampler =
//!     ChunkedSampler::new(index.total_samples(), SamplerConfig::default(), topology).unwrap();
//! sampler.set_epoch(0);
//! let indices = sampler.indices().unwrap();
//! assert!(indices.iter().all(|&i| i < 1000));
//! ```

mod index;
mod resolver;
mod sampler;
mod seed;
mod split;

// Re-export main types
pub use index::{GlobalIndex, IndexEntry};
pub use resolver::{expand_braces, join_base, parse_manifest, resolve, resolve_with, ShardSpec};
pub use sampler::{Chunk, ChunkedSampler, EpochPlan, SamplerState};
pub use seed::{derive_seed, seeded_rng};
pub use split::{shuffled_shard_order, ResampledShards, ShardSplit, SplitPolicy};

// Re-export types from shard-core for convenience
pub use shard_core::{Epoch, Manifest, ShardLocator, Topology};
