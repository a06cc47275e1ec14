//! Shard Pipeline - Training data from sharded tar archives
//!
//! This crate provides:
//! - **Shard reading**: lazy tar walking that coalesces members into samples
//! - **Field decoding**: suffix-mapped text, JSON and image decoding
//! - **Streaming**: per-worker shard splits or resampling, reservoir
//!   shuffling, batching and fixed-length epochs
//! - **Multi-worker loading**: worker threads merged through a bounded
//!   channel with a cross-worker remix
//! - **Indexed access**: `get(i)` over cached shards, driven by the chunked
//!   sampler
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use data_shard::{resolve, ShardSpec};
//! use shard_pipeline::{Decoder, StreamPipeline};
//! use shard_core::{StreamConfig, Topology};
//! use storage::OpenerRegistry;
//!
//! # fn example() -> shard_core::Result<()> {
//! let manifest = resolve(&ShardSpec::parse("/data/train-{0000..0099}.tar"))?;
//! let opener = Arc::new(OpenerRegistry::new()?);
//!
//! let pipeline = StreamPipeline::builder(manifest, opener)
//!     .config(StreamConfig { batch_size: 64, resampled: true, ..StreamConfig::default() })
//!     .topology(Topology::new(0, 8, 0, 1))
//!     .decode(Decoder::standard())
//!     .build()?;
//!
//! for batch in pipeline.with_epoch(1000)? {
//!     let batch = batch?;
//!     println!("{} samples", batch.len());
//! }
//! # Ok(())
//! # }
//! ```

mod batch;
mod decode;
mod epoch;
mod indexed;
mod loader;
mod reader;
mod shuffle;
mod stream;

pub use batch::{Batch, Batched, Unbatch};
pub use decode::{DecodeKind, Decoder};
pub use epoch::WithEpoch;
pub use indexed::{IndexedDataset, DEFAULT_OPEN_SHARDS};
pub use loader::{Loader, LoaderIter};
pub use reader::{
    count_samples, split_member_name, MemberSpan, SampleIter, SampleSpan, ShardIndex, ShardReader,
};
pub use shuffle::Shuffled;
pub use stream::{
    BatchStream, MapFn, SampleStream, SelectFn, ShardSource, StreamPipeline, StreamPipelineBuilder,
};

// Re-export types from shard-core for convenience
pub use shard_core::{FieldValue, Sample};
