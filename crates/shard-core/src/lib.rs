//! Shard Core - Foundation for sharded archive datasets
//!
//! Provides the shared shard/sample types, the error taxonomy, and the
//! configuration and logging setup used by the resolver, reader, cache,
//! streaming pipeline and indexed dataset crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    CacheConfig, DatasetConfig, ErrorPolicy, LogConfig, PipelineRule, ReaderConfig,
    RetryConfig, SamplerConfig, StreamConfig,
};
pub use error::{Error, Result};
pub use types::*;
