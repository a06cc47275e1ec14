//! Storage - Shard openers and the local shard cache
//!
//! Provides blocking shard access with support for:
//! - Local filesystem paths and `file://` URLs (default feature)
//! - HTTP(S) URLs
//! - Amazon S3 / S3-compatible storage (with `s3` feature)
//! - External command pipelines (`pipe:` URLs and suffix rules)
//! - A bounded, directory-scoped download cache with LRU eviction
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use storage::{CacheManager, OpenerRegistry};
//! use shard_core::{CacheConfig, ShardLocator};
//!
//! # fn example() -> shard_core::Result<()> {
//! let registry = Arc::new(OpenerRegistry::new()?);
//! let cache = Arc::new(CacheManager::new(CacheConfig::default(), registry)?);
//!
//! let lease = cache.resolve_local(&ShardLocator::new("https://host/shard-000.tar"))?;
//! let file = lease.open()?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod cache;
mod http;
mod local;
mod pipe;
mod registry;
mod retry;

#[cfg(feature = "s3")]
mod s3;

pub use backend::{ShardOpener, ShardStream};
pub use cache::{cache_file_name, CacheEntry, CacheLease, CacheManager, CacheStats, CleanupTask};
pub use http::HttpOpener;
pub use local::{is_local, LocalOpener};
pub use pipe::{ProcessOpener, URL_PLACEHOLDER};
pub use registry::{OpenerRegistry, PIPE_PREFIX};
pub use retry::with_retry;

#[cfg(feature = "s3")]
pub use s3::{parse_s3_url, S3Config, S3Opener};
