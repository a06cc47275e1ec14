//! Shard opener trait definition
//!
//! Defines the interface every way of reaching a shard must implement.

use shard_core::Result;
use std::io::Read;

/// Byte stream of one shard, read front to back exactly once
pub type ShardStream = Box<dyn Read + Send>;

/// Opens a shard URL as a byte stream
///
/// Implementors cover one family of locators (filesystem paths, HTTP(S),
/// object storage, external commands). The stream is owned by the caller;
/// dropping it releases any file handle, connection or child process.
pub trait ShardOpener: Send + Sync {
    /// Open the shard at `url`
    ///
    /// # Errors
    /// Returns `Error::Open` if the shard is unreachable
    fn open(&self, url: &str) -> Result<ShardStream>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}
