//! Error types for sharded dataset access

use thiserror::Error;

/// Result type alias using the shard Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for shard resolution, reading, caching and sampling
#[derive(Error, Debug)]
pub enum Error {
    // Input errors
    #[error("Malformed shard pattern '{pattern}': {reason}")]
    MalformedPattern { pattern: String, reason: String },

    #[error("Manifest parse error: {reason}")]
    ManifestParse { reason: String },

    // Shard-level errors
    #[error("Failed to open shard {url}: {reason}")]
    Open { url: String, reason: String },

    #[error("Failed to download shard {url}: {reason}")]
    Download { url: String, reason: String },

    // Record-level errors
    #[error("Truncated archive {url} at byte offset {offset}")]
    TruncatedArchive { url: String, offset: u64 },

    #[error("Decode error in {url} (key={key}, field={field}): {reason}")]
    Decode {
        url: String,
        key: String,
        field: String,
        reason: String,
    },

    // Programmer errors
    #[error("Index {index} out of range for dataset of {total} samples")]
    IndexOutOfRange { index: u64, total: u64 },

    #[error("Invalid world size: world_size={world_size}, num_workers={num_workers}")]
    InvalidWorldSize { world_size: u32, num_workers: u32 },

    #[error("Sampler has no epoch; call set_epoch before requesting indices")]
    UninitializedSampler,

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Open { .. } | Error::Download { .. } | Error::Io(_)
        )
    }

    /// Returns true if this error indicates a misconfiguration that will recur
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedPattern { .. }
                | Error::ManifestParse { .. }
                | Error::IndexOutOfRange { .. }
                | Error::InvalidWorldSize { .. }
                | Error::UninitializedSampler
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Errors confined to one shard; streaming mode skips the shard
    pub fn is_shard_level(&self) -> bool {
        matches!(self, Error::Open { .. } | Error::Download { .. })
    }

    /// Errors confined to one record; streaming mode skips the record
    pub fn is_record_level(&self) -> bool {
        matches!(self, Error::TruncatedArchive { .. } | Error::Decode { .. })
    }

    /// Shorthand for an `Open` error
    pub fn open(url: impl Into<String>, reason: impl ToString) -> Self {
        Error::Open {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a `Download` error
    pub fn download(url: impl Into<String>, reason: impl ToString) -> Self {
        Error::Download {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
