//! S3 opener
//!
//! Fetches whole objects through the AWS SDK on a private runtime and hands
//! them out as in-memory streams. Supports custom endpoints (MinIO,
//! LocalStack) through `S3Config`.
//!
//! `open` blocks on the private runtime, so it must not be called from
//! inside another tokio runtime's async context.

use std::io::Cursor;

use aws_config::BehaviorVersion;
use aws_sdk_s3::{config::Builder as S3ConfigBuilder, Client};
use bytes::Bytes;
use shard_core::{Error, Result, RetryConfig};
use tokio::runtime::Runtime;
use tracing::{debug, instrument};

use crate::retry::with_retry;
use crate::{ShardOpener, ShardStream};

/// Configuration for S3Opener
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Optional custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// AWS region (default: "us-east-1")
    pub region: Option<String>,
    /// Force path-style addressing (required for MinIO)
    pub force_path_style: bool,
    /// Retries for transient request failures
    pub retry: RetryConfig,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            region: Some("us-east-1".to_string()),
            force_path_style: false,
            retry: RetryConfig::default(),
        }
    }
}

/// Opens `s3://bucket/key` URLs
#[derive(Debug)]
pub struct S3Opener {
    client: Client,
    runtime: Runtime,
    retry: RetryConfig,
}

impl S3Opener {
    /// Opener with default AWS configuration
    ///
    /// Uses environment variables or instance profile for credentials.
    pub fn new() -> Result<Self> {
        Self::with_config(S3Config::default())
    }

    /// Opener with custom configuration
    pub fn with_config(config: S3Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("s3-opener")
            .enable_all()
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to start S3 runtime: {}", e),
            })?;

        let region = config.region.unwrap_or_else(|| "us-east-1".to_string());
        let aws_config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_sdk_s3::config::Region::new(region))
                .load(),
        );

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);
        if let Some(endpoint) = &config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            runtime,
            retry: config.retry,
        })
    }

    /// Opener for a MinIO endpoint (convenience constructor)
    pub fn minio(endpoint: &str) -> Result<Self> {
        Self::with_config(S3Config {
            endpoint_url: Some(endpoint.to_string()),
            force_path_style: true,
            ..Default::default()
        })
    }

    async fn get_object(&self, url: &str, bucket: &str, key: &str) -> Result<Bytes> {
        let result = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::open(url, format!("S3 get_object failed: {}", e)))?;

        let body = result
            .body
            .collect()
            .await
            .map_err(|e| Error::open(url, format!("Failed to read S3 response body: {}", e)))?;

        Ok(body.into_bytes())
    }
}

/// Split `s3://bucket/key` into its parts
pub fn parse_s3_url(url: &str) -> Result<(&str, &str)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| Error::open(url, "not an s3:// URL"))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => Err(Error::open(url, "expected s3://bucket/key")),
    }
}

impl ShardOpener for S3Opener {
    #[instrument(skip(self), fields(opener = "s3"))]
    fn open(&self, url: &str) -> Result<ShardStream> {
        let (bucket, key) = parse_s3_url(url)?;
        debug!(%bucket, %key, "Fetching from S3");

        let bytes = with_retry(&self.retry, "get_object", || {
            self.runtime.block_on(self.get_object(url, bucket, key))
        })?;

        debug!(%bucket, %key, size = bytes.len(), "Fetched from S3");
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_url() {
        assert_eq!(
            parse_s3_url("s3://bucket/data/shard-000.tar").unwrap(),
            ("bucket", "data/shard-000.tar")
        );
        assert!(parse_s3_url("s3://bucket").is_err());
        assert!(parse_s3_url("s3:///key").is_err());
        assert!(parse_s3_url("https://bucket/key").is_err());
    }
}
