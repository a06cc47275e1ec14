//! HTTP(S) opener
//!
//! Streams the response body; nothing is buffered beyond reqwest's own
//! read buffer.

use std::time::Duration;

use reqwest::blocking::Client;
use shard_core::{Error, Result};
use tracing::instrument;

use crate::{ShardOpener, ShardStream};

/// Connect timeout for shard requests
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens `http://` and `https://` URLs with a blocking client
#[derive(Debug, Clone)]
pub struct HttpOpener {
    client: Client,
}

impl HttpOpener {
    /// Client with default timeouts
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            // No overall timeout; shard bodies can take minutes to stream.
            .timeout(None)
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    /// Use an already configured client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl ShardOpener for HttpOpener {
    #[instrument(skip(self), fields(opener = "http"))]
    fn open(&self, url: &str) -> Result<ShardStream> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::open(url, e))?
            .error_for_status()
            .map_err(|e| Error::open(url, e))?;

        Ok(Box::new(response))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
