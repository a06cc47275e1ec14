//! Local filesystem opener

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use shard_core::{Error, Result};
use tracing::instrument;

use crate::{ShardOpener, ShardStream};

/// Opens plain paths and `file://` URLs
#[derive(Debug, Clone, Default)]
pub struct LocalOpener {
    /// Directory relative paths are resolved against
    base_path: Option<PathBuf>,
}

impl LocalOpener {
    /// Resolve relative paths against the working directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `base_path`
    pub fn with_base<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: Some(base_path.as_ref().to_path_buf()),
        }
    }

    /// Filesystem path for a local locator
    pub fn resolve_path(&self, url: &str) -> PathBuf {
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Whether a locator names a file on this machine
pub fn is_local(url: &str) -> bool {
    match shard_core::scheme_of(url) {
        None => !url.starts_with("pipe:"),
        Some(scheme) => scheme == "file",
    }
}

impl ShardOpener for LocalOpener {
    #[instrument(skip(self), fields(opener = "local"))]
    fn open(&self, url: &str) -> Result<ShardStream> {
        let path = self.resolve_path(url);
        let file = File::open(&path).map_err(|e| Error::open(url, e))?;
        Ok(Box::new(BufReader::with_capacity(1 << 16, file)))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
