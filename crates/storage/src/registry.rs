//! Scheme-based opener dispatch
//!
//! Picks the opener for a shard URL in this order:
//! 1. `pipe:<command>` runs the command as-is
//! 2. a configured pipeline rule whose suffix matches the URL
//! 3. the opener registered for the URL's scheme
//! 4. the local opener for plain paths and `file://`

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use shard_core::{log_open, scheme_of, Error, LogConfig, PipelineRule, ReaderConfig, Result};

use crate::{HttpOpener, LocalOpener, ProcessOpener, ShardOpener, ShardStream};

/// Prefix marking a URL that is itself a shell command
pub const PIPE_PREFIX: &str = "pipe:";

/// Routes URLs to openers
#[derive(Clone)]
pub struct OpenerRegistry {
    schemes: HashMap<String, Arc<dyn ShardOpener>>,
    local: Arc<dyn ShardOpener>,
    pipelines: Vec<PipelineRule>,
    log: LogConfig,
}

impl std::fmt::Debug for OpenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self
            .schemes
            .iter()
            .map(|(scheme, opener)| (scheme.as_str(), opener.name()))
            .collect();
        schemes.sort_unstable();
        f.debug_struct("OpenerRegistry")
            .field("schemes", &schemes)
            .field("pipelines", &self.pipelines)
            .finish()
    }
}

impl OpenerRegistry {
    /// Local paths only
    pub fn local_only() -> Self {
        Self {
            schemes: HashMap::new(),
            local: Arc::new(LocalOpener::new()),
            pipelines: Vec::new(),
            log: LogConfig::default(),
        }
    }

    /// Local paths, `file://`, `http://` and `https://`
    pub fn new() -> Result<Self> {
        let mut registry = Self::local_only();
        let http: Arc<dyn ShardOpener> = Arc::new(HttpOpener::new()?);
        registry.register("http", Arc::clone(&http));
        registry.register("https", http);
        Ok(registry)
    }

    /// Default openers plus the reader's pipeline rules and logging
    pub fn from_config(config: &ReaderConfig) -> Result<Self> {
        let mut registry = Self::new()?;
        registry.pipelines = config.pipelines.clone();
        registry.log = config.log.clone();
        Ok(registry)
    }

    /// Register or replace the opener for a scheme
    pub fn register(&mut self, scheme: impl Into<String>, opener: Arc<dyn ShardOpener>) {
        self.schemes.insert(scheme.into(), opener);
    }

    /// Register an S3 opener for `s3://` URLs.
    ///
    /// Not part of `new()`: building the client starts a runtime and loads
    /// credentials, which must happen outside any async context.
    #[cfg(feature = "s3")]
    pub fn register_s3(&mut self, config: crate::S3Config) -> Result<()> {
        let opener = crate::S3Opener::with_config(config)?;
        self.register("s3", Arc::new(opener));
        Ok(())
    }

    /// Route URLs ending in `suffix` through `command`
    pub fn add_pipeline(&mut self, suffix: impl Into<String>, command: impl Into<String>) {
        self.pipelines.push(PipelineRule {
            suffix: suffix.into(),
            command: command.into(),
        });
    }

    pub fn set_log(&mut self, log: LogConfig) {
        self.log = log;
    }

    /// Whether some opener accepts `url`
    pub fn supports(&self, url: &str) -> bool {
        self.resolve(url).is_ok()
    }

    fn resolve(&self, url: &str) -> Result<Arc<dyn ShardOpener>> {
        if let Some(command) = url.strip_prefix(PIPE_PREFIX) {
            return Ok(Arc::new(ProcessOpener::new(command)));
        }
        if let Some(rule) = self.pipelines.iter().find(|r| url.ends_with(&r.suffix)) {
            return Ok(Arc::new(ProcessOpener::new(rule.command.clone())));
        }
        match scheme_of(url) {
            None | Some("file") => Ok(Arc::clone(&self.local)),
            Some(scheme) => self
                .schemes
                .get(scheme)
                .cloned()
                .ok_or_else(|| Error::open(url, format!("no opener registered for '{}'", scheme))),
        }
    }

    /// Read a small document (a manifest) fully into a string
    pub fn read_to_string(&self, url: &str) -> Result<String> {
        let mut text = String::new();
        self.open(url)?
            .read_to_string(&mut text)
            .map_err(|e| Error::open(url, e))?;
        Ok(text)
    }
}

impl ShardOpener for OpenerRegistry {
    fn open(&self, url: &str) -> Result<ShardStream> {
        let opener = self.resolve(url)?;
        log_open!(self.log, %url, opener = opener.name(), "Opening shard");
        opener.open(url)
    }

    fn name(&self) -> &'static str {
        "registry"
    }
}
