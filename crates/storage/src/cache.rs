//! Local shard cache
//!
//! Downloads remote shards into a directory and hands out leases on the
//! local copies. Guarantees:
//! - one in-flight download per URL within a process (per-file lock)
//! - readers never see a partial file (download to `.tmp`, then rename)
//! - leased entries are never evicted (reference counted)
//! - eviction is strict least-recently-used once `max_bytes` is exceeded
//!
//! Other processes sharing the directory are tolerated, not coordinated:
//! the atomic rename is the only cross-process synchronization.

use std::collections::HashMap;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fnv::FnvHasher;
use parking_lot::Mutex;
use shard_core::{log_open, CacheConfig, Error, Result, ShardLocator};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::local::{is_local, LocalOpener};
use crate::retry::with_retry;
use crate::ShardOpener;

/// Temporary files untouched for this long belong to a dead download
const STALE_TEMP_AGE: Duration = Duration::from_secs(300);

/// Suffix of in-progress downloads
const TEMP_SUFFIX: &str = ".tmp";

/// Longest sanitized basename kept in a cache file name
const MAX_BASENAME_LEN: usize = 64;

/// One cached shard file
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Source URL; `None` for files adopted from a previous run
    pub url: Option<String>,

    /// Local file
    pub path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Open leases
    pub refs: usize,

    /// Logical access clock, larger is more recent
    pub last_used: u64,

    /// Wall-clock time of the last access
    pub last_access: DateTime<Utc>,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub downloads: u64,
    pub download_failures: u64,
    pub evictions: u64,
    pub entries: usize,
    pub used_bytes: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    used_bytes: u64,
    tick: u64,
    stats: CacheStats,
}

impl CacheState {
    fn touch(&mut self, name: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(name) {
            entry.last_used = tick;
            entry.last_access = Utc::now();
        }
    }

    fn insert(&mut self, name: String, entry: CacheEntry) {
        self.used_bytes += entry.size;
        if let Some(old) = self.entries.insert(name, entry) {
            self.used_bytes -= old.size;
        }
    }

    fn remove(&mut self, name: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(name)?;
        self.used_bytes -= entry.size;
        Some(entry)
    }
}

/// Directory-scoped shard cache
pub struct CacheManager {
    dir: PathBuf,
    config: CacheConfig,
    opener: Arc<dyn ShardOpener>,
    state: Mutex<CacheState>,

    /// Per cache file download lock
    downloads: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("dir", &self.dir)
            .field("opener", &self.opener.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl CacheManager {
    /// Open (creating if needed) the cache directory and adopt its files
    pub fn new(config: CacheConfig, opener: Arc<dyn ShardOpener>) -> Result<Self> {
        let dir = config.dir.clone();
        fs::create_dir_all(&dir)?;

        let manager = Self {
            dir,
            config,
            opener,
            state: Mutex::new(CacheState::default()),
            downloads: DashMap::new(),
        };
        manager.adopt_existing()?;
        Ok(manager)
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local copy of `locator`, downloading it on first use.
    ///
    /// Local paths are returned as-is without copying. Concurrent calls for
    /// the same URL share one download.
    #[instrument(skip(self, locator), fields(url = %locator.url))]
    pub fn resolve_local(self: &Arc<Self>, locator: &ShardLocator) -> Result<CacheLease> {
        let url = &locator.url;
        if is_local(url) {
            let path = LocalOpener::new().resolve_path(url);
            if !path.is_file() {
                return Err(Error::open(url.as_str(), "no such file"));
            }
            return Ok(CacheLease::direct(path));
        }

        let name = cache_file_name(url);
        let slot = self
            .downloads
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _download = slot.lock();
            self.hit_or_download(&name, locator)
        };
        drop(slot);

        // Only the map still holds the lock: nobody is waiting on it
        self.downloads.remove_if(&name, |_, slot| Arc::strong_count(slot) == 1);
        result
    }

    /// Runs under the per-file download lock
    fn hit_or_download(
        self: &Arc<Self>,
        name: &str,
        locator: &ShardLocator,
    ) -> Result<CacheLease> {
        let url = &locator.url;
        if let Some(lease) = self.try_hit(name, locator) {
            return Ok(lease);
        }
        self.state.lock().stats.misses += 1;

        let path = self.dir.join(name);
        let size = self.download(locator, name, &path)?;

        let mut state = self.state.lock();
        state.tick += 1;
        let entry = CacheEntry {
            url: Some(url.clone()),
            path: path.clone(),
            size,
            refs: 1,
            last_used: state.tick,
            last_access: Utc::now(),
        };
        state.insert(name.to_string(), entry);
        state.stats.downloads += 1;
        self.evict_locked(&mut state);

        Ok(CacheLease::pinned(path, Arc::clone(self), name.to_string()))
    }

    /// Whether a complete copy of `url` is cached
    pub fn contains(&self, url: &str) -> bool {
        self.state.lock().entries.contains_key(&cache_file_name(url))
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            used_bytes: state.used_bytes,
            ..state.stats
        }
    }

    /// Snapshot of all entries, least recently used first
    pub fn entries(&self) -> Vec<CacheEntry> {
        let state = self.state.lock();
        let mut entries: Vec<CacheEntry> = state.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.last_used);
        entries
    }

    /// Remove unleased entries idle longer than `max_age` and stale
    /// temporary files. Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        // An age too large to represent expires nothing
        let cutoff = chrono::Duration::from_std(self.config.max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));

        let removed = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.refs == 0 && cutoff.is_some_and(|c| e.last_access < c))
                .map(|(name, _)| name.clone())
                .collect();
            for name in &expired {
                if let Some(entry) = state.remove(name) {
                    remove_file_quietly(&entry.path);
                }
            }
            expired.len()
        };

        let temps = self.remove_stale_temps();
        if removed > 0 || temps > 0 {
            debug!(removed, temps, "Cleaned up cache directory");
        }
        removed
    }

    /// Remove every unleased entry
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let idle: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.refs == 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &idle {
            if let Some(entry) = state.remove(name) {
                remove_file_quietly(&entry.path);
            }
        }
        idle.len()
    }

    /// Start the periodic cleanup loop on `runtime`.
    ///
    /// Runs every `cleanup_interval` until [`CleanupTask::stop`] is called or
    /// the task handle is dropped.
    pub fn start_cleanup(self: &Arc<Self>, runtime: &Handle) -> CleanupTask {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let manager = Arc::clone(self);
        let interval = self.config.cleanup_interval;

        let handle = runtime.spawn(async move {
            info!(
                interval_ms = interval.as_millis() as u64,
                dir = %manager.dir.display(),
                "Starting cache cleanup loop"
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let m = Arc::clone(&manager);
                        match tokio::task::spawn_blocking(move || m.cleanup_expired()).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "Cache cleanup removed expired entries"),
                            Err(e) => warn!(error = %e, "Cache cleanup pass failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Cache cleanup loop shutting down");
                        break;
                    }
                }
            }
        });

        CleanupTask {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    fn try_hit(self: &Arc<Self>, name: &str, locator: &ShardLocator) -> Option<CacheLease> {
        let path = self.dir.join(name);

        // Eviction deletes files under the state lock, so the file check
        // must happen under it too
        let mut state = self.state.lock();
        let on_disk = fs::metadata(&path).ok().filter(|m| m.is_file());
        let fresh = on_disk
            .as_ref()
            .map(|m| locator.nbytes == 0 || m.len() == locator.nbytes)
            .unwrap_or(false);

        if !fresh {
            if state.remove(name).is_some() || on_disk.is_some() {
                debug!(url = %locator.url, "Dropping stale cache file");
                remove_file_quietly(&path);
            }
            return None;
        }

        if !state.entries.contains_key(name) {
            // Written by another process sharing the directory
            let size = on_disk.map(|m| m.len()).unwrap_or(0);
            let entry = CacheEntry {
                url: Some(locator.url.clone()),
                path: path.clone(),
                size,
                refs: 0,
                last_used: 0,
                last_access: Utc::now(),
            };
            state.insert(name.to_string(), entry);
        }

        if let Some(entry) = state.entries.get_mut(name) {
            entry.refs += 1;
            entry.url.get_or_insert_with(|| locator.url.clone());
        }
        state.touch(name);
        state.stats.hits += 1;
        self.evict_locked(&mut state);

        Some(CacheLease::pinned(path, Arc::clone(self), name.to_string()))
    }

    fn download(&self, locator: &ShardLocator, name: &str, path: &Path) -> Result<u64> {
        let url = locator.url.as_str();
        log_open!(self.config.log, %url, path = %path.display(), "Downloading shard");

        let temp_name = format!("{}.{}{}", name, Uuid::new_v4(), TEMP_SUFFIX);
        let temp = TempFile::new(self.dir.join(temp_name));

        let size = with_retry(&self.config.retry, "download", || {
            self.fetch_to(url, temp.path())
        })
        .map_err(|e| self.download_failed(url, e))?;

        if locator.nbytes > 0 && size != locator.nbytes {
            return Err(self.download_failed(
                url,
                format!("expected {} bytes, got {}", locator.nbytes, size),
            ));
        }

        fs::rename(temp.path(), path).map_err(|e| self.download_failed(url, e))?;
        temp.keep();

        log_open!(self.config.log, %url, bytes = size, "Downloaded shard");
        Ok(size)
    }

    fn fetch_to(&self, url: &str, temp: &Path) -> Result<u64> {
        let mut stream = self.opener.open(url)?;
        let mut file = File::create(temp)?;
        let size = io::copy(&mut stream, &mut file)?;
        file.sync_all()?;
        Ok(size)
    }

    fn download_failed(&self, url: &str, reason: impl ToString) -> Error {
        self.state.lock().stats.download_failures += 1;
        let reason = reason.to_string();
        warn!(%url, %reason, "Shard download failed");
        Error::download(url, reason)
    }

    fn release(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(name) {
            entry.refs = entry.refs.saturating_sub(1);
            entry.last_access = Utc::now();
        }
        self.evict_locked(&mut state);
    }

    /// Evict unleased entries, oldest first, until under budget
    fn evict_locked(&self, state: &mut CacheState) {
        let Some(max_bytes) = self.config.max_bytes else {
            return;
        };

        while state.used_bytes > max_bytes {
            let victim = state
                .entries
                .iter()
                .filter(|(_, e)| e.refs == 0)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(name, _)| name.clone());

            let Some(name) = victim else {
                debug!(
                    used_bytes = state.used_bytes,
                    max_bytes, "Cache over budget but every entry is leased"
                );
                break;
            };

            if let Some(entry) = state.remove(&name) {
                remove_file_quietly(&entry.path);
                state.stats.evictions += 1;
                debug!(
                    url = entry.url.as_deref().unwrap_or("<adopted>"),
                    size = entry.size,
                    "Evicted cache entry"
                );
            }
        }
    }

    fn adopt_existing(&self) -> Result<()> {
        let temps = self.remove_stale_temps();

        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !metadata.is_file() || name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            found.push((modified, name, metadata.len()));
        }
        found.sort();

        let mut state = self.state.lock();
        for (modified, name, size) in found {
            state.tick += 1;
            let entry = CacheEntry {
                url: None,
                path: self.dir.join(&name),
                size,
                refs: 0,
                last_used: state.tick,
                last_access: modified,
            };
            state.insert(name, entry);
        }

        info!(
            dir = %self.dir.display(),
            adopted = state.entries.len(),
            bytes = state.used_bytes,
            temps,
            "Opened shard cache"
        );
        self.evict_locked(&mut state);
        Ok(())
    }

    fn remove_stale_temps(&self) -> usize {
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in dir.flatten() {
            if !entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|t| now.duration_since(t).unwrap_or_default() >= STALE_TEMP_AGE)
                .unwrap_or(false);
            if stale {
                remove_file_quietly(&entry.path());
                removed += 1;
            }
        }
        removed
    }
}

/// Cache file name for a URL: `{fnv64 hex}-{sanitized basename}`
pub fn cache_file_name(url: &str) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(url.as_bytes());

    let stripped = url.split(['?', '#']).next().unwrap_or(url);
    let basename = stripped.rsplit(['/', ' ']).next().unwrap_or("");
    let mut sanitized: String = basename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_BASENAME_LEN)
        .collect();
    if sanitized.ends_with(TEMP_SUFFIX) {
        sanitized.push('_');
    }

    format!("{:016x}-{}", hasher.finish(), sanitized)
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove cache file");
        }
    }
}

/// Removes a download's temporary file unless kept
struct TempFile {
    path: PathBuf,
    keep: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.keep {
            remove_file_quietly(&self.path);
        }
    }
}

/// Read access to a cached (or local) shard file.
///
/// While a lease is alive its entry cannot be evicted.
pub struct CacheLease {
    path: PathBuf,
    pin: Option<(Arc<CacheManager>, String)>,
}

impl CacheLease {
    fn direct(path: PathBuf) -> Self {
        Self { path, pin: None }
    }

    fn pinned(path: PathBuf, manager: Arc<CacheManager>, name: String) -> Self {
        Self {
            path,
            pin: Some((manager, name)),
        }
    }

    /// Local file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file lives in the cache (as opposed to a local shard)
    pub fn is_cached(&self) -> bool {
        self.pin.is_some()
    }

    /// Open the file for reading
    pub fn open(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| Error::open(self.path.display().to_string(), e))
    }
}

impl std::fmt::Debug for CacheLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLease")
            .field("path", &self.path)
            .field("cached", &self.is_cached())
            .finish()
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        if let Some((manager, name)) = self.pin.take() {
            manager.release(&name);
        }
    }
}

/// Handle on a running cleanup loop
#[derive(Debug)]
pub struct CleanupTask {
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Signal the loop and wait for it to exit
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.await.map_err(|e| Error::Internal {
                message: format!("cache cleanup task failed: {}", e),
            }),
            None => Ok(()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
