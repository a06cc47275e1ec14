//! Shared fixtures: tar shards on disk, manifests, and an axum file server
//! for them.

#![allow(dead_code)]

use anyhow::Result;
use axum::extract::{self, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use data_shard::{resolve, ShardSpec};
use shard_core::{logging::init_tracing, LogConfig, Manifest};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Fields per sample written by `write_shard`
pub const FIELDS_PER_SAMPLE: usize = 3;

pub fn init_logging() {
    init_tracing(&LogConfig {
        filter: "debug".to_string(),
        log_opens: true,
    });
}

/// Sample key for sample `index` of shard `shard`
pub fn key(shard: usize, index: usize) -> String {
    format!("{:03}/{:05}", shard, index)
}

/// Write one shard of `samples` records, each with `txt`, `json` and `cls`.
/// Returns the file size.
pub fn write_shard(path: &Path, shard: usize, samples: usize) -> Result<u64> {
    let mut builder = tar::Builder::new(Vec::new());
    for index in 0..samples {
        let key = key(shard, index);
        let json = serde_json::json!({ "shard": shard, "index": index }).to_string();
        let members = [
            (format!("{}.txt", key), format!("caption {} {}", shard, index)),
            (format!("{}.json", key), json),
            (format!("{}.cls", key), (index % 10).to_string()),
        ];
        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes())?;
        }
    }
    let bytes = builder.into_inner()?;
    std::fs::write(path, &bytes)?;
    Ok(bytes.len() as u64)
}

/// Write `shards` shards plus a `manifest.json` with relative URLs into
/// `dir`. Returns the manifest path.
pub fn write_dataset(dir: &Path, shards: usize, per_shard: usize) -> Result<PathBuf> {
    let mut entries = Vec::new();
    for shard in 0..shards {
        let name = format!("shard-{:03}.tar", shard);
        let nbytes = write_shard(&dir.join(&name), shard, per_shard)?;
        entries.push(serde_json::json!({
            "url": name,
            "nbytes": nbytes,
            "nsamples": per_shard,
        }));
    }

    let manifest = serde_json::json!({
        "total_samples": shards * per_shard,
        "shards": entries,
    });
    let path = dir.join("manifest.json");
    std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)?;
    Ok(path)
}

/// Resolve the manifest written by `write_dataset`
pub fn local_manifest(dir: &Path, shards: usize, per_shard: usize) -> Result<Manifest> {
    let path = write_dataset(dir, shards, per_shard)?;
    Ok(resolve(&ShardSpec::ManifestAt(path.to_string_lossy().into_owned()))?)
}

/// Cut a file down to `len` bytes
pub fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    Ok(())
}

/// Serves the files of a directory over HTTP on its own runtime
pub struct FileServer {
    pub base_url: String,
    requests: Arc<AtomicUsize>,
    _runtime: Runtime,
}

async fn count_requests(
    State(counter): State<Arc<AtomicUsize>>,
    request: Request,
    next: Next,
) -> Response {
    counter.fetch_add(1, Ordering::SeqCst);
    next.run(request).await
}

async fn serve_file(
    State(root): State<Arc<PathBuf>>,
    extract::Path(path): extract::Path<String>,
) -> Response {
    match tokio::fs::read(root.join(path)).await {
        Ok(body) => body.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

impl FileServer {
    /// Start serving `dir`. The shard openers block, so the server gets a
    /// runtime of its own instead of the test's.
    pub fn start(dir: &Path) -> Result<Self> {
        let port = portpicker::pick_unused_port().ok_or_else(|| anyhow::anyhow!("no free port"))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let listener = runtime.block_on(tokio::net::TcpListener::bind(("127.0.0.1", port)))?;

        let requests = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/*path", get(serve_file))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&requests),
                count_requests,
            ))
            .with_state(Arc::new(dir.to_path_buf()));

        runtime.spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!(error = %e, "Test file server stopped");
            }
        });

        Ok(Self {
            base_url: format!("http://127.0.0.1:{}", port),
            requests,
            _runtime: runtime,
        })
    }

    /// Requests served so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Manifest of `dir`'s `manifest.json` with URLs pointing at this server
    pub fn manifest(&self, manifest_path: &Path) -> Result<Manifest> {
        let text = std::fs::read_to_string(manifest_path)?;
        let mut doc: serde_json::Value = serde_json::from_str(&text)?;
        doc["base"] = serde_json::Value::String(self.base_url.clone());
        Ok(resolve(&ShardSpec::ManifestJson(doc.to_string()))?)
    }
}
