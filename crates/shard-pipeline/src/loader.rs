//! Multi-worker loader
//!
//! Runs one streaming pipeline per worker thread, each over its own shard
//! split, and merges their batches through a bounded channel. The merged
//! stream is remixed (unbatch, shuffle, rebatch) so a batch is not made of
//! one worker's shards only.
//!
//! The loader iterator blocks on the channel and must not be driven from
//! inside an async runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use data_shard::Epoch;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use shard_core::{Error, ErrorPolicy, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::batch::{Batch, Batched, Unbatch};
use crate::epoch::WithEpoch;
use crate::shuffle::Shuffled;
use crate::stream::{rank_seed, BatchStream, StreamPipeline};

/// Salt separating the remix seed from the per-worker seeds
const REMIX_SALT: u64 = 0x5245_4d58;

/// Starts worker threads for each epoch
#[derive(Debug, Clone)]
pub struct Loader {
    pipeline: StreamPipeline,
    num_workers: u32,
    policy: ErrorPolicy,
}

impl Loader {
    /// Loader with `num_workers` workers on the pipeline's rank.
    ///
    /// Under the strict policy the first worker error ends the epoch.
    pub fn new(pipeline: StreamPipeline, num_workers: u32) -> Result<Self> {
        if num_workers == 0 {
            return Err(Error::InvalidWorldSize {
                world_size: pipeline.topology().world_size,
                num_workers,
            });
        }
        // Every worker position must be valid for the rank
        pipeline.for_worker(num_workers - 1, num_workers)?;
        Ok(Self {
            policy: pipeline.policy(),
            pipeline,
            num_workers,
        })
    }

    pub fn num_workers(&self) -> u32 {
        self.num_workers
    }

    /// Start the workers for `epoch` and return the merged batch stream.
    ///
    /// With `epoch_length` configured the stream ends after exactly that
    /// many batches; otherwise it ends when every worker is done.
    pub fn epoch(&self, epoch: Epoch) -> Result<LoaderIter> {
        let mut pipeline = self.pipeline.clone();
        pipeline.set_epoch(epoch);
        let config = pipeline.config().clone();

        let (tx, rx) = mpsc::channel(config.prefetch_batches.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(self.num_workers as usize);

        for worker_id in 0..self.num_workers {
            let worker = pipeline.for_worker(worker_id, self.num_workers)?;
            let tx = tx.clone();
            let stop = Arc::clone(&stop);
            let handle = std::thread::Builder::new()
                .name(format!("shard-loader-{}", worker_id))
                .spawn(move || run_worker(worker, tx, stop))
                .map_err(|e| Error::Internal {
                    message: format!("failed to spawn loader worker {}: {}", worker_id, e),
                })?;
            workers.push(handle);
        }
        drop(tx);

        info!(
            epoch,
            rank = pipeline.topology().rank,
            workers = self.num_workers,
            "Started loader workers"
        );

        let merged = ChannelBatches { rx };
        let rng = ChaCha8Rng::seed_from_u64(rank_seed(
            &config,
            epoch,
            pipeline.topology().rank,
            REMIX_SALT,
        ));
        let remixed: BatchStream = Box::new(Batched::new(
            Shuffled::new(Unbatch::new(merged), config.remix_buffer, rng),
            config.batch_size,
            config.partial_batches,
        ));
        let batches: BatchStream = match config.epoch_length {
            Some(length) => Box::new(WithEpoch::new(remixed, length)),
            None => remixed,
        };

        Ok(LoaderIter {
            batches,
            workers,
            stop,
            policy: self.policy,
            finished: false,
        })
    }
}

fn run_worker(pipeline: StreamPipeline, tx: mpsc::Sender<Result<Batch>>, stop: Arc<AtomicBool>) {
    let worker = pipeline.topology().worker_id;
    let batches = match pipeline.batches() {
        Ok(batches) => batches,
        Err(e) => {
            let _ = tx.blocking_send(Err(e));
            return;
        }
    };

    let mut sent = 0u64;
    for batch in batches {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if tx.blocking_send(batch).is_err() {
            break;
        }
        sent += 1;
    }
    debug!(worker, batches = sent, "Loader worker finished");
}

/// Receiving end of the worker channel as an iterator
struct ChannelBatches {
    rx: mpsc::Receiver<Result<Batch>>,
}

impl Iterator for ChannelBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        self.rx.blocking_recv()
    }
}

/// Merged, remixed batches of one epoch.
///
/// Dropping it stops the workers: they see the stop flag or a closed
/// channel at their next batch.
pub struct LoaderIter {
    batches: BatchStream,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    policy: ErrorPolicy,
    finished: bool,
}

impl LoaderIter {
    /// Stop the workers and wait for them to exit
    pub fn shutdown(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.batches = Box::new(std::iter::empty());

        let mut panicked = 0;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(Error::Internal {
                message: format!("{} loader worker(s) panicked", panicked),
            });
        }
        Ok(())
    }
}

impl Iterator for LoaderIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        if self.finished {
            return None;
        }
        match self.batches.next() {
            Some(Err(e)) if self.policy == ErrorPolicy::Strict => {
                warn!(error = %e, "Stopping loader after worker error");
                self.finished = true;
                self.stop.store(true, Ordering::Relaxed);
                Some(Err(e))
            }
            Some(item) => Some(item),
            None => {
                self.finished = true;
                None
            }
        }
    }
}

impl Drop for LoaderIter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
