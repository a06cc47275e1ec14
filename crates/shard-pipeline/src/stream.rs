//! Streaming pipeline
//!
//! Shards for one (rank, worker) slot are read in turn and flattened into
//! one sample stream, then decoded, filtered, mapped, shuffled and batched:
//!
//! ```text
//! shard source -> reader -> decode/select/map -> shuffle -> batch -> epoch
//! ```
//!
//! The shard source is either this slot's disjoint split of the manifest
//! (one finite pass) or an endless draw with replacement.

use std::sync::Arc;

use data_shard::{derive_seed, seeded_rng, ResampledShards, ShardSplit};
use shard_core::{
    Epoch, Error, ErrorPolicy, Manifest, ReaderConfig, Result, Sample, StreamConfig, Topology,
};
use storage::{CacheManager, ShardOpener};
use tracing::{debug, error, warn};

use crate::batch::{Batch, Batched};
use crate::decode::Decoder;
use crate::epoch::WithEpoch;
use crate::reader::{SampleIter, ShardReader};
use crate::shuffle::Shuffled;

/// Boxed sample stream handed to callers
pub type SampleStream = Box<dyn Iterator<Item = Result<Sample>> + Send>;

/// Boxed batch stream handed to callers
pub type BatchStream = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// Sample predicate applied after decoding
pub type SelectFn = Arc<dyn Fn(&Sample) -> bool + Send + Sync>;

/// Sample rewrite applied after selection
pub type MapFn = Arc<dyn Fn(Sample) -> Result<Sample> + Send + Sync>;

/// Salt separating the sample shuffle seed from the shard seeds
const SHUFFLE_SALT: u64 = 0x5348_5546;

/// Fewest consecutive barren shards tolerated by a resampled source
const MIN_FAILURE_LIMIT: usize = 16;

/// Shard indices one slot reads in one epoch
#[derive(Debug, Clone)]
pub enum ShardSource {
    /// This slot's share of one pass
    Finite(std::vec::IntoIter<usize>),

    /// Endless draw with replacement
    Resampled(ResampledShards),
}

impl ShardSource {
    pub fn is_resampled(&self) -> bool {
        matches!(self, ShardSource::Resampled(_))
    }
}

impl Iterator for ShardSource {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            ShardSource::Finite(shards) => shards.next(),
            ShardSource::Resampled(shards) => shards.next(),
        }
    }
}

/// Per-sample decode, select and map
#[derive(Clone, Default)]
struct SampleTransform {
    decoder: Option<Arc<Decoder>>,
    select: Option<SelectFn>,
    map: Option<MapFn>,
}

impl SampleTransform {
    /// `Ok(None)` when the sample is filtered out
    fn apply(&self, sample: Sample) -> Result<Option<Sample>> {
        let sample = match &self.decoder {
            Some(decoder) => decoder.decode(sample)?,
            None => sample,
        };
        if let Some(select) = &self.select {
            if !select(&sample) {
                return Ok(None);
            }
        }
        match &self.map {
            Some(map) => map(sample).map(Some),
            None => Ok(Some(sample)),
        }
    }
}

/// Sample stream across a sequence of shards under an error policy
struct ShardSamples {
    shards: ShardSource,
    manifest: Arc<Manifest>,
    reader: ShardReader,
    transform: SampleTransform,
    policy: ErrorPolicy,
    worker: u32,
    current: Option<SampleIter>,
    current_shard: usize,
    current_yielded: bool,
    barren_run: usize,
    failure_limit: usize,
    done: bool,
}

impl ShardSamples {
    /// Decide what to do with an error; `Some` means yield it and stop
    fn handle(&mut self, err: Error) -> Option<Result<Sample>> {
        if self.policy == ErrorPolicy::Strict || err.is_fatal() {
            self.done = true;
            self.current = None;
            return Some(Err(err));
        }
        warn!(
            shard = self.current_shard,
            worker = self.worker,
            error = %err,
            "Skipping after stream error"
        );
        None
    }

    /// Count a shard that produced nothing; true once a resampled source
    /// should give up
    fn note_barren(&mut self) -> bool {
        self.barren_run += 1;
        if self.shards.is_resampled() && self.barren_run >= self.failure_limit {
            error!(
                worker = self.worker,
                consecutive = self.barren_run,
                "Every recent shard failed or was empty; ending resampled stream"
            );
            self.done = true;
            return true;
        }
        false
    }
}

impl Iterator for ShardSamples {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Result<Sample>> {
        while !self.done {
            let Some(samples) = self.current.as_mut() else {
                let Some(shard) = self.shards.next() else {
                    self.done = true;
                    break;
                };
                let Some(locator) = self.manifest.shards.get(shard) else {
                    self.done = true;
                    return Some(Err(Error::Internal {
                        message: format!("shard index {} outside manifest", shard),
                    }));
                };

                self.current_shard = shard;
                self.current_yielded = false;
                match self.reader.open(locator) {
                    Ok(samples) => self.current = Some(samples),
                    Err(e) => {
                        if let Some(fatal) = self.handle(e) {
                            return Some(fatal);
                        }
                        if self.note_barren() {
                            return None;
                        }
                    }
                }
                continue;
            };

            match samples.next() {
                None => {
                    self.current = None;
                    if !self.current_yielded && self.note_barren() {
                        return None;
                    }
                }
                Some(Ok(sample)) => {
                    self.current_yielded = true;
                    self.barren_run = 0;
                    match self.transform.apply(sample) {
                        Ok(Some(sample)) => return Some(Ok(sample)),
                        Ok(None) => {}
                        Err(e) => {
                            if let Some(stop) = self.handle(e) {
                                return Some(stop);
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    if let Some(stop) = self.handle(e) {
                        return Some(stop);
                    }
                }
            }
        }
        None
    }
}

/// Builder for [`StreamPipeline`]
pub struct StreamPipelineBuilder {
    manifest: Manifest,
    opener: Arc<dyn ShardOpener>,
    cache: Option<Arc<CacheManager>>,
    config: StreamConfig,
    reader_config: ReaderConfig,
    topology: Topology,
    split: ShardSplit,
    transform: SampleTransform,
    epoch: Epoch,
}

impl StreamPipelineBuilder {
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reader_config(mut self, config: ReaderConfig) -> Self {
        self.reader_config = config;
        self
    }

    /// Rank and worker this pipeline reads for
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Node and worker split policies
    pub fn split(mut self, split: ShardSplit) -> Self {
        self.split = split;
        self
    }

    /// Decode fields with `decoder`
    pub fn decode(mut self, decoder: Decoder) -> Self {
        self.transform.decoder = Some(Arc::new(decoder));
        self
    }

    /// Keep only samples for which `predicate` holds
    pub fn select<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Sample) -> bool + Send + Sync + 'static,
    {
        self.transform.select = Some(Arc::new(predicate));
        self
    }

    /// Rewrite each selected sample
    pub fn map<F>(mut self, f: F) -> Self
    where
        F: Fn(Sample) -> Result<Sample> + Send + Sync + 'static,
    {
        self.transform.map = Some(Arc::new(f));
        self
    }

    /// Read remote shards through a local cache
    pub fn cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Starting epoch
    pub fn epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn build(self) -> Result<StreamPipeline> {
        self.topology.validate()?;
        if self.config.batch_size == 0 {
            return Err(Error::InvalidConfig {
                message: "stream batch_size must be at least 1".to_string(),
            });
        }
        if self.manifest.is_empty() {
            warn!("Streaming pipeline built over an empty manifest");
        }

        let reader = match self.cache {
            Some(cache) => ShardReader::with_cache(cache, self.opener, self.reader_config),
            None => ShardReader::new(self.opener, self.reader_config),
        };
        Ok(StreamPipeline {
            manifest: Arc::new(self.manifest),
            reader,
            config: self.config,
            topology: self.topology,
            split: self.split,
            transform: self.transform,
            epoch: self.epoch,
        })
    }
}

/// Streams samples and batches for one (rank, worker) slot
#[derive(Clone)]
pub struct StreamPipeline {
    manifest: Arc<Manifest>,
    reader: ShardReader,
    config: StreamConfig,
    topology: Topology,
    split: ShardSplit,
    transform: SampleTransform,
    epoch: Epoch,
}

impl std::fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeline")
            .field("shards", &self.manifest.len())
            .field("topology", &self.topology)
            .field("epoch", &self.epoch)
            .field("resampled", &self.config.resampled)
            .field("batch_size", &self.config.batch_size)
            .finish()
    }
}

impl StreamPipeline {
    pub fn builder(manifest: Manifest, opener: Arc<dyn ShardOpener>) -> StreamPipelineBuilder {
        StreamPipelineBuilder {
            manifest,
            opener,
            cache: None,
            config: StreamConfig::default(),
            reader_config: ReaderConfig::default(),
            topology: Topology::single(),
            split: ShardSplit::default(),
            transform: SampleTransform::default(),
            epoch: 0,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Error policy of the underlying reader
    pub fn policy(&self) -> ErrorPolicy {
        self.reader.config().policy
    }

    /// Epoch used by streams created after this call
    pub fn set_epoch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
    }

    /// Same pipeline for another worker of this rank
    pub fn for_worker(&self, worker_id: u32, num_workers: u32) -> Result<Self> {
        let topology = self.topology.with_worker(worker_id, num_workers);
        topology.validate()?;
        Ok(Self {
            topology,
            ..self.clone()
        })
    }

    /// Shards this slot reads in the current epoch
    pub fn shard_source(&self) -> Result<ShardSource> {
        let num_shards = self.manifest.len();
        if self.config.resampled {
            self.topology.validate()?;
            return Ok(ShardSource::Resampled(ResampledShards::new(
                num_shards,
                self.config.seed,
                self.epoch,
                &self.topology,
            )));
        }

        let shuffle_seed = self.config.shuffle_shards.then_some(self.config.seed);
        let shards = self
            .split
            .plan_epoch(num_shards, &self.topology, self.epoch, shuffle_seed)?;
        if shards.is_empty() {
            warn!(
                rank = self.topology.rank,
                worker = self.topology.worker_id,
                epoch = self.epoch,
                "No shards assigned to this worker"
            );
        }
        Ok(ShardSource::Finite(shards.into_iter()))
    }

    /// Decoded, filtered, shuffled samples
    pub fn samples(&self) -> Result<SampleStream> {
        let shards = self.shard_source()?;
        debug!(
            rank = self.topology.rank,
            worker = self.topology.worker_id,
            epoch = self.epoch,
            resampled = shards.is_resampled(),
            "Starting sample stream"
        );

        let samples = ShardSamples {
            shards,
            manifest: Arc::clone(&self.manifest),
            reader: self.reader.clone(),
            transform: self.transform.clone(),
            policy: self.policy(),
            worker: self.topology.worker_id,
            current: None,
            current_shard: 0,
            current_yielded: false,
            barren_run: 0,
            failure_limit: MIN_FAILURE_LIMIT.max(4 * self.manifest.len()),
            done: false,
        };

        let rng = seeded_rng(&[
            self.config.seed,
            self.epoch,
            self.topology.rank as u64,
            self.topology.worker_id as u64,
            SHUFFLE_SALT,
        ]);
        Ok(Box::new(Shuffled::new(
            samples,
            self.config.shuffle_buffer,
            rng,
        )))
    }

    /// Samples grouped into batches of `batch_size`
    pub fn batches(&self) -> Result<BatchStream> {
        Ok(Box::new(Batched::new(
            self.samples()?,
            self.config.batch_size,
            self.config.partial_batches,
        )))
    }

    /// Exactly `length` batches per epoch, regardless of source length
    pub fn with_epoch(&self, length: u64) -> Result<WithEpoch<BatchStream>> {
        Ok(WithEpoch::new(self.batches()?, length))
    }
}

/// Seed shared by every worker of one rank for a given epoch and salt
pub(crate) fn rank_seed(config: &StreamConfig, epoch: Epoch, rank: u32, salt: u64) -> u64 {
    derive_seed(&[config.seed, epoch, rank as u64, salt])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decode::DecodeKind;
    use crate::reader::tests::build_tar;
    use shard_core::{FieldValue, ShardLocator};
    use std::collections::HashSet;
    use std::path::Path;
    use storage::LocalOpener;

    /// Write `shards` tar files of `per_shard` samples (`txt` + `cls`)
    pub(crate) fn write_shards(dir: &Path, shards: usize, per_shard: usize) -> Manifest {
        let locators = (0..shards)
            .map(|s| {
                let names: Vec<(String, String)> = (0..per_shard)
                    .flat_map(|i| {
                        let key = format!("s{}/{:04}", s, i);
                        [
                            (format!("{}.txt", key), format!("text {} {}", s, i)),
                            (format!("{}.cls", key), format!("{}", i % 10)),
                        ]
                    })
                    .collect();
                let members: Vec<(&str, &[u8])> = names
                    .iter()
                    .map(|(n, d)| (n.as_str(), d.as_bytes()))
                    .collect();

                let path = dir.join(format!("shard-{:03}.tar", s));
                std::fs::write(&path, build_tar(&members)).unwrap();
                ShardLocator::with_counts(path.to_string_lossy(), 0, per_shard as u64)
            })
            .collect();
        Manifest::new(locators)
    }

    fn stream_config(batch_size: usize, shuffle_buffer: usize) -> StreamConfig {
        StreamConfig {
            batch_size,
            shuffle_buffer,
            ..StreamConfig::default()
        }
    }

    fn pipeline(manifest: Manifest, config: StreamConfig) -> StreamPipelineBuilder {
        StreamPipeline::builder(manifest, Arc::new(LocalOpener::new())).config(config)
    }

    fn keys(stream: SampleStream) -> Vec<String> {
        stream.map(|s| s.unwrap().key).collect()
    }

    #[test]
    fn test_single_worker_reads_everything_once() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_shards(dir.path(), 4, 5);

        let stream = pipeline(manifest, stream_config(3, 8)).build().unwrap();
        let all = keys(stream.samples().unwrap());
        assert_eq!(all.len(), 20);
        assert_eq!(all.iter().collect::<HashSet<_>>().len(), 20);
    }

    #[test]
    fn test_workers_read_disjoint_shards() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_shards(dir.path(), 6, 3);
        let base = pipeline(manifest, stream_config(4, 0)).build().unwrap();

        let mut seen = HashSet::new();
        for rank in 0..2 {
            for worker in 0..3 {
                let stream = StreamPipeline {
                    topology: Topology::new(rank, 2, worker, 3),
                    ..base.clone()
                };
                for key in keys(stream.samples().unwrap()) {
                    assert!(seen.insert(key), "sample served twice");
                }
            }
        }
        assert_eq!(seen.len(), 18);
    }

    #[test]
    fn test_batches_and_partial() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_shards(dir.path(), 2, 5);

        let mut config = stream_config(4, 0);
        let stream = pipeline(manifest.clone(), config.clone()).build().unwrap();
        let sizes: Vec<usize> = stream.batches().unwrap().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        config.partial_batches = false;
        let stream = pipeline(manifest, config).build().unwrap();
        assert_eq!(stream.batches().unwrap().count(), 2);
    }

    #[test]
    fn test_resampled_with_epoch_gives_exact_count() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_shards(dir.path(), 3, 2);

        let config = StreamConfig {
            resampled: true,
            ..stream_config(5, 4)
        };
        let stream = pipeline(manifest, config).build().unwrap();
        let mut epoch = stream.with_epoch(37).unwrap();
        assert_eq!(epoch.by_ref().filter(|b| b.is_ok()).count(), 37);

        epoch.next_epoch();
        assert_eq!(epoch.count(), 37);
    }

    #[test]
    fn test_broken_shard_is_skipped_under_warn() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = write_shards(dir.path(), 3, 4);
        manifest.shards[1].url = dir.path().join("missing.tar").to_string_lossy().into();

        let stream = pipeline(manifest, stream_config(2, 0)).build().unwrap();
        let results: Vec<_> = stream.samples().unwrap().collect();
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_strict_policy_yields_error_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = write_shards(dir.path(), 3, 4);
        manifest.shards[0].url = dir.path().join("missing.tar").to_string_lossy().into();

        let config = StreamConfig {
            shuffle_shards: false,
            ..stream_config(2, 0)
        };
        let stream = pipeline(manifest, config)
            .reader_config(ReaderConfig {
                policy: ErrorPolicy::Strict,
                ..ReaderConfig::default()
            })
            .build()
            .unwrap();

        let mut samples = stream.samples().unwrap();
        assert!(matches!(samples.next(), Some(Err(Error::Open { .. }))));
        assert!(samples.next().is_none());
    }

    #[test]
    fn test_all_shards_failing_ends_resampled_stream() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::new(vec![
            ShardLocator::new(dir.path().join("a.tar").to_string_lossy()),
            ShardLocator::new(dir.path().join("b.tar").to_string_lossy()),
        ]);

        let config = StreamConfig {
            resampled: true,
            ..stream_config(2, 0)
        };
        let stream = pipeline(manifest, config).build().unwrap();
        assert_eq!(stream.samples().unwrap().count(), 0);
    }

    #[test]
    fn test_decode_select_map() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_shards(dir.path(), 2, 10);

        let stream = pipeline(manifest, stream_config(4, 0))
            .decode(Decoder::new().with("cls", DecodeKind::Text))
            .select(|s| s.text("cls") == Some("3"))
            .map(|mut s| {
                s.insert("tag", FieldValue::Text("seen".to_string()));
                Ok(s)
            })
            .build()
            .unwrap();

        let samples: Vec<Sample> = stream.samples().unwrap().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 2);
        for sample in samples {
            assert_eq!(sample.text("cls"), Some("3"));
            assert_eq!(sample.text("tag"), Some("seen"));
            assert!(sample.bytes("txt").is_some());
        }
    }

    #[test]
    fn test_same_epoch_same_order() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_shards(dir.path(), 4, 6);
        let mut stream = pipeline(manifest, stream_config(4, 10)).build().unwrap();

        let first = keys(stream.samples().unwrap());
        assert_eq!(first, keys(stream.samples().unwrap()));

        stream.set_epoch(1);
        assert_ne!(first, keys(stream.samples().unwrap()));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let result = pipeline(Manifest::default(), stream_config(0, 0)).build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
