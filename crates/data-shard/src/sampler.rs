//! Chunked distributed sampler
//!
//! Produces the index sequence one (rank, worker) slot reads in an epoch.
//! `[0, total)` is cut into contiguous chunks, the chunk order is permuted
//! per epoch, and permuted chunk `i` goes to slot `i % slots`. Reading whole
//! chunks keeps consecutive indices inside the same few shards, so the local
//! cache stays warm.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use shard_core::{Epoch, Error, Result, SamplerConfig, Topology};

use crate::seed::seeded_rng;

/// Sampler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerState {
    /// No epoch supplied yet
    Uninitialized,

    /// Epoch set, nothing emitted
    Seeded(Epoch),

    /// Part of the epoch's sequence has been emitted
    Emitting(Epoch),

    /// Every index of the epoch has been emitted
    Exhausted(Epoch),
}

impl SamplerState {
    /// Epoch currently seeded, if any
    pub fn epoch(&self) -> Option<Epoch> {
        match *self {
            SamplerState::Uninitialized => None,
            SamplerState::Seeded(e) | SamplerState::Emitting(e) | SamplerState::Exhausted(e) => {
                Some(e)
            }
        }
    }
}

/// Contiguous range of global indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of the chunk in unpermuted order
    pub id: u64,

    /// First index (inclusive)
    pub start: u64,

    /// Last index (exclusive)
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Chunks assigned to one slot for one epoch, in reading order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochPlan {
    pub epoch: Epoch,
    pub slot: u64,
    pub chunks: Vec<Chunk>,
}

impl EpochPlan {
    /// Number of indices the slot reads this epoch
    pub fn num_indices(&self) -> u64 {
        self.chunks.iter().map(Chunk::len).sum()
    }
}

/// Per-slot index generator
#[derive(Debug, Clone)]
pub struct ChunkedSampler {
    total_samples: u64,
    config: SamplerConfig,
    topology: Topology,
    state: SamplerState,

    /// Chunks of the seeded epoch assigned to this slot
    assigned: Vec<Chunk>,

    /// Next chunk in `assigned` to expand
    next_chunk: usize,

    /// Indices of the chunk being emitted
    pending: Vec<u64>,

    /// Next position in `pending`
    cursor: usize,
}

impl ChunkedSampler {
    /// Create an unseeded sampler
    pub fn new(total_samples: u64, config: SamplerConfig, topology: Topology) -> Result<Self> {
        topology.validate()?;
        if config.chunk_size == 0 {
            return Err(Error::InvalidConfig {
                message: "sampler chunk_size must be at least 1".to_string(),
            });
        }

        Ok(Self {
            total_samples,
            config,
            topology,
            state: SamplerState::Uninitialized,
            assigned: Vec::new(),
            next_chunk: 0,
            pending: Vec::new(),
            cursor: 0,
        })
    }

    /// Seed the sampler for an epoch, restarting its sequence
    pub fn set_epoch(&mut self, epoch: Epoch) {
        self.assigned = self.plan_for(epoch).chunks;
        self.next_chunk = 0;
        self.pending.clear();
        self.cursor = 0;
        self.state = SamplerState::Seeded(epoch);

        tracing::debug!(
            epoch,
            slot = self.topology.slot(),
            chunks = self.assigned.len(),
            "Seeded sampler"
        );
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Number of chunks covering `[0, total_samples)`
    pub fn num_chunks(&self) -> u64 {
        self.total_samples.div_ceil(self.config.chunk_size)
    }

    /// Chunk ids in the seeded epoch's permuted order (all slots)
    pub fn chunk_permutation(&self) -> Result<Vec<u64>> {
        let epoch = self.seeded_epoch()?;
        Ok(self.permutation_for(epoch))
    }

    /// This slot's chunks for the seeded epoch
    pub fn epoch_plan(&self) -> Result<EpochPlan> {
        let epoch = self.seeded_epoch()?;
        Ok(self.plan_for(epoch))
    }

    /// This slot's complete index sequence for the seeded epoch.
    ///
    /// Does not move the emission cursor.
    pub fn indices(&self) -> Result<Vec<u64>> {
        let epoch = self.seeded_epoch()?;
        let plan = self.plan_for(epoch);
        let mut out = Vec::with_capacity(plan.num_indices() as usize);
        for chunk in &plan.chunks {
            out.extend(self.chunk_indices(epoch, chunk));
        }
        Ok(out)
    }

    /// Next index of the seeded epoch, `None` once exhausted
    pub fn next_index(&mut self) -> Result<Option<u64>> {
        let epoch = self.seeded_epoch()?;

        loop {
            if let Some(&index) = self.pending.get(self.cursor) {
                self.cursor += 1;
                self.state = SamplerState::Emitting(epoch);
                return Ok(Some(index));
            }

            match self.assigned.get(self.next_chunk).copied() {
                Some(chunk) => {
                    self.pending = self.chunk_indices(epoch, &chunk);
                    self.cursor = 0;
                    self.next_chunk += 1;
                }
                None => {
                    self.state = SamplerState::Exhausted(epoch);
                    return Ok(None);
                }
            }
        }
    }

    fn seeded_epoch(&self) -> Result<Epoch> {
        self.state.epoch().ok_or(Error::UninitializedSampler)
    }

    fn permutation_for(&self, epoch: Epoch) -> Vec<u64> {
        let mut order: Vec<u64> = (0..self.num_chunks()).collect();
        let mut rng = seeded_rng(&[self.config.seed, epoch]);
        order.shuffle(&mut rng);
        order
    }

    fn plan_for(&self, epoch: Epoch) -> EpochPlan {
        let slots = self.topology.slots();
        let slot = self.topology.slot();

        // Permuted position i goes to slot i % slots; when the chunk count is
        // not a multiple of the slot count the leading slots get one more.
        let chunks = self
            .permutation_for(epoch)
            .into_iter()
            .enumerate()
            .filter(|(pos, _)| *pos as u64 % slots == slot)
            .map(|(_, id)| self.chunk(id))
            .collect();

        EpochPlan {
            epoch,
            slot,
            chunks,
        }
    }

    fn chunk(&self, id: u64) -> Chunk {
        let start = id * self.config.chunk_size;
        let end = (start + self.config.chunk_size).min(self.total_samples);
        Chunk { id, start, end }
    }

    fn chunk_indices(&self, epoch: Epoch, chunk: &Chunk) -> Vec<u64> {
        let mut indices: Vec<u64> = (chunk.start..chunk.end).collect();
        if self.config.shuffle {
            let mut rng = seeded_rng(&[self.config.seed, epoch, chunk.id]);
            indices.shuffle(&mut rng);
        }
        indices
    }
}
