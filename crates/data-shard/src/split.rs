//! Node and worker shard splitting
//!
//! Shards are dealt out twice: first across nodes, then across the loader
//! workers of a node. Every (rank, worker) pair ends up with a disjoint
//! subset, so one pass in non-resampled mode serves each sample once.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use shard_core::{Epoch, Result, Topology};

use crate::seed::seeded_rng;

/// How one level of the split picks its shards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Keep position `i` when `i % parts == index`
    #[default]
    Modulo,

    /// Keep everything at this level
    Disabled,

    /// Keep exactly these shard indices
    Explicit(Vec<usize>),
}

impl SplitPolicy {
    fn apply(&self, shards: Vec<usize>, index: u32, parts: u32) -> Vec<usize> {
        match self {
            SplitPolicy::Modulo => shards
                .into_iter()
                .enumerate()
                .filter_map(|(pos, shard)| {
                    if (pos as u64) % parts as u64 == index as u64 {
                        Some(shard)
                    } else {
                        None
                    }
                })
                .collect(),
            SplitPolicy::Disabled => shards,
            SplitPolicy::Explicit(keep) => shards
                .into_iter()
                .filter(|shard| keep.contains(shard))
                .collect(),
        }
    }
}

/// Node-level and worker-level split policies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardSplit {
    /// Split across ranks
    pub node: SplitPolicy,

    /// Split across the workers of one rank
    pub worker: SplitPolicy,
}

impl ShardSplit {
    /// No splitting at either level
    pub fn disabled() -> Self {
        Self {
            node: SplitPolicy::Disabled,
            worker: SplitPolicy::Disabled,
        }
    }

    /// Shards read by `topology`'s (rank, worker) from a given shard order
    pub fn assign(&self, order: &[usize], topology: &Topology) -> Result<Vec<usize>> {
        topology.validate()?;
        let node = self
            .node
            .apply(order.to_vec(), topology.rank, topology.world_size);
        Ok(self
            .worker
            .apply(node, topology.worker_id, topology.num_workers))
    }

    /// Shard indices for one epoch, optionally shuffled with `seed` first.
    ///
    /// The shuffle depends only on (seed, epoch), so every rank computes the
    /// same order and the split stays disjoint.
    pub fn plan_epoch(
        &self,
        num_shards: usize,
        topology: &Topology,
        epoch: Epoch,
        shuffle_seed: Option<u64>,
    ) -> Result<Vec<usize>> {
        let order = match shuffle_seed {
            Some(seed) => shuffled_shard_order(num_shards, seed, epoch),
            None => (0..num_shards).collect(),
        };
        let assigned = self.assign(&order, topology)?;

        tracing::debug!(
            epoch,
            rank = topology.rank,
            worker = topology.worker_id,
            assigned = assigned.len(),
            total = num_shards,
            "Planned shard split"
        );
        Ok(assigned)
    }
}

/// Deterministic shard order for an epoch
pub fn shuffled_shard_order(num_shards: usize, seed: u64, epoch: Epoch) -> Vec<usize> {
    let mut order: Vec<usize> = (0..num_shards).collect();
    let mut rng = seeded_rng(&[seed, epoch]);
    order.shuffle(&mut rng);
    order
}

/// Endless shard indices drawn uniformly with replacement
#[derive(Debug, Clone)]
pub struct ResampledShards {
    num_shards: usize,
    rng: ChaCha8Rng,
}

impl ResampledShards {
    /// Seeded by (seed, epoch, rank, worker) so workers draw independently
    pub fn new(num_shards: usize, seed: u64, epoch: Epoch, topology: &Topology) -> Self {
        Self {
            num_shards,
            rng: seeded_rng(&[
                seed,
                epoch,
                topology.rank as u64,
                topology.worker_id as u64,
            ]),
        }
    }
}

impl Iterator for ResampledShards {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.num_shards == 0 {
            return None;
        }
        Some(self.rng.gen_range(0..self.num_shards))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all_assignments(
        split: &ShardSplit,
        order: &[usize],
        world_size: u32,
        num_workers: u32,
    ) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        for rank in 0..world_size {
            for worker in 0..num_workers {
                let topo = Topology::new(rank, world_size, worker, num_workers);
                out.push(split.assign(order, &topo).unwrap());
            }
        }
        out
    }

    #[test]
    fn test_modulo_split_is_disjoint_and_complete() {
        let order: Vec<usize> = (0..37).collect();
        let parts = all_assignments(&ShardSplit::default(), &order, 3, 4);

        let mut seen = HashSet::new();
        for part in &parts {
            for shard in part {
                assert!(seen.insert(*shard), "shard {} assigned twice", shard);
            }
        }
        assert_eq!(seen.len(), 37);
    }

    #[test]
    fn test_node_then_worker_split() {
        let order: Vec<usize> = (0..8).collect();
        let split = ShardSplit::default();

        // Node 1 of 2 holds 1, 3, 5, 7; worker 0 of 2 takes positions 0 and 2.
        let topo = Topology::new(1, 2, 0, 2);
        assert_eq!(split.assign(&order, &topo).unwrap(), vec![1, 5]);

        let topo = Topology::new(1, 2, 1, 2);
        assert_eq!(split.assign(&order, &topo).unwrap(), vec![3, 7]);
    }

    #[test]
    fn test_explicit_node_override() {
        let order: Vec<usize> = (0..6).collect();
        let split = ShardSplit {
            node: SplitPolicy::Explicit(vec![5, 0, 2]),
            worker: SplitPolicy::Disabled,
        };
        let topo = Topology::new(0, 4, 0, 1);
        assert_eq!(split.assign(&order, &topo).unwrap(), vec![0, 2, 5]);
    }

    #[test]
    fn test_more_workers_than_shards_leaves_some_empty() {
        let order: Vec<usize> = (0..2).collect();
        let parts = all_assignments(&ShardSplit::default(), &order, 1, 4);
        assert_eq!(parts.iter().filter(|p| p.is_empty()).count(), 2);
    }

    #[test]
    fn test_invalid_world_size() {
        let topo = Topology::new(0, 0, 0, 1);
        assert!(ShardSplit::default().assign(&[0, 1], &topo).is_err());
    }

    #[test]
    fn test_shuffled_order_is_deterministic_per_epoch() {
        let a = shuffled_shard_order(100, 42, 0);
        let b = shuffled_shard_order(100, 42, 0);
        let c = shuffled_shard_order(100, 42, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut sorted = c.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_plan_epoch_with_shuffle_stays_disjoint() {
        let split = ShardSplit::default();
        let mut seen = HashSet::new();
        for rank in 0..2 {
            let topo = Topology::new(rank, 2, 0, 1);
            for shard in split.plan_epoch(20, &topo, 3, Some(7)).unwrap() {
                assert!(seen.insert(shard));
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_resampled_is_endless_and_seeded() {
        let topo = Topology::new(0, 1, 0, 2);
        let a: Vec<usize> = ResampledShards::new(5, 1, 0, &topo).take(1000).collect();
        let b: Vec<usize> = ResampledShards::new(5, 1, 0, &topo).take(1000).collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|&s| s < 5));

        let other = ResampledShards::new(5, 1, 0, &topo.with_worker(1, 2))
            .take(1000)
            .collect::<Vec<_>>();
        assert_ne!(a, other);
    }

    #[test]
    fn test_resampled_over_nothing_ends() {
        let topo = Topology::single();
        assert_eq!(ResampledShards::new(0, 1, 0, &topo).next(), None);
    }
}
