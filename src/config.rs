// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use crate::error::BudgetConfig;
use crate::key::ExtTag;
use crate::partition::PackExtPartitionedTable;
use crate::table::ClockBlockCacheTable;

/// The smallest block size the cache will honor. Below this, per-block
/// bookkeeping overhead dominates the bytes actually cached.
pub const MIN_BLOCK_SIZE: usize = 512;

const DEFAULT_BLOCK_LIMIT: u64 = 32 * 1024 * 1024;
const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
const DEFAULT_CONCURRENCY_LEVEL: usize = 32;
const DEFAULT_STREAM_RATIO: f64 = 0.30;

fn next_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Per-extension routing into independent sub-tables, each with its own
/// budget. Every [`ExtTag`] must be assigned to exactly one partition;
/// leaving one out is a configuration error, not a silent default.
#[derive(Clone, Debug)]
pub struct PartitionMap {
    /// `partition_id` per `ExtTag::index()`.
    assignments: Vec<Option<usize>>,
    /// Per-partition `(block_limit, concurrency_level)`.
    partitions: Vec<(u64, usize)>,
}

impl PartitionMap {
    pub fn new(partitions: Vec<(u64, usize)>) -> Self {
        Self {
            assignments: vec![None; ExtTag::ALL.len()],
            partitions,
        }
    }

    pub fn assign(mut self, ext: ExtTag, partition_id: usize) -> Self {
        self.assignments[ext.index()] = Some(partition_id);
        self
    }

    fn validate(&self) -> Result<(), BudgetConfig> {
        for (i, slot) in self.assignments.iter().enumerate() {
            match slot {
                Some(p) if *p < self.partitions.len() => {},
                _ => return Err(BudgetConfig::UnmappedExtension { ext_index: i }),
            }
        }
        Ok(())
    }
}

/// Validated cache configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub block_limit: u64,
    pub block_size: usize,
    pub concurrency_level: usize,
    pub stream_ratio: f64,
    pub partition_map: Option<PartitionMap>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_limit: DEFAULT_BLOCK_LIMIT,
            block_size: DEFAULT_BLOCK_SIZE,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            stream_ratio: DEFAULT_STREAM_RATIO,
            partition_map: None,
        }
    }
}

/// Builds a validated [`Config`] and, from it, a ready-to-use cache table.
///
/// Mirrors the teacher's pattern of a small builder in front of the cache's
/// constructor rather than exposing field assignment directly, so invalid
/// combinations (a non-power-of-two block size, an incomplete partition map)
/// are caught at build time rather than surfacing as a panic on first use.
#[derive(Clone, Debug, Default)]
pub struct CacheBuilder {
    config: Config,
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_limit(mut self, bytes: u64) -> Self {
        self.config.block_limit = bytes;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.config.block_size = bytes;
        self
    }

    pub fn concurrency_level(mut self, n: usize) -> Self {
        self.config.concurrency_level = next_pow2(n);
        self
    }

    pub fn stream_ratio(mut self, ratio: f64) -> Self {
        self.config.stream_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn partition_map(mut self, map: PartitionMap) -> Self {
        self.config.partition_map = Some(map);
        self
    }

    pub fn validate(&self) -> Result<(), BudgetConfig> {
        if !self.config.block_size.is_power_of_two() {
            return Err(BudgetConfig::NotPowerOfTwo(self.config.block_size));
        }
        if self.config.block_size < MIN_BLOCK_SIZE {
            return Err(BudgetConfig::TooSmall(self.config.block_size));
        }
        if let Some(map) = &self.config.partition_map {
            map.validate()?;
        }
        Ok(())
    }

    /// Build a single, unpartitioned table.
    pub fn build_single(self, name: impl Into<String>) -> Result<ClockBlockCacheTable, BudgetConfig> {
        self.validate()?;
        Ok(ClockBlockCacheTable::new(
            name,
            self.config.block_limit,
            self.config.concurrency_level,
            self.config.block_size,
        ))
    }

    /// Build a table partitioned per [`PartitionMap`]. Fails if no partition
    /// map was supplied, or if it does not cover every [`ExtTag`].
    pub fn build_partitioned(self, name: impl Into<String>) -> Result<PackExtPartitionedTable, BudgetConfig> {
        self.validate()?;
        let map = self
            .config
            .partition_map
            .clone()
            .ok_or(BudgetConfig::UnmappedExtension { ext_index: 0 })?;

        let tables = map
            .partitions
            .iter()
            .enumerate()
            .map(|(i, &(limit, concurrency))| {
                ClockBlockCacheTable::new(format!("partition-{i}"), limit, concurrency, self.config.block_size)
            })
            .collect();

        let mut routing = [0usize; ExtTag::ALL.len()];
        for (i, slot) in map.assignments.iter().enumerate() {
            routing[i] = slot.expect("validated above");
        }

        Ok(PackExtPartitionedTable::new(name, routing, tables))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Whether a stream of `length` bytes should go through the block cache at
/// all, rather than being read straight through. Large files amortize a
/// direct read better than thrashing the cache with blocks that will never
/// be revisited.
pub fn should_copy_through_cache(length: u64, config: &Config) -> bool {
    length as f64 <= config.block_limit as f64 * config.stream_ratio
}
