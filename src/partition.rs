// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::sync::Arc;

use crate::block::Block;
use crate::key::{ExtTag, StreamKey};
use crate::stats::{self, StatsView};
use crate::table::{BlockCacheTable, ClockBlockCacheTable};

/// Routes requests to one of several independent [`ClockBlockCacheTable`]s by
/// [`ExtTag`], so that, say, a flood of pack reads cannot starve the bitmap
/// or commit-graph budget. Each partition is evicted independently; there is
/// no cross-partition borrowing of space.
pub struct PackExtPartitionedTable {
    name: String,
    /// `ExtTag::index() -> partition index into `tables``.
    routing: [usize; ExtTag::ALL.len()],
    tables: Vec<ClockBlockCacheTable>,
}

impl PackExtPartitionedTable {
    pub fn new(name: impl Into<String>, routing: [usize; ExtTag::ALL.len()], tables: Vec<ClockBlockCacheTable>) -> Self {
        for &idx in &routing {
            assert!(idx < tables.len(), "routing entry points past the end of `tables`");
        }
        Self {
            name: name.into(),
            routing,
            tables,
        }
    }

    fn table_for(&self, key: &StreamKey) -> &ClockBlockCacheTable {
        &self.tables[self.routing[key.ext_index()]]
    }
}

impl BlockCacheTable for PackExtPartitionedTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_block_zero(&self, key: &StreamKey) -> bool {
        self.table_for(key).has_block_zero(key)
    }

    fn contains(&self, key: &StreamKey, pos: u64) -> bool {
        self.table_for(key).contains(key, pos)
    }

    fn get(&self, key: &StreamKey, pos: u64) -> Option<Arc<Block>> {
        self.table_for(key).get(key, pos)
    }

    fn put(&self, block: Block) {
        self.table_for(block.key()).put(block)
    }

    fn get_or_load_ref<F, E>(&self, key: &StreamKey, pos: u64, loader: F) -> Result<Arc<Block>, E>
    where
        F: FnOnce() -> Result<Block, E>,
    {
        self.table_for(key).get_or_load_ref(key, pos, loader)
    }

    fn stats(&self) -> StatsView {
        stats::aggregate(self.name.clone(), self.tables.iter().map(|t| t.stats()))
    }
}
