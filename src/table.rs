// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::block::Block;
use crate::clock::ClockRing;
use crate::entry::Entry;
use crate::key::StreamKey;
use crate::stats::{Stats, StatsView};

fn next_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

fn hash_key_pos(key: &StreamKey, pos: u64) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    pos.hash(&mut hasher);
    hasher.finish()
}

/// Shared capability of the single striped table and the partitioned router,
/// so callers (and tests) can treat either uniformly.
pub trait BlockCacheTable: Send + Sync {
    fn name(&self) -> &str;

    /// `true` iff a *live* block for `key` at position `0` is present.
    fn has_block_zero(&self, key: &StreamKey) -> bool;

    fn contains(&self, key: &StreamKey, pos: u64) -> bool;

    fn get(&self, key: &StreamKey, pos: u64) -> Option<Arc<Block>>;

    /// Install an externally-loaded block. A no-op if a live entry for the
    /// same `(key, start)` already exists.
    fn put(&self, block: Block);

    /// Single-flight load: if `(key, pos)` is already live, return it. If a
    /// load for the same key is already in flight, wait for it. Otherwise run
    /// `loader` to produce the block and install it.
    fn get_or_load_ref<F, E>(&self, key: &StreamKey, pos: u64, loader: F) -> Result<Arc<Block>, E>
    where
        F: FnOnce() -> Result<Block, E>;

    fn stats(&self) -> StatsView;
}

enum LoadState {
    Loading,
    Done(Arc<Entry<Block>>),
    Failed,
}

enum WaitOutcome {
    Value(Arc<Block>),
    Retry,
}

struct LoadSlot {
    state: Mutex<LoadState>,
    cond: Condvar,
}

/// The main shared cache: a striped hash table of entries, a clock eviction
/// ring, and per-`(key, pos)` single-flight coordination.
///
/// Lookups that hit are lock-free: they read a bucket's `ArcSwap` snapshot
/// and the entry's atomically-published value without ever taking a lock.
/// Misses serialize through a per-stripe mutex that also guards the
/// in-flight load map, so concurrent callers for the same key share one
/// load instead of racing the backing channel.
pub struct ClockBlockCacheTable {
    name: String,
    block_limit: u64,
    capacity: usize,
    stripe_mask: usize,
    buckets: Vec<ArcSwap<Vec<Arc<Entry<Block>>>>>,
    inflight: Vec<Mutex<HashMap<(StreamKey, u64), Arc<LoadSlot>>>>,
    clock: Mutex<ClockRing<Arc<Entry<Block>>>>,
    stats: Stats,
}

impl ClockBlockCacheTable {
    /// `expected_entry_bytes` is normally the cache's block size; it is used
    /// only to size the bucket-chain table, not to bound individual entries.
    pub fn new(
        name: impl Into<String>,
        block_limit: u64,
        concurrency_level: usize,
        expected_entry_bytes: usize,
    ) -> Self {
        let capacity = next_pow2(((block_limit / expected_entry_bytes.max(1) as u64) as usize).max(16));
        let stripes = next_pow2(concurrency_level.max(1));
        let name = name.into();
        Self {
            stats: Stats::new(name.clone()),
            name,
            block_limit,
            capacity,
            stripe_mask: stripes - 1,
            buckets: (0..capacity).map(|_| ArcSwap::new(Arc::new(Vec::new()))).collect(),
            inflight: (0..stripes).map(|_| Mutex::new(HashMap::new())).collect(),
            clock: Mutex::new(ClockRing::new()),
        }
    }

    fn bucket_index(&self, h: u64) -> usize {
        h as usize & (self.capacity - 1)
    }

    fn stripe_index(&self, h: u64) -> usize {
        h as usize & self.stripe_mask
    }

    fn scan_bucket(&self, bucket_idx: usize, key: &StreamKey, pos: u64) -> Option<Arc<Entry<Block>>> {
        let bucket = self.buckets[bucket_idx].load();
        bucket.iter().find(|e| e.matches(key, pos)).cloned()
    }

    /// Optimistic, lock-free probe of the hit path. Returns a live value, or
    /// `None` on a miss (which may simply be a stale read racing an
    /// in-progress insert — always safe to fall through to the slow path).
    fn try_hit(&self, bucket_idx: usize, key: &StreamKey, pos: u64) -> Option<Arc<Block>> {
        let entry = self.scan_bucket(bucket_idx, key, pos)?;
        let value = entry.get()?;
        entry.mark_hot();
        self.stats.record_hit(key.ext_index());
        trace!(target: "link_dfs_cache::table", pos, "cache hit");
        Some(value)
    }

    fn install(&self, key: StreamKey, pos: u64, bucket_idx: usize, block: Block) -> Arc<Entry<Block>> {
        let size = block.size();
        let ext_index = key.ext_index();

        self.reserve_space(size);

        let entry = Arc::new(Entry::new(key, pos, size, Arc::new(block)));
        self.clock.lock().insert(Arc::clone(&entry));
        self.stats.add_live_bytes(ext_index, size as i64);

        self.buckets[bucket_idx].rcu(|old| {
            let mut next = old.clone();
            next.retain(|e| !e.matches(entry.key(), entry.position()));
            next.push(Arc::clone(&entry));
            next
        });

        entry
    }

    /// Clock-sweep eviction: free at least `need` bytes (best effort, bounded
    /// to `2 * capacity` steps) before an insertion is allowed to proceed.
    fn reserve_space(&self, need: usize) {
        let mut clock = self.clock.lock();
        let bound = 2 * self.capacity.max(1);
        let mut steps = 0;
        let need = need as i64;

        // `total_live_bytes()` already reflects every eviction made earlier in
        // this same sweep, so it alone (not `- freed` on top of it) is the
        // correct quantity to compare against the budget.
        while self.stats.total_live_bytes() + need > self.block_limit as i64 && steps < bound {
            let idx = match clock.advance() {
                Some(idx) => idx,
                None => break,
            };
            let victim = Arc::clone(clock.get(idx));
            steps += 1;

            if victim.clear_hot() {
                trace!(target: "link_dfs_cache::table", "second chance for hot entry");
                continue;
            }
            if victim.has() {
                victim.clear();
                let size = victim.size() as i64;
                self.stats.sub_live_bytes(victim.key().ext_index(), size);
                self.stats.record_evict(victim.key().ext_index());
                debug!(target: "link_dfs_cache::table", bytes = size, "evicted block");
            }
        }

        if steps >= bound && self.stats.total_live_bytes() + need > self.block_limit as i64 {
            warn!(
                target: "link_dfs_cache::table",
                need, "eviction sweep exhausted its step budget without freeing enough space"
            );
        }
    }
}

impl BlockCacheTable for ClockBlockCacheTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_block_zero(&self, key: &StreamKey) -> bool {
        let h = hash_key_pos(key, 0);
        let bucket_idx = self.bucket_index(h);
        self.scan_bucket(bucket_idx, key, 0).map(|e| e.has()).unwrap_or(false)
    }

    fn contains(&self, key: &StreamKey, pos: u64) -> bool {
        let h = hash_key_pos(key, pos);
        let bucket_idx = self.bucket_index(h);
        self.scan_bucket(bucket_idx, key, pos).map(|e| e.has()).unwrap_or(false)
    }

    fn get(&self, key: &StreamKey, pos: u64) -> Option<Arc<Block>> {
        let h = hash_key_pos(key, pos);
        let bucket_idx = self.bucket_index(h);
        match self.try_hit(bucket_idx, key, pos) {
            Some(v) => Some(v),
            None => {
                self.stats.record_miss(key.ext_index());
                trace!(target: "link_dfs_cache::table", pos, "cache miss");
                None
            },
        }
    }

    fn put(&self, block: Block) {
        let key = block.key().clone();
        let pos = block.start();
        let h = hash_key_pos(&key, pos);
        let bucket_idx = self.bucket_index(h);
        let stripe_idx = self.stripe_index(h);

        let _guard = self.inflight[stripe_idx].lock();
        if self.scan_bucket(bucket_idx, &key, pos).map(|e| e.has()).unwrap_or(false) {
            return;
        }
        self.install(key, pos, bucket_idx, block);
    }

    fn get_or_load_ref<F, E>(&self, key: &StreamKey, pos: u64, loader: F) -> Result<Arc<Block>, E>
    where
        F: FnOnce() -> Result<Block, E>,
    {
        let h = hash_key_pos(key, pos);
        let bucket_idx = self.bucket_index(h);
        let stripe_idx = self.stripe_index(h);
        let mut loader = Some(loader);

        // A failed load is removed from the in-flight map, and every waiter
        // retries from the top rather than propagating someone else's error:
        // each caller owns its own `loader`, so whichever thread loses the
        // wait simply has its turn at becoming the new single-flight leader.
        loop {
            if let Some(v) = self.try_hit(bucket_idx, key, pos) {
                return Ok(v);
            }

            let slot = {
                let mut inflight = self.inflight[stripe_idx].lock();

                if let Some(v) = self.try_hit(bucket_idx, key, pos) {
                    return Ok(v);
                }

                if let Some(existing) = inflight.get(&(key.clone(), pos)) {
                    debug!(target: "link_dfs_cache::table", pos, "single-flight contention, waiting on in-flight load");
                    Arc::clone(existing)
                } else {
                    trace!(target: "link_dfs_cache::table", pos, "single-flight load starting");
                    let slot = Arc::new(LoadSlot {
                        state: Mutex::new(LoadState::Loading),
                        cond: Condvar::new(),
                    });
                    inflight.insert((key.clone(), pos), Arc::clone(&slot));
                    drop(inflight);
                    let loader = loader.take().expect("the leader path runs at most once");
                    return self.drive_load(key, pos, bucket_idx, stripe_idx, slot, loader);
                }
            };

            match self.wait_for_load(key, &slot) {
                WaitOutcome::Value(v) => return Ok(v),
                WaitOutcome::Retry => continue,
            }
        }
    }

    fn stats(&self) -> StatsView {
        self.stats.snapshot()
    }
}

impl ClockBlockCacheTable {
    /// We won the race to load `(key, pos)`: run `loader` outside any lock,
    /// then install the result and wake anyone who queued up behind us.
    fn drive_load<F, E>(
        &self,
        key: &StreamKey,
        pos: u64,
        bucket_idx: usize,
        stripe_idx: usize,
        slot: Arc<LoadSlot>,
        loader: F,
    ) -> Result<Arc<Block>, E>
    where
        F: FnOnce() -> Result<Block, E>,
    {
        let result = loader();

        let mut inflight = self.inflight[stripe_idx].lock();
        match result {
            Ok(block) => {
                let entry = self.install(key.clone(), pos, bucket_idx, block);
                self.stats.record_miss(key.ext_index());
                let value = entry.get().expect("just installed");
                *slot.state.lock() = LoadState::Done(entry);
                slot.cond.notify_all();
                inflight.remove(&(key.clone(), pos));
                trace!(target: "link_dfs_cache::table", pos, "single-flight load completed");
                Ok(value)
            },
            Err(e) => {
                *slot.state.lock() = LoadState::Failed;
                slot.cond.notify_all();
                inflight.remove(&(key.clone(), pos));
                warn!(target: "link_dfs_cache::table", pos, "single-flight load failed, waiters will retry");
                Err(e)
            },
        }
    }

    fn wait_for_load(&self, key: &StreamKey, slot: &Arc<LoadSlot>) -> WaitOutcome {
        let mut state = slot.state.lock();
        loop {
            match &*state {
                LoadState::Loading => slot.cond.wait(&mut state),
                LoadState::Done(entry) => {
                    let value = entry.get().expect("done implies a value");
                    entry.mark_hot();
                    self.stats.record_hit(key.ext_index());
                    trace!(target: "link_dfs_cache::table", "observed single-flight winner's value");
                    return WaitOutcome::Value(value);
                },
                LoadState::Failed => {
                    debug!(target: "link_dfs_cache::table", "single-flight leader failed, retrying as new leader");
                    return WaitOutcome::Retry;
                },
            }
        }
    }
}
