// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Per-extension counters for a single table.
#[derive(Default)]
struct ExtCounters {
    hit: AtomicU64,
    miss: AtomicU64,
    evict: AtomicU64,
    // signed: the budget is "best-effort", so overshoot during eviction races
    // can transiently drive this negative before the next `fetch_sub` lands.
    live_bytes: AtomicI64,
}

/// Lock-free, per-extension hit/miss/eviction/live-byte counters.
///
/// The backing vector is stored behind an [`ArcSwap`] so that growing it to
/// cover a newly observed extension index never blocks a concurrent
/// increment: readers either see the old, shorter vector (and retry once the
/// CAS below has installed the bigger one) or the new one, but never torn
/// state. Once a slot exists its [`Arc`] is shared by every vector snapshot
/// from then on, so an in-flight increment always lands on the right
/// counter even if the vector is resized underneath it.
pub struct Stats {
    name: String,
    counters: ArcSwap<Vec<Arc<ExtCounters>>>,
}

impl Stats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: ArcSwap::new(Arc::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn slot(&self, ext_index: usize) -> Arc<ExtCounters> {
        loop {
            let current = self.counters.load();
            if let Some(slot) = current.get(ext_index) {
                return Arc::clone(slot);
            }
            drop(current);
            self.counters.rcu(|old| {
                if old.len() > ext_index {
                    old.clone()
                } else {
                    let mut grown = old.clone();
                    grown.resize_with(ext_index + 1, || Arc::new(ExtCounters::default()));
                    grown
                }
            });
        }
    }

    pub fn record_hit(&self, ext_index: usize) {
        self.slot(ext_index).hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, ext_index: usize) {
        self.slot(ext_index).miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evict(&self, ext_index: usize) {
        self.slot(ext_index).evict.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_live_bytes(&self, ext_index: usize, delta: i64) {
        self.slot(ext_index).live_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sub_live_bytes(&self, ext_index: usize, delta: i64) {
        self.slot(ext_index).live_bytes.fetch_sub(delta, Ordering::Relaxed);
    }

    /// Sum of live bytes across all extensions currently tracked.
    pub fn total_live_bytes(&self) -> i64 {
        self.counters
            .load()
            .iter()
            .map(|c| c.live_bytes.load(Ordering::Relaxed))
            .sum()
    }

    pub fn snapshot(&self) -> StatsView {
        let counters = self.counters.load();
        let hit = counters.iter().map(|c| c.hit.load(Ordering::Relaxed)).collect();
        let miss = counters.iter().map(|c| c.miss.load(Ordering::Relaxed)).collect();
        let evict = counters.iter().map(|c| c.evict.load(Ordering::Relaxed)).collect();
        let current_size = counters
            .iter()
            .map(|c| c.live_bytes.load(Ordering::Relaxed).max(0) as u64)
            .collect();
        StatsView {
            name: self.name.clone(),
            hit,
            miss,
            evict,
            current_size,
        }
    }
}

/// A point-in-time, per-extension snapshot of a table's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsView {
    pub name: String,
    pub hit: Vec<u64>,
    pub miss: Vec<u64>,
    pub evict: Vec<u64>,
    pub current_size: Vec<u64>,
}

impl StatsView {
    fn len(&self) -> usize {
        [
            self.hit.len(),
            self.miss.len(),
            self.evict.len(),
            self.current_size.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    pub fn hit_count(&self, ext_index: usize) -> u64 {
        self.hit.get(ext_index).copied().unwrap_or(0)
    }

    pub fn miss_count(&self, ext_index: usize) -> u64 {
        self.miss.get(ext_index).copied().unwrap_or(0)
    }

    pub fn total_request_count(&self, ext_index: usize) -> u64 {
        self.hit_count(ext_index) + self.miss_count(ext_index)
    }

    pub fn eviction_count(&self, ext_index: usize) -> u64 {
        self.evict.get(ext_index).copied().unwrap_or(0)
    }

    pub fn current_size(&self, ext_index: usize) -> u64 {
        self.current_size.get(ext_index).copied().unwrap_or(0)
    }

    /// Integer percent hit ratio for `ext_index`. `0` when there have been no
    /// requests at all; `100` when there have been only hits.
    pub fn hit_ratio(&self, ext_index: usize) -> u64 {
        let total = self.total_request_count(ext_index);
        if total == 0 {
            0
        } else {
            self.hit_count(ext_index) * 100 / total
        }
    }

    /// Combine this snapshot with another, summing counters index by index.
    ///
    /// Per-extension vectors from independently-grown tables can differ in
    /// length. The shorter vector is treated as implicitly zero beyond its
    /// end — it is **not** padded by repeating its last element, which is a
    /// correctness bug some block-cache implementations of this shape carry.
    pub fn merge(mut self, other: &StatsView) -> StatsView {
        let len = self.len().max(other.len());
        self.hit.resize(len, 0);
        self.miss.resize(len, 0);
        self.evict.resize(len, 0);
        self.current_size.resize(len, 0);
        for i in 0..len {
            self.hit[i] += other.hit_count(i);
            self.miss[i] += other.miss_count(i);
            self.evict[i] += other.eviction_count(i);
            self.current_size[i] += other.current_size(i);
        }
        self
    }
}

/// Aggregate a set of table snapshots into one combined view.
pub fn aggregate(name: impl Into<String>, snapshots: impl IntoIterator<Item = StatsView>) -> StatsView {
    let mut acc = StatsView {
        name: name.into(),
        ..StatsView::default()
    };
    for s in snapshots {
        acc = acc.merge(&s);
    }
    acc
}
