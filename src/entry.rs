// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;

use crate::key::StreamKey;

/// A slot in a [`crate::table::ClockBlockCacheTable`].
///
/// `value` is published with release semantics and read with acquire
/// semantics (via [`ArcSwapOption`]), so lookups never need to take the
/// table's stripe lock on the hit path. Once cleared by the clock evictor,
/// the slot becomes a *ghost*: `size` remains valid for accounting, but
/// `get()` returns `None` until a subsequent `put` supersedes it.
pub struct Entry<V> {
    key: StreamKey,
    position: u64,
    size: usize,
    value: ArcSwapOption<V>,
    hot: AtomicBool,
}

impl<V> Entry<V> {
    pub fn new(key: StreamKey, position: u64, size: usize, value: std::sync::Arc<V>) -> Self {
        Self {
            key,
            position,
            size,
            value: ArcSwapOption::new(Some(value)),
            hot: AtomicBool::new(true),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self) -> Option<std::sync::Arc<V>> {
        self.value.load_full()
    }

    pub fn has(&self) -> bool {
        self.value.load().is_some()
    }

    /// Evict: clear the value but keep the slot (and its `size`) for
    /// accounting until the slot is physically removed or overwritten.
    pub fn clear(&self) {
        self.value.store(None);
    }

    pub fn mark_hot(&self) {
        self.hot.store(true, Ordering::Release);
    }

    /// Clear the clock bit, returning whether it was set beforehand.
    pub fn clear_hot(&self) -> bool {
        self.hot.swap(false, Ordering::AcqRel)
    }

    pub fn is_hot(&self) -> bool {
        self.hot.load(Ordering::Acquire)
    }

    pub fn matches(&self, key: &StreamKey, position: u64) -> bool {
        self.position == position && &self.key == key
    }
}
