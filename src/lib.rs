// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! A concurrent, clock-eviction block cache for packfiles and pack-index
//! files backed by a distributed filesystem.
//!
//! The cache itself never speaks pack format, never parses a ref database,
//! and never opens a socket: it caches fixed-size byte windows of whatever
//! a [`channel::ChannelSupplier`] hands it, keyed by repository, file name,
//! and extension. Callers supply the I/O; this crate supplies the
//! single-flight loading, clock eviction, and per-extension accounting on
//! top of it.
//!
//! [`table::ClockBlockCacheTable`] is the striped, lock-free-on-the-hit-path
//! table at the core of the crate. [`partition::PackExtPartitionedTable`]
//! wraps several of those behind one [`table::BlockCacheTable`] handle when
//! independent per-extension budgets are required. [`file::BlockBasedFile`]
//! is the client-facing façade that aligns byte positions to block
//! boundaries and fences off files that have proven unreadable.
//! [`delta_base::DeltaBaseCache`] is unrelated and unsynchronized: a small
//! thread-local LRU for delta-resolved objects.

pub mod block;
pub mod channel;
pub mod clock;
pub mod config;
pub mod delta_base;
pub mod entry;
pub mod error;
pub mod file;
pub mod key;
pub mod partition;
pub mod stats;
pub mod table;

pub use block::Block;
pub use channel::{ChannelSupplier, ReadableChannel};
pub use config::{CacheBuilder, Config, PartitionMap};
pub use delta_base::DeltaBaseCache;
pub use error::{BudgetConfig, Load, PackInvalid, ShortRead};
pub use file::BlockBasedFile;
pub use key::{ExtTag, RepoId, StreamKey};
pub use partition::PackExtPartitionedTable;
pub use stats::{Stats, StatsView};
pub use table::{BlockCacheTable, ClockBlockCacheTable};
