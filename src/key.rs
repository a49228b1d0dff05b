// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHasher;

/// Categorical type of a cached file.
///
/// The small integer returned by [`ExtTag::index`] is used as an array index
/// into the per-extension [`crate::stats::Stats`] vectors and into a
/// [`crate::partition::PackExtPartitionedTable`]'s routing table, so it must
/// stay stable for the lifetime of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtTag {
    Pack,
    Index,
    ReverseIndex,
    Bitmap,
    CommitGraph,
    MultiPackIndex,
    Reftable,
}

impl ExtTag {
    pub const ALL: [ExtTag; 7] = [
        ExtTag::Pack,
        ExtTag::Index,
        ExtTag::ReverseIndex,
        ExtTag::Bitmap,
        ExtTag::CommitGraph,
        ExtTag::MultiPackIndex,
        ExtTag::Reftable,
    ];

    /// Stable small-integer index used for stats and partitioning.
    pub fn index(&self) -> usize {
        match self {
            ExtTag::Pack => 0,
            ExtTag::Index => 1,
            ExtTag::ReverseIndex => 2,
            ExtTag::Bitmap => 3,
            ExtTag::CommitGraph => 4,
            ExtTag::MultiPackIndex => 5,
            ExtTag::Reftable => 6,
        }
    }
}

/// Opaque identity of a repository, distinct from its pretty name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RepoId(Arc<str>);

impl RepoId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for RepoId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Stable identity of a cacheable stream: `(repository, file name, extension)`.
///
/// `hash` is precomputed at construction and incorporates all three
/// components, so lookups never need to re-hash the file name.
#[derive(Clone, Debug)]
pub struct StreamKey {
    hash: u64,
    repo: RepoId,
    name: Arc<[u8]>,
    ext: Option<ExtTag>,
}

impl StreamKey {
    pub fn new(repo: RepoId, name: impl Into<Arc<[u8]>>, ext: Option<ExtTag>) -> Self {
        let name = name.into();
        let hash = mix(hash_of(&repo), hash_of(&*name)).wrapping_mul(31);
        Self {
            hash,
            repo,
            name,
            ext,
        }
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn ext(&self) -> Option<ExtTag> {
        self.ext
    }

    /// Stable small-integer index of this key's extension, or `0` if none.
    pub fn ext_index(&self) -> usize {
        self.ext.map(|e| e.index()).unwrap_or(0)
    }

    /// Wrap this key to disambiguate reverse-index caching of the same file
    /// from its forward index.
    pub fn for_reverse_index(key: &StreamKey) -> StreamKey {
        StreamKey {
            hash: key.hash.wrapping_add(1),
            repo: key.repo.clone(),
            name: key.name.clone(),
            ext: Some(ExtTag::ReverseIndex),
        }
    }
}

impl PartialEq for StreamKey {
    fn eq(&self, other: &Self) -> bool {
        self.repo == other.repo && self.name == other.name && self.ext == other.ext
    }
}

impl Eq for StreamKey {}

impl Hash for StreamKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

fn hash_of<T: Hash + ?Sized>(x: &T) -> u64 {
    let mut hasher = FxHasher::default();
    x.hash(&mut hasher);
    hasher.finish()
}

fn mix(a: u64, b: u64) -> u64 {
    a ^ b.wrapping_add(0x9e37_79b9_7f4a_7c15).wrapping_add(a << 6).wrapping_add(a >> 2)
}
