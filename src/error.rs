// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::io;

use thiserror::Error;

/// A file was marked invalid and must not be read from again.
#[derive(Debug, Error)]
#[error("pack invalid: {cause}")]
pub struct PackInvalid {
    pub cause: String,
}

/// The channel returned fewer bytes than requested while the file's size was
/// known in advance.
#[derive(Debug, Error)]
#[error("short read at {pos}: wanted {wanted}, got {got}")]
pub struct ShortRead {
    pub pos: u64,
    pub wanted: usize,
    pub got: usize,
}

/// Errors surfaced while loading a block from the backing channel.
#[derive(Debug, Error)]
pub enum Load<E = io::Error> {
    #[error(transparent)]
    Invalid(#[from] PackInvalid),

    #[error(transparent)]
    ShortRead(#[from] ShortRead),

    #[error("channel io error")]
    Channel(#[source] E),
}

/// Invalid cache configuration supplied at construction time.
#[derive(Debug, Error)]
pub enum BudgetConfig {
    #[error("block-size {0} is not a power of two")]
    NotPowerOfTwo(usize),

    #[error("block-size {0} is smaller than the minimum of {min}", min = super::config::MIN_BLOCK_SIZE)]
    TooSmall(usize),

    #[error("partition {ext_index} is not covered by the partition map")]
    UnmappedExtension { ext_index: usize },
}
