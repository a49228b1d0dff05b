// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::io::{self, Write};
use std::sync::Arc;

use flate2::{Decompress, DecompressError, FlushDecompress, Status};

use crate::key::StreamKey;

/// An immutable, fixed-size byte slice of a cached file.
///
/// A `Block` carries no knowledge of pack format, delta resolution, or the
/// git object model — it is a dumb window onto bytes `[start, end)` of
/// `key`'s underlying stream.
#[derive(Clone)]
pub struct Block {
    key: Arc<StreamKey>,
    start: u64,
    bytes: Arc<[u8]>,
}

impl Block {
    pub fn new(key: Arc<StreamKey>, start: u64, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            key,
            start,
            bytes: bytes.into(),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `true` iff `pos` falls within `[start, end)` of a block belonging to
    /// `key`.
    pub fn contains(&self, key: &StreamKey, pos: u64) -> bool {
        &*self.key == key && self.start <= pos && pos < self.end()
    }

    fn offset_of(&self, pos: u64) -> usize {
        debug_assert!(pos >= self.start);
        (pos - self.start) as usize
    }

    /// Copy up to `n` bytes starting at `pos` into `dst[dst_off..]`, bounded
    /// by however much of the block remains from `pos`. Returns the number of
    /// bytes actually copied.
    pub fn copy(&self, pos: u64, dst: &mut [u8], dst_off: usize, n: usize) -> usize {
        let off = self.offset_of(pos);
        let avail = self.bytes.len().saturating_sub(off);
        let n = n.min(avail).min(dst.len().saturating_sub(dst_off));
        dst[dst_off..dst_off + n].copy_from_slice(&self.bytes[off..off + n]);
        n
    }

    /// Fold up to `n` bytes from `pos` into a running CRC32.
    pub fn crc32_update(&self, crc: &mut crc32fast::Hasher, pos: u64, n: usize) -> usize {
        let off = self.offset_of(pos);
        let avail = self.bytes.len().saturating_sub(off);
        let n = n.min(avail);
        crc.update(&self.bytes[off..off + n]);
        n
    }

    /// Feed up to `n` bytes from `pos` into `inflater` as compressed input.
    /// Returns the number of input bytes consumed.
    pub fn inflate_input(
        &self,
        inflater: &mut Decompress,
        pos: u64,
        n: usize,
        out: &mut [u8],
    ) -> Result<usize, DecompressError> {
        let off = self.offset_of(pos);
        let avail = self.bytes.len().saturating_sub(off);
        let n = n.min(avail);
        let before_in = inflater.total_in();
        let status = inflater.decompress(&self.bytes[off..off + n], out, FlushDecompress::None)?;
        let consumed = (inflater.total_in() - before_in) as usize;
        debug_assert!(matches!(status, Status::Ok | Status::StreamEnd | Status::BufError));
        Ok(consumed)
    }

    /// Write up to `n` bytes starting at `pos` to `out`. Returns the number of
    /// bytes written.
    pub fn write(&self, out: &mut impl Write, pos: u64, n: usize) -> io::Result<usize> {
        let off = self.offset_of(pos);
        let avail = self.bytes.len().saturating_sub(off);
        let n = n.min(avail);
        out.write_all(&self.bytes[off..off + n])?;
        Ok(n)
    }

    /// Verify that the CRC32 of `n` bytes from `pos`, computed via `tmp` as a
    /// scratch buffer, matches `expected`.
    pub fn check(&self, tmp: &mut [u8], pos: u64, n: usize, expected: u32) -> bool {
        let mut crc = crc32fast::Hasher::new();
        let off = self.offset_of(pos);
        let avail = self.bytes.len().saturating_sub(off);
        let mut remaining = n.min(avail);
        let mut cursor = off;
        while remaining > 0 {
            let chunk = remaining.min(tmp.len());
            tmp[..chunk].copy_from_slice(&self.bytes[cursor..cursor + chunk]);
            crc.update(&tmp[..chunk]);
            cursor += chunk;
            remaining -= chunk;
        }
        crc.finalize() == expected
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.start == other.start
    }
}

impl Eq for Block {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RepoId;

    fn test_key() -> Arc<StreamKey> {
        Arc::new(StreamKey::new(RepoId::from("repo"), b"pack-1.pack".to_vec(), None))
    }

    #[test]
    fn equal_iff_same_key_and_start() {
        let k = test_key();
        let a = Block::new(k.clone(), 0, vec![1u8; 8]);
        let b = Block::new(k.clone(), 0, vec![2u8; 8]);
        assert_eq!(a, b, "start and key are the identity, not content");

        let c = Block::new(k, 8, vec![1u8; 8]);
        assert_ne!(a, c);
    }

    #[test]
    fn contains_checks_bounds() {
        let k = test_key();
        let b = Block::new(k.clone(), 100, vec![0u8; 16]);
        assert!(b.contains(&k, 100));
        assert!(b.contains(&k, 115));
        assert!(!b.contains(&k, 116));
        assert!(!b.contains(&k, 99));
    }

    #[test]
    fn copy_is_bounded_by_remaining() {
        let k = test_key();
        let b = Block::new(k, 0, (0u8..16).collect::<Vec<_>>());
        let mut dst = [0u8; 32];
        let n = b.copy(10, &mut dst, 0, 100);
        assert_eq!(n, 6);
        assert_eq!(&dst[..6], &[10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn crc32_matches_crc32fast_over_same_bytes() {
        let k = test_key();
        let data = b"the quick brown fox".to_vec();
        let b = Block::new(k, 0, data.clone());
        let mut crc = crc32fast::Hasher::new();
        b.crc32_update(&mut crc, 0, data.len());
        assert_eq!(crc.finalize(), crc32fast::hash(&data));
    }
}
