// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::Block;
use crate::channel::{ChannelSupplier, ReadableChannel};
use crate::error::{Load, PackInvalid, ShortRead};
use crate::key::StreamKey;
use crate::table::BlockCacheTable;

/// Client-facing handle to a single cacheable file: knows its own block
/// size and how to align a byte position to a block boundary, and fences
/// off a file once a read has proven it unreadable so later callers fail
/// fast instead of retrying a corrupt stream.
pub struct BlockBasedFile {
    key: Arc<StreamKey>,
    block_size: usize,
    length: Option<u64>,
    invalid: AtomicBool,
    cause: Mutex<Option<String>>,
}

impl BlockBasedFile {
    pub fn new(key: Arc<StreamKey>, block_size: usize, length: Option<u64>) -> Self {
        Self {
            key,
            block_size,
            length,
            invalid: AtomicBool::new(false),
            cause: Mutex::new(None),
        }
    }

    /// Build a file handle, negotiating block size with the channel's own
    /// opinion up front. Opens `channel_supplier` exactly once to read its
    /// metadata (`block_size`/`size`); later cache misses reuse the same
    /// supplier through [`BlockBasedFile::get_or_load`] without any further
    /// negotiation.
    pub fn discover<S>(key: Arc<StreamKey>, default_block_size: usize, channel_supplier: &S) -> Result<Self, S::Error>
    where
        S: ChannelSupplier,
    {
        let channel = channel_supplier.open()?;
        let block_size = Self::discover_block_size(default_block_size, &channel);
        let length = channel.size();
        Ok(Self::new(key, block_size, length))
    }

    pub fn key(&self) -> &Arc<StreamKey> {
        &self.key
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Round `pos` down to the start of the block that contains it.
    pub fn align(&self, pos: u64) -> u64 {
        pos - (pos % self.block_size as u64)
    }

    /// Prefer the channel's own opinion of block size, if it has one, over
    /// the cache's configured default: if the channel reports `<= 0`, use
    /// the cache default outright; if the channel's size is smaller than
    /// the default, use the largest multiple of the channel's size that is
    /// still `<=` the default, so reads stay aligned to the channel's own
    /// native granularity.
    pub fn discover_block_size(default: usize, channel: &impl ReadableChannel) -> usize {
        match channel.block_size() {
            Some(n) if n > 0 && n < default => (default / n) * n,
            _ => default,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn mark_invalid(&self, cause: impl Into<String>) {
        *self.cause.lock().unwrap() = Some(cause.into());
        self.invalid.store(true, Ordering::Release);
    }

    fn invalid_error(&self) -> PackInvalid {
        PackInvalid {
            cause: self
                .cause
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "marked invalid".to_string()),
        }
    }

    /// Fetch the block covering `pos`, loading it through `channel_supplier`
    /// on a cache miss. Returns [`Load::Invalid`] immediately, without
    /// opening a channel, once this file has been marked invalid.
    pub fn get_or_load<T, S>(&self, table: &T, pos: u64, channel_supplier: &S) -> Result<Arc<Block>, Load<S::Error>>
    where
        T: BlockCacheTable,
        S: ChannelSupplier,
        S::Error: From<io::Error>,
    {
        if self.is_invalid() {
            return Err(Load::Invalid(self.invalid_error()));
        }

        let aligned = self.align(pos);
        let length = self.length;
        let block_size = self.block_size;
        let key = Arc::clone(&self.key);

        table.get_or_load_ref(&self.key, aligned, move || {
            let mut channel = channel_supplier.open().map_err(Load::Channel)?;
            channel.seek(aligned).map_err(|e| Load::Channel(e.into()))?;
            read_one_block(&mut channel, &key, aligned, block_size, length)
        })
    }
}

fn read_one_block<C: ReadableChannel, E: From<io::Error>>(
    channel: &mut C,
    key: &Arc<StreamKey>,
    aligned: u64,
    block_size: usize,
    length: Option<u64>,
) -> Result<Block, Load<E>> {
    let want = match length {
        Some(total) => block_size.min((total - aligned.min(total)) as usize),
        None => block_size,
    };

    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        let n = channel.read(&mut buf[filled..]).map_err(|e| Load::Channel(e.into()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled < want && length.is_some() {
        return Err(Load::ShortRead(ShortRead {
            pos: aligned,
            wanted: want,
            got: filled,
        }));
    }

    buf.truncate(filled);
    Ok(Block::new(Arc::clone(key), aligned, buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RepoId;
    use crate::table::ClockBlockCacheTable;
    use std::sync::Mutex as StdMutex;

    struct FakeChannel {
        data: Vec<u8>,
        pos: u64,
        native_block_size: Option<usize>,
    }

    impl ReadableChannel for FakeChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let off = self.pos as usize;
            if off >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - off);
            buf[..n].copy_from_slice(&self.data[off..off + n]);
            self.pos += n as u64;
            Ok(n)
        }

        fn seek(&mut self, pos: u64) -> io::Result<()> {
            self.pos = pos;
            Ok(())
        }

        fn size(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }

        fn block_size(&self) -> Option<usize> {
            self.native_block_size
        }
    }

    fn key() -> Arc<StreamKey> {
        Arc::new(StreamKey::new(RepoId::from("repo"), b"file.pack".to_vec(), None))
    }

    #[test]
    fn align_rounds_down_to_block_boundary() {
        let file = BlockBasedFile::new(key(), 16, Some(64));
        assert_eq!(file.align(0), 0);
        assert_eq!(file.align(15), 0);
        assert_eq!(file.align(16), 16);
        assert_eq!(file.align(31), 16);
    }

    #[test]
    fn loads_and_caches_a_block() {
        let table = ClockBlockCacheTable::new("t", 1 << 20, 4, 16);
        let file = BlockBasedFile::new(key(), 16, Some(64));
        let opens = StdMutex::new(0);
        let supplier = || -> Result<FakeChannel, io::Error> {
            *opens.lock().unwrap() += 1;
            Ok(FakeChannel {
                data: vec![7u8; 64],
                pos: 0,
                native_block_size: None,
            })
        };

        let block = file.get_or_load(&table, 20, &supplier).unwrap();
        assert_eq!(block.start(), 16, "reads are aligned to the block boundary");
        assert_eq!(block.size(), 16);

        file.get_or_load(&table, 16, &supplier).unwrap();
        assert_eq!(*opens.lock().unwrap(), 1, "the second request must hit the cache");
    }

    #[test]
    fn invalid_file_short_circuits_before_opening_a_channel() {
        let file = BlockBasedFile::new(key(), 16, Some(64));
        file.mark_invalid("corrupt header");
        let table = ClockBlockCacheTable::new("t", 1 << 20, 4, 16);
        let opens = StdMutex::new(0);
        let supplier = move || -> Result<FakeChannel, io::Error> {
            *opens.lock().unwrap() += 1;
            Ok(FakeChannel {
                data: vec![],
                pos: 0,
                native_block_size: None,
            })
        };

        let err = file.get_or_load(&table, 0, &supplier).unwrap_err();
        assert!(matches!(err, Load::Invalid(_)));
        assert_eq!(*opens.lock().unwrap(), 0, "must not open the channel once invalid");
    }

    #[test]
    fn short_read_is_reported_when_length_is_known() {
        let table = ClockBlockCacheTable::new("t", 1 << 20, 4, 16);
        // advertised length is 64, but the channel only ever has 40 bytes
        let file = BlockBasedFile::new(key(), 16, Some(64));
        let supplier = || -> Result<FakeChannel, io::Error> {
            Ok(FakeChannel {
                data: vec![1u8; 40],
                pos: 0,
                native_block_size: None,
            })
        };

        let err = file.get_or_load(&table, 32, &supplier).unwrap_err();
        assert!(matches!(err, Load::ShortRead(_)));
    }

    #[test]
    fn discover_block_size_falls_back_to_default_when_channel_has_no_opinion() {
        let channel = FakeChannel {
            data: vec![],
            pos: 0,
            native_block_size: None,
        };
        assert_eq!(BlockBasedFile::discover_block_size(65536, &channel), 65536);

        let channel = FakeChannel {
            data: vec![],
            pos: 0,
            native_block_size: Some(0),
        };
        assert_eq!(BlockBasedFile::discover_block_size(65536, &channel), 65536);
    }

    #[test]
    fn discover_block_size_rounds_down_to_a_multiple_of_the_channel_size() {
        let channel = FakeChannel {
            data: vec![],
            pos: 0,
            native_block_size: Some(7),
        };
        assert_eq!(BlockBasedFile::discover_block_size(65536, &channel), 65534);
    }

    #[test]
    fn discover_block_size_keeps_the_default_when_the_channel_size_is_not_smaller() {
        let channel = FakeChannel {
            data: vec![],
            pos: 0,
            native_block_size: Some(65536),
        };
        assert_eq!(BlockBasedFile::discover_block_size(65536, &channel), 65536);

        let channel = FakeChannel {
            data: vec![],
            pos: 0,
            native_block_size: Some(1 << 20),
        };
        assert_eq!(BlockBasedFile::discover_block_size(65536, &channel), 65536);
    }

    #[test]
    fn discover_negotiates_block_size_and_length_from_the_channel() {
        let supplier = || -> Result<FakeChannel, io::Error> {
            Ok(FakeChannel {
                data: vec![9u8; 100],
                pos: 0,
                native_block_size: Some(7),
            })
        };

        let file = BlockBasedFile::discover(key(), 65536, &supplier).unwrap();
        assert_eq!(file.block_size(), 65534);
        assert_eq!(file.length(), Some(100));
    }
}
