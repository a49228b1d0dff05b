// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;

use link_dfs_cache::{
    BlockBasedFile, BlockCacheTable, CacheBuilder, ExtTag, PartitionMap, ReadableChannel, RepoId, StreamKey,
};

struct MemoryChannel {
    data: Arc<Vec<u8>>,
    pos: u64,
}

impl ReadableChannel for MemoryChannel {
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
        None
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn concurrent_readers_share_a_single_channel_open() -> Result<()> {
    init_tracing();

    let data = Arc::new(vec![0x42u8; 4096]);
    let opens = Arc::new(AtomicUsize::new(0));
    let table = Arc::new(CacheBuilder::new().block_limit(1 << 20).block_size(1024).build_single("repo")?);
    let key = Arc::new(StreamKey::new(RepoId::from("repo-1"), b"pack-1.pack".to_vec(), Some(ExtTag::Pack)));
    let file = Arc::new(BlockBasedFile::new(Arc::clone(&key), 1024, Some(data.len() as u64)));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let table = Arc::clone(&table);
            let file = Arc::clone(&file);
            let data = Arc::clone(&data);
            let opens = Arc::clone(&opens);
            thread::spawn(move || -> Result<()> {
                let supplier = {
                    let opens = Arc::clone(&opens);
                    let data = Arc::clone(&data);
                    move || -> Result<MemoryChannel, io::Error> {
                        opens.fetch_add(1, Ordering::SeqCst);
                        Ok(MemoryChannel {
                            data: Arc::clone(&data),
                            pos: 0,
                        })
                    }
                };
                let block = file.get_or_load(&*table, 0, &supplier).map_err(|e| anyhow::anyhow!(e))?;
                assert_eq!(block.size(), 1024);
                Ok(())
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap()?;
    }

    assert_eq!(opens.load(Ordering::SeqCst), 1, "only the single-flight winner opens a channel");
    let snap = table.stats();
    assert_eq!(snap.miss_count(ExtTag::Pack.index()), 1);
    assert_eq!(snap.hit_count(ExtTag::Pack.index()), 11);
    Ok(())
}

#[test]
fn partitioned_table_keeps_extensions_from_starving_each_other() -> Result<()> {
    let mut map = PartitionMap::new(vec![(2048, 4), (2048, 4)]);
    for ext in ExtTag::ALL {
        map = map.assign(ext, if ext == ExtTag::Pack { 0 } else { 1 });
    }

    let table = CacheBuilder::new().block_size(512).partition_map(map).build_partitioned("repo")?;

    let pack_key = StreamKey::new(RepoId::from("r"), b"a.pack".to_vec(), Some(ExtTag::Pack));
    let idx_key = StreamKey::new(RepoId::from("r"), b"a.idx".to_vec(), Some(ExtTag::Index));

    // flood the pack partition well past what the index partition has
    for i in 0..8u64 {
        table.put(link_dfs_cache::Block::new(Arc::new(pack_key.clone()), i * 512, vec![1u8; 512]));
    }
    table.put(link_dfs_cache::Block::new(Arc::new(idx_key.clone()), 0, vec![2u8; 512]));

    assert!(
        table.contains(&idx_key, 0),
        "index partition must be unaffected by pack-partition eviction pressure"
    );
    Ok(())
}

#[test]
fn invalid_file_is_reported_without_touching_the_channel() -> Result<()> {
    let table = CacheBuilder::new().block_size(512).build_single("repo")?;
    let key = Arc::new(StreamKey::new(RepoId::from("r"), b"corrupt.pack".to_vec(), Some(ExtTag::Pack)));
    let file = BlockBasedFile::new(Arc::clone(&key), 512, Some(4096));
    file.mark_invalid("trailing checksum mismatch");

    let opens = Arc::new(AtomicUsize::new(0));
    let opens2 = Arc::clone(&opens);
    let supplier = move || -> Result<MemoryChannel, io::Error> {
        opens2.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryChannel {
            data: Arc::new(vec![]),
            pos: 0,
        })
    };

    let err = file.get_or_load(&table, 0, &supplier).unwrap_err();
    assert!(matches!(err, link_dfs_cache::Load::Invalid(_)));
    assert_eq!(opens.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn config_rejects_an_incomplete_partition_map() {
    let map = PartitionMap::new(vec![(1 << 20, 4)]).assign(ExtTag::Pack, 0);
    let result = CacheBuilder::new().partition_map(map).build_partitioned("repo");
    assert!(result.is_err());
}
