// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(clippy::unwrap_used)]

use blob_store::{
    file::blob_file_path, BlobFileBuilder, BlobFileCache, BlobHandle, CompressionType,
};
use rand::{Rng, SeedableRng};
use test_log::test;

const BLOCK_SIZE: u64 = 4_096;

fn roundtrip_through_cache_and_prefetcher(compression: CompressionType) -> blob_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = blob_file_path(dir.path(), 1);

    let n = 100usize;
    let mut handles = Vec::with_capacity(n);

    let mut builder = BlobFileBuilder::new(&path, 1, compression)?;
    for i in 0..n {
        let key = i.to_string();
        let value = vec![i as u8; 1_024];
        handles.push(builder.add(key.as_bytes(), &value).unwrap());
        assert!(builder.ok());
    }
    let file_size = builder.finish()?;

    let cache = BlobFileCache::new(dir.path(), 8);
    let mut prefetcher = cache.new_prefetcher(1, file_size)?;

    for (i, handle) in handles.iter().enumerate() {
        let key = i.to_string();
        let value = vec![i as u8; 1_024];

        for _ in 0..2 {
            let record = cache.get(1, file_size, handle)?;
            assert_eq!(record.key, key.as_bytes());
            assert_eq!(record.value, &*value);
        }

        for _ in 0..2 {
            let record = prefetcher.get(handle)?;
            assert_eq!(record.key, key.as_bytes());
            assert_eq!(record.value, &*value);
        }
    }

    Ok(())
}

#[test]
fn blob_file_roundtrip() -> blob_store::Result<()> {
    roundtrip_through_cache_and_prefetcher(CompressionType::None)
}

#[cfg(feature = "lz4")]
#[test]
fn blob_file_roundtrip_lz4() -> blob_store::Result<()> {
    roundtrip_through_cache_and_prefetcher(CompressionType::Lz4)
}

#[cfg(feature = "zstd")]
#[test]
fn blob_file_roundtrip_zstd() -> blob_store::Result<()> {
    roundtrip_through_cache_and_prefetcher(CompressionType::Zstd)
}

#[test]
fn blob_file_4k_alignment() -> blob_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = blob_file_path(dir.path(), 1);

    let mut rng = rand::rngs::StdRng::seed_from_u64(301);

    let n = 1_000usize;
    let mut handles: Vec<BlobHandle> = Vec::with_capacity(n);

    let mut builder = BlobFileBuilder::new(&path, 1, CompressionType::None)?;

    for i in 0..n {
        let key = i.to_string();

        // Skewed length distribution, mostly small with rare large blobs
        let exponent = rng.random_range(0..=20u32);
        let skewed = rng.random_range(0..=(1u64 << exponent)) as usize;

        let value = vec![0xAB; 1_024 + skewed];

        handles.push(builder.add(key.as_bytes(), &value).unwrap());
        assert!(builder.ok());
    }

    builder.finish()?;

    assert_eq!(0, handles.first().unwrap().offset % BLOCK_SIZE);

    for handle in handles.iter().skip(1) {
        if handle.offset % BLOCK_SIZE != 0 {
            // A non-aligned record fits entirely inside the block its
            // offset lies in
            assert!(
                handle.offset + u64::from(handle.size)
                    <= (handle.offset / BLOCK_SIZE + 1) * BLOCK_SIZE,
                "record at {} with size {} crosses a block boundary",
                handle.offset,
                handle.size,
            );
        }
    }

    Ok(())
}
