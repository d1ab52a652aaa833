// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    reader::{BlobFilePrefetcher, BlobFileReader},
    BlobFileId,
};
use crate::{
    file::blob_file_path,
    format::{BlobHandle, BlobRecord},
};
use quick_cache::{
    sync::{Cache, DefaultLifecycle},
    UnitWeighter,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Caches open blob file readers, keyed by file number
///
/// Readers are shared through `Arc`, so an eviction (or explicit
/// [`BlobFileCache::evict`]) never closes a file underneath an
/// in-flight read.
pub struct BlobFileCache {
    folder: PathBuf,

    // NOTE: rustc_hash performed best: https://fjall-rs.github.io/post/fjall-2-1
    data: Cache<BlobFileId, Arc<BlobFileReader>, UnitWeighter, rustc_hash::FxBuildHasher>,
}

impl BlobFileCache {
    /// Creates a new cache holding up to `capacity` open readers.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(folder: P, capacity: usize) -> Self {
        #[allow(clippy::default_trait_access)]
        let data = Cache::with(
            capacity,
            capacity as u64,
            UnitWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            folder: folder.into(),
            data,
        }
    }

    /// Returns the folder the cached files live in.
    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Returns the number of cached readers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if there are no cached readers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn reader(
        &self,
        file_number: BlobFileId,
        file_size: u64,
    ) -> crate::Result<Arc<BlobFileReader>> {
        self.data.get_or_insert_with(&file_number, || {
            let path = blob_file_path(&self.folder, file_number);
            log::trace!("Opening blob file {} for reading", path.display());
            BlobFileReader::open(path, file_number, file_size).map(Arc::new)
        })
    }

    /// Reads a record, opening (or reusing) the file's reader.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the record is
    /// corrupt.
    pub fn get(
        &self,
        file_number: BlobFileId,
        file_size: u64,
        handle: &BlobHandle,
    ) -> crate::Result<BlobRecord> {
        self.reader(file_number, file_size)?.get(handle)
    }

    /// Creates a prefetcher that shares the cached reader.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn new_prefetcher(
        &self,
        file_number: BlobFileId,
        file_size: u64,
    ) -> crate::Result<BlobFilePrefetcher> {
        Ok(BlobFilePrefetcher::new(
            self.reader(file_number, file_size)?,
        ))
    }

    /// Drops the cached reader of a file, called when it becomes
    /// obsolete.
    pub fn evict(&self, file_number: BlobFileId) {
        let _ = self.data.remove(&file_number);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{blob_file::builder::BlobFileBuilder, CompressionType};
    use test_log::test;

    #[test]
    fn blob_file_cache_reuses_reader() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = blob_file_path(dir.path(), 1);

        let mut builder = BlobFileBuilder::new(&path, 1, CompressionType::None)?;
        let handle = builder.add(b"a", b"hello").unwrap();
        let file_size = builder.finish()?;

        let cache = BlobFileCache::new(dir.path(), 8);

        assert_eq!(
            cache.get(1, file_size, &handle)?.value,
            b"hello".as_slice()
        );
        assert_eq!(1, cache.len());

        assert_eq!(
            cache.get(1, file_size, &handle)?.value,
            b"hello".as_slice()
        );
        assert_eq!(1, cache.len());

        cache.evict(1);
        assert!(cache.is_empty());

        Ok(())
    }
}
