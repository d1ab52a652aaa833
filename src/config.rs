// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::CompressionType;

/// Controls how a column family treats externalized values
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlobRunMode {
    /// Large values are externalized into blob files
    Normal,

    /// Existing blobs stay readable, but no new blobs are written
    ReadOnly,

    /// Blobs are being retired: reads are inlined back into the LSM
    /// during compaction, writes never externalize
    Fallback,
}

/// Blob storage configuration of a column family
///
/// Passed by value into each job; immutable while a job runs.
#[derive(Clone, Debug)]
pub struct BlobConfig {
    /// Minimum inline value length to externalize
    pub min_blob_size: usize,

    /// Target size of blob files; writers roll over to a new file
    /// upon crossing it
    pub blob_file_target_size: u64,

    /// Upper bound of input bytes per GC rewrite cycle
    pub max_gc_batch_size: u64,

    /// Lower bound of input bytes for a GC rewrite cycle to be worthwhile
    pub min_gc_batch_size: u64,

    /// Upper bound of input bytes per hole-punching cycle
    pub max_fs_batch_size: u64,

    /// Lower bound of input bytes for a hole-punching cycle to be worthwhile
    pub min_fs_batch_size: u64,

    /// Files whose live data is at most this size are rewritten
    /// unconditionally, merging small files
    pub merge_small_file_threshold: u64,

    /// Files with at least this many discardable bytes are hole-punched
    /// unconditionally
    pub free_space_threshold: u64,

    /// A sampled file is confirmed for GC iff its discardable portion is
    /// at least this ratio of its iterated size (0..1)
    pub blob_file_discardable_ratio: f64,

    /// Admit files below `free_space_threshold` as hole-punch sampling
    /// candidates, reclaiming space ahead of compaction feedback
    pub fast_reclaim_space_by_sample: bool,

    /// Compression codec for newly written blob files
    pub blob_file_compression: CompressionType,

    /// Mode the column family runs in
    pub blob_run_mode: BlobRunMode,

    /// Number of open blob file readers to cache
    pub blob_file_cache_size: usize,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            min_blob_size: 4_096,
            blob_file_target_size: 256 * 1_024 * 1_024,
            max_gc_batch_size: 1_024 * 1_024 * 1_024,
            min_gc_batch_size: 512 * 1_024 * 1_024,
            max_fs_batch_size: 1_024 * 1_024 * 1_024,
            min_fs_batch_size: 512 * 1_024 * 1_024,
            merge_small_file_threshold: 8 * 1_024 * 1_024,
            free_space_threshold: 512 * 1_024 * 1_024,
            blob_file_discardable_ratio: 0.5,
            fast_reclaim_space_by_sample: true,
            blob_file_compression: CompressionType::None,
            blob_run_mode: BlobRunMode::Normal,
            blob_file_cache_size: 512,
        }
    }
}

impl BlobConfig {
    /// Sets the minimum value length to externalize.
    #[must_use]
    pub fn min_blob_size(mut self, bytes: usize) -> Self {
        self.min_blob_size = bytes;
        self
    }

    /// Sets the target size of blob files.
    ///
    /// This influences space amplification, as space reclamation works
    /// on a per-file basis.
    ///
    /// Like `blob_file_size` in `RocksDB`.
    ///
    /// Default = 256 MiB
    #[must_use]
    pub fn blob_file_target_size(mut self, bytes: u64) -> Self {
        self.blob_file_target_size = bytes;
        self
    }

    /// Sets the per-cycle GC rewrite bounds.
    #[must_use]
    pub fn gc_batch_size(mut self, min: u64, max: u64) -> Self {
        self.min_gc_batch_size = min;
        self.max_gc_batch_size = max;
        self
    }

    /// Sets the per-cycle hole-punch bounds.
    #[must_use]
    pub fn fs_batch_size(mut self, min: u64, max: u64) -> Self {
        self.min_fs_batch_size = min;
        self.max_fs_batch_size = max;
        self
    }

    /// Sets the unconditional-admit threshold for merging small files.
    #[must_use]
    pub fn merge_small_file_threshold(mut self, bytes: u64) -> Self {
        self.merge_small_file_threshold = bytes;
        self
    }

    /// Sets the unconditional-admit threshold for hole punching.
    #[must_use]
    pub fn free_space_threshold(mut self, bytes: u64) -> Self {
        self.free_space_threshold = bytes;
        self
    }

    /// Sets the sampling acceptance ratio.
    ///
    /// # Panics
    ///
    /// Panics if the ratio is not within 0..=1.
    #[must_use]
    pub fn blob_file_discardable_ratio(mut self, ratio: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&ratio),
            "discardable ratio must be within 0..=1",
        );
        self.blob_file_discardable_ratio = ratio;
        self
    }

    /// Enables or disables the sampling path for hole-punch candidates.
    #[must_use]
    pub fn fast_reclaim_space_by_sample(mut self, enabled: bool) -> Self {
        self.fast_reclaim_space_by_sample = enabled;
        self
    }

    /// Sets the compression codec for newly written blob files.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.blob_file_compression = compression;
        self
    }

    /// Sets the mode the column family runs in.
    #[must_use]
    pub fn blob_run_mode(mut self, mode: BlobRunMode) -> Self {
        self.blob_run_mode = mode;
        self
    }
}
