// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    blob_file::{
        cache::BlobFileCache,
        meta::{BlobFileMeta, FileEvent},
        reader::BlobFilePrefetcher,
        BlobFileId,
    },
    file::blob_file_path,
    format::{BlobIndex, BlobRecord},
    gc::GcScore,
    lsm::ColumnFamilyId,
    BlobConfig, HashMap, SeqNo,
};
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

pub(crate) struct StorageInner {
    /// Live blob files; the inventory owns the strong refs
    pub(crate) files: HashMap<BlobFileId, Arc<BlobFileMeta>>,

    /// Scored files, sorted by GC score descending
    pub(crate) gc_score: Vec<GcScore>,

    /// Unreferenced files, gated on the LSM's snapshot watermark
    /// before physical deletion
    obsolete_files: VecDeque<(BlobFileId, SeqNo)>,

    /// Set when the column family is dropped; the structure is retained
    /// until all obsolete files are physically removed
    destroyed: bool,
}

/// The authoritative blob file inventory of one column family
///
/// Thread-safe; its mutex is only held for short, in-memory work, never
/// across file IO or LSM calls.
pub struct BlobStorage {
    cf_id: ColumnFamilyId,
    folder: PathBuf,
    config: BlobConfig,
    file_cache: Arc<BlobFileCache>,

    inner: Mutex<StorageInner>,
}

impl BlobStorage {
    /// Creates an empty inventory.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(
        cf_id: ColumnFamilyId,
        folder: P,
        config: BlobConfig,
        file_cache: Arc<BlobFileCache>,
    ) -> Self {
        Self {
            cf_id,
            folder: folder.into(),
            config,
            file_cache,
            inner: Mutex::new(StorageInner {
                files: HashMap::default(),
                gc_score: Vec::new(),
                obsolete_files: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    /// Returns the column family id.
    #[must_use]
    pub fn cf_id(&self) -> ColumnFamilyId {
        self.cf_id
    }

    /// Returns the folder the blob files live in.
    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut StorageInner) -> R) -> R {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        f(&mut inner)
    }

    /// Returns the number of live blob files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.with_inner(|inner| inner.files.len())
    }

    /// Inserts a file into the inventory.
    pub fn add_blob_file(&self, file: Arc<BlobFileMeta>) {
        log::debug!(
            "Adding blob file {} ({}B) to column family {}",
            file.file_number(),
            file.file_size(),
            self.cf_id,
        );

        self.with_inner(|inner| {
            inner.files.insert(file.file_number(), file);
        });
    }

    /// Finds the metadata of the given file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlobFileNotFound`](crate::Error::BlobFileNotFound)
    /// if the file is not in the inventory; on the normal read path that
    /// is a corruption.
    pub fn find_file(&self, file_number: BlobFileId) -> crate::Result<Arc<BlobFileMeta>> {
        self.with_inner(|inner| inner.files.get(&file_number).cloned())
            .ok_or(crate::Error::BlobFileNotFound(file_number))
    }

    /// Reads the record a blob index points to.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the index points
    /// at a missing file or corrupt record.
    pub fn get(&self, index: &BlobIndex) -> crate::Result<BlobRecord> {
        let file = self.find_file(index.file_number)?;

        self.file_cache
            .get(index.file_number, file.file_size(), &index.handle)
    }

    /// Creates a prefetcher for the given file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the file is not in
    /// the inventory.
    pub fn new_prefetcher(&self, file_number: BlobFileId) -> crate::Result<BlobFilePrefetcher> {
        let file = self.find_file(file_number)?;

        self.file_cache
            .new_prefetcher(file_number, file.file_size())
    }

    /// Removes a file from the live inventory and queues it for
    /// physical deletion once the snapshot watermark passes
    /// `obsolete_seq`.
    pub fn mark_file_obsolete(&self, file: &Arc<BlobFileMeta>, obsolete_seq: SeqNo) {
        file.transit(FileEvent::Delete);

        self.with_inner(|inner| {
            inner.files.remove(&file.file_number());
            inner
                .obsolete_files
                .push_back((file.file_number(), obsolete_seq));
        });

        log::debug!(
            "Blob file {} is obsolete at seqno {obsolete_seq}",
            file.file_number(),
        );
    }

    /// Drains the files whose obsolete sequence is at or below the
    /// oldest live snapshot, returning their paths for physical
    /// deletion.
    pub fn get_obsolete_files(&self, oldest_seq: SeqNo) -> Vec<PathBuf> {
        let drained = self.with_inner(|inner| {
            let mut drained = vec![];

            inner.obsolete_files.retain(|&(file_number, seq)| {
                if seq <= oldest_seq {
                    drained.push(file_number);
                    false
                } else {
                    true
                }
            });

            drained
        });

        drained
            .into_iter()
            .map(|file_number| {
                self.file_cache.evict(file_number);
                blob_file_path(&self.folder, file_number)
            })
            .collect()
    }

    /// Requeues an obsolete file during manifest replay.
    pub(crate) fn requeue_obsolete(&self, file_number: BlobFileId, obsolete_seq: SeqNo) {
        self.with_inner(|inner| {
            inner.obsolete_files.push_back((file_number, obsolete_seq));
        });
    }

    /// Returns `true` if the file is live or awaiting physical deletion.
    pub(crate) fn knows_file(&self, file_number: BlobFileId) -> bool {
        self.with_inner(|inner| {
            inner.files.contains_key(&file_number)
                || inner.obsolete_files.iter().any(|&(n, _)| n == file_number)
        })
    }

    /// Rebuilds the scored file list.
    pub fn compute_gc_score(&self) {
        self.with_inner(|inner| {
            let mut scores = inner
                .files
                .values()
                .map(|file| {
                    #[allow(clippy::cast_precision_loss)]
                    let ratio = if file.file_size() == 0 {
                        0.0
                    } else {
                        file.discardable_size() as f64 / file.file_size() as f64
                    };

                    GcScore {
                        file_number: file.file_number(),
                        // Merging small files is always worthwhile
                        gc_score: if file.file_size() < self.config.merge_small_file_threshold {
                            1.0
                        } else {
                            ratio
                        },
                        fs_score: ratio,
                    }
                })
                .collect::<Vec<_>>();

            scores.sort_by(|a, b| {
                b.gc_score
                    .partial_cmp(&a.gc_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.file_number.cmp(&b.file_number))
            });

            inner.gc_score = scores;
        });
    }

    /// Returns the scored file list of the last
    /// [`BlobStorage::compute_gc_score`].
    #[must_use]
    pub fn gc_scores(&self) -> Vec<GcScore> {
        self.with_inner(|inner| inner.gc_score.clone())
    }

    /// Marks every file for a GC sample pass; used on DB restart and
    /// configuration changes.
    pub fn mark_all_files_for_gc(&self) {
        self.with_inner(|inner| {
            for file in inner.files.values() {
                file.set_gc_mark(true);
                file.transit(FileEvent::DbRestart);
            }
        });
    }

    /// Marks the column family as dropped.
    ///
    /// Physical files may still be kept for live snapshots.
    pub fn mark_destroyed(&self) {
        self.with_inner(|inner| {
            inner.destroyed = true;
        });
    }

    /// Returns `true` if the column family was dropped and no obsolete
    /// files are left, so the in-memory structure can be removed.
    #[must_use]
    pub fn maybe_remove(&self) -> bool {
        self.with_inner(|inner| inner.destroyed && inner.obsolete_files.is_empty())
    }
}

impl Drop for BlobStorage {
    fn drop(&mut self) {
        self.with_inner(|inner| {
            for file_number in inner.files.keys() {
                self.file_cache.evict(*file_number);
            }
        });
    }
}
