// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    blob_file::{builder::BlobFileBuilder, cache::BlobFileCache, meta::BlobFileMeta, BlobFileId},
    file::{blob_file_path, fsync_directory, parse_blob_file_name, MANIFEST_FILE},
    lsm::ColumnFamilyId,
    manifest::{Manifest, ManifestEdit},
    BlobConfig, HashMap, SeqNo, SequenceNumberCounter,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use crate::BlobStorage;

/// A reserved, not yet published blob file
#[derive(Clone, Debug)]
pub struct BlobFileHandle {
    number: BlobFileId,
    path: PathBuf,
}

impl BlobFileHandle {
    /// Returns the file number.
    #[must_use]
    pub fn number(&self) -> BlobFileId {
        self.number
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Hands out file numbers, publishes finished blob files through the
/// manifest and owns the per-column-family inventories
///
/// A new blob file is visible to readers only after its manifest edit
/// has been synced, so no reader can observe an index entry pointing
/// into an unpublished file.
pub struct BlobFileManager {
    folder: PathBuf,
    config: BlobConfig,

    file_cache: Arc<BlobFileCache>,
    next_file_number: SequenceNumberCounter,
    manifest: Manifest,

    storages: RwLock<HashMap<ColumnFamilyId, Arc<BlobStorage>>>,
}

impl BlobFileManager {
    /// Opens (or creates) the blob area in the given folder, recovering
    /// all column family inventories from the manifest.
    ///
    /// Files on disk that no manifest edit accounts for are unfinished
    /// leftovers from a crash and are deleted.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open<P: Into<PathBuf>>(folder: P, config: BlobConfig) -> crate::Result<Arc<Self>> {
        let folder: PathBuf = folder.into();
        std::fs::create_dir_all(&folder)?;

        let (manifest, edits) = Manifest::open(folder.join(MANIFEST_FILE))?;

        // Replay
        let mut live: HashMap<ColumnFamilyId, HashMap<BlobFileId, u64>> = HashMap::default();
        let mut obsolete: HashMap<ColumnFamilyId, Vec<(BlobFileId, SeqNo)>> = HashMap::default();
        let mut max_file_number = 0;

        for edit in edits {
            match edit {
                ManifestEdit::AddFile {
                    cf_id,
                    file_number,
                    file_size,
                } => {
                    live.entry(cf_id).or_default().insert(file_number, file_size);
                    max_file_number = max_file_number.max(file_number);
                }
                ManifestEdit::DeleteFile {
                    cf_id,
                    file_number,
                    obsolete_seq,
                } => {
                    live.entry(cf_id).or_default().remove(&file_number);
                    obsolete
                        .entry(cf_id)
                        .or_default()
                        .push((file_number, obsolete_seq));
                    max_file_number = max_file_number.max(file_number);
                }
            }
        }

        let file_cache = Arc::new(BlobFileCache::new(
            &folder,
            config.blob_file_cache_size,
        ));

        let mut storages = HashMap::default();

        for (cf_id, files) in live {
            let storage = Arc::new(BlobStorage::new(
                cf_id,
                &folder,
                config.clone(),
                file_cache.clone(),
            ));

            for (file_number, file_size) in files {
                storage.add_blob_file(Arc::new(BlobFileMeta::new(file_number, file_size)));
            }

            // Every recovered file becomes Normal and is marked for a
            // sample pass, compaction feedback being lost on restart
            storage.mark_all_files_for_gc();

            for (file_number, obsolete_seq) in obsolete.remove(&cf_id).unwrap_or_default() {
                storage.requeue_obsolete(file_number, obsolete_seq);
            }

            storage.compute_gc_score();

            storages.insert(cf_id, storage);
        }

        let manager = Self {
            folder,
            config,
            file_cache,
            next_file_number: SequenceNumberCounter::new(max_file_number + 1),
            manifest,
            storages: RwLock::new(storages),
        };

        manager.remove_unaccounted_files()?;

        Ok(Arc::new(manager))
    }

    /// Deletes blob files no manifest edit accounts for.
    fn remove_unaccounted_files(&self) -> crate::Result<()> {
        let storages = self.storages.read().expect("lock is poisoned");

        for dirent in std::fs::read_dir(&self.folder)? {
            let dirent = dirent?;
            let file_name = dirent.file_name();

            let Some(file_number) = file_name.to_str().and_then(parse_blob_file_name) else {
                continue;
            };

            let known = storages
                .values()
                .any(|storage| storage.knows_file(file_number));

            if !known {
                log::debug!("Deleting unfinished blob file {}", dirent.path().display());
                std::fs::remove_file(dirent.path())?;
            }
        }

        Ok(())
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

    /// Returns the shared open-file cache.
    #[must_use]
    pub fn file_cache(&self) -> &Arc<BlobFileCache> {
        &self.file_cache
    }

    /// Returns the blob storage of a column family, creating it if it
    /// does not exist yet.
    #[must_use]
    pub fn column_family(&self, cf_id: ColumnFamilyId) -> Arc<BlobStorage> {
        let mut storages = self.storages.write().expect("lock is poisoned");

        storages
            .entry(cf_id)
            .or_insert_with(|| {
                Arc::new(BlobStorage::new(
                    cf_id,
                    &self.folder,
                    self.config.clone(),
                    self.file_cache.clone(),
                ))
            })
            .clone()
    }

    /// Returns the blob storage of a column family, if it exists.
    #[must_use]
    pub fn storage(&self, cf_id: ColumnFamilyId) -> Option<Arc<BlobStorage>> {
        self.storages
            .read()
            .expect("lock is poisoned")
            .get(&cf_id)
            .cloned()
    }

    /// Marks a column family as dropped.
    ///
    /// The in-memory inventory is retained until all of its obsolete
    /// files are physically removed.
    pub fn drop_column_family(&self, cf_id: ColumnFamilyId) {
        let mut storages = self.storages.write().expect("lock is poisoned");

        if let Some(storage) = storages.get(&cf_id) {
            storage.mark_destroyed();

            if storage.maybe_remove() {
                storages.remove(&cf_id);
            }
        }
    }

    /// Reserves the next blob file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn new_file(&self) -> crate::Result<BlobFileHandle> {
        let number = self.next_file_number.next();

        Ok(BlobFileHandle {
            number,
            path: blob_file_path(&self.folder, number),
        })
    }

    /// Reserves the next blob file and opens a builder for it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn new_file_builder(&self) -> crate::Result<(BlobFileHandle, BlobFileBuilder)> {
        let handle = self.new_file()?;

        let builder = BlobFileBuilder::new(
            handle.path(),
            handle.number(),
            self.config.blob_file_compression,
        )?;

        Ok((handle, builder))
    }

    /// Publishes a finished blob file: persists its manifest edit, then
    /// installs it into the column family's inventory.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn finish_file(
        &self,
        cf_id: ColumnFamilyId,
        file: Arc<BlobFileMeta>,
    ) -> crate::Result<()> {
        self.batch_finish_files(cf_id, vec![file])
    }

    /// Publishes a batch of finished blob files atomically.
    ///
    /// The manifest edits are synced before any file becomes visible.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn batch_finish_files(
        &self,
        cf_id: ColumnFamilyId,
        files: Vec<Arc<BlobFileMeta>>,
    ) -> crate::Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let edits = files
            .iter()
            .map(|file| ManifestEdit::AddFile {
                cf_id,
                file_number: file.file_number(),
                file_size: file.file_size(),
            })
            .collect::<Vec<_>>();

        self.manifest.log_edits(&edits)?;

        let storage = self.column_family(cf_id);
        for file in files {
            storage.add_blob_file(file);
        }
        storage.compute_gc_score();

        Ok(())
    }

    /// Physically deletes a half-built file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn delete_file(&self, handle: &BlobFileHandle) -> crate::Result<()> {
        match std::fs::remove_file(handle.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Physically deletes a batch of half-built files.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn batch_delete_files(&self, handles: &[BlobFileHandle]) -> crate::Result<()> {
        for handle in handles {
            self.delete_file(handle)?;
        }
        Ok(())
    }

    /// Records that the given files are unreferenced as of
    /// `obsolete_seq`: persists the manifest edits, then moves the files
    /// onto the obsolete queue.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn retire_files(
        &self,
        cf_id: ColumnFamilyId,
        files: &[Arc<BlobFileMeta>],
        obsolete_seq: SeqNo,
    ) -> crate::Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let edits = files
            .iter()
            .map(|file| ManifestEdit::DeleteFile {
                cf_id,
                file_number: file.file_number(),
                obsolete_seq,
            })
            .collect::<Vec<_>>();

        self.manifest.log_edits(&edits)?;

        let storage = self.column_family(cf_id);
        for file in files {
            storage.mark_file_obsolete(file, obsolete_seq);
        }
        storage.compute_gc_score();

        Ok(())
    }

    /// Physically deletes all obsolete files no live snapshot can still
    /// resolve, returning their paths.
    ///
    /// Files whose physical deletion already happened before a crash
    /// are skipped silently.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn purge_obsolete_files(&self, oldest_seq: SeqNo) -> crate::Result<Vec<PathBuf>> {
        let storages = self
            .storages
            .read()
            .expect("lock is poisoned")
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut purged = vec![];

        for storage in storages {
            for path in storage.get_obsolete_files(oldest_seq) {
                match std::fs::remove_file(&path) {
                    Ok(()) => purged.push(path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        log::debug!("Obsolete blob file {} already gone", path.display());
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if storage.maybe_remove() {
                self.storages
                    .write()
                    .expect("lock is poisoned")
                    .remove(&storage.cf_id());
            }
        }

        if !purged.is_empty() {
            fsync_directory(&self.folder)?;
            log::debug!("Purged {} obsolete blob file(s)", purged.len());
        }

        Ok(purged)
    }
}
