// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    blob_file::{
        builder::BlobFileBuilder,
        meta::{BlobFileMeta, FileEvent},
    },
    coding::{Decode, Encode},
    file_manager::{BlobFileHandle, BlobFileManager},
    format::{BlobIndex, BLOB_FILE_BLOCK_SIZE},
    lsm::{ColumnFamilyId, LsmValue},
    BlobRunMode, BlobStorage, Error, UserKey, UserValue,
};
use std::sync::Arc;

/// The LSM-side table builder being wrapped; receives whatever the
/// compaction decides to keep in the LSM itself
pub trait TableSink {
    /// Adds an entry to the table.
    fn add(&mut self, key: &UserKey, value: &LsmValue);

    /// Finalizes the table.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    fn finish(&mut self) -> crate::Result<()>;

    /// Throws the table away.
    fn abandon(&mut self);
}

/// Sits on the compaction output path and diverts large values into a
/// blob file, leaving an index entry in the table instead
///
/// In fallback mode the opposite happens: externalized values are read
/// back and inlined, retiring the blob area over time.
pub struct BlobTableBuilder<B: TableSink> {
    base: B,

    cf_id: ColumnFamilyId,
    storage: Arc<BlobStorage>,
    file_manager: Arc<BlobFileManager>,

    blob_handle: Option<BlobFileHandle>,
    blob_builder: Option<BlobFileBuilder>,

    err: Option<Error>,
}

impl<B: TableSink> BlobTableBuilder<B> {
    /// Wraps a table builder for one compaction output.
    #[must_use]
    pub fn new(
        base: B,
        storage: Arc<BlobStorage>,
        file_manager: Arc<BlobFileManager>,
    ) -> Self {
        Self {
            base,
            cf_id: storage.cf_id(),
            storage,
            file_manager,
            blob_handle: None,
            blob_builder: None,
            err: None,
        }
    }

    /// Returns `true` if no failure occurred so far.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.err.is_none() && self.blob_builder.as_ref().is_none_or(BlobFileBuilder::ok)
    }

    /// Adds an entry the compaction would emit, possibly diverting or
    /// inlining its value.
    pub fn add(&mut self, key: &UserKey, value: &LsmValue) {
        if !self.ok() {
            return;
        }

        let config = self.storage.config();

        match value {
            LsmValue::BlobIndex(raw) if config.blob_run_mode == BlobRunMode::Fallback => {
                // Ingest the value back from the blob file
                let index = match BlobIndex::from_slice(raw) {
                    Ok(index) => index,
                    Err(e) => {
                        self.err = Some(e.into());
                        return;
                    }
                };

                match self.storage.get(&index) {
                    Ok(record) => {
                        self.base.add(key, &LsmValue::Inline(record.value));
                    }
                    Err(e) => {
                        // The blob may have been GC-deleted; keep the
                        // indirection rather than lose the entry
                        log::warn!(
                            "Failed to inline blob {:?} during fallback, passing index through: {e:?}",
                            index,
                        );
                        self.base.add(key, value);
                    }
                }
            }

            LsmValue::Inline(inline)
                if config.blob_run_mode == BlobRunMode::Normal
                    && inline.len() >= config.min_blob_size =>
            {
                if let Some(index_entry) = self.add_blob(key, inline) {
                    self.base.add(key, &LsmValue::BlobIndex(index_entry));
                }
            }

            _ => self.base.add(key, value),
        }
    }

    /// Writes a value into the (lazily created) blob file and returns
    /// the encoded index entry.
    fn add_blob(&mut self, key: &UserKey, value: &UserValue) -> Option<UserValue> {
        if self.blob_builder.is_none() {
            let (handle, builder) = match self.file_manager.new_file_builder() {
                Ok(pair) => pair,
                Err(e) => {
                    self.err = Some(e);
                    return None;
                }
            };

            log::info!(
                "Table builder created new blob file {} for column family {}",
                handle.number(),
                self.cf_id,
            );

            self.blob_handle = Some(handle);
            self.blob_builder = Some(builder);
        }

        let builder = self.blob_builder.as_mut()?;
        let handle = builder.add(key, value)?;

        let index = BlobIndex {
            file_number: builder.file_number(),
            handle,
        };

        Some(index.encode_into_vec().into())
    }

    /// Finalizes the table and publishes the blob file, if one was
    /// written.
    ///
    /// # Errors
    ///
    /// Surfaces the first sticky error, the base builder's failure, or
    /// any error while publishing.
    pub fn finish(mut self) -> crate::Result<()> {
        if let Err(e) = self.base.finish() {
            if self.err.is_none() {
                self.err = Some(e);
            }
        }

        let Some(builder) = self.blob_builder.take() else {
            return self.take_err();
        };

        #[allow(clippy::expect_used)]
        let handle = self
            .blob_handle
            .take()
            .expect("handle exists when builder does");

        if self.err.is_none() && builder.ok() {
            let file_number = handle.number();

            let file_size = match builder.finish() {
                Ok(file_size) => file_size,
                Err(e) => {
                    self.file_manager.delete_file(&handle)?;
                    return Err(e);
                }
            };

            let file = Arc::new(BlobFileMeta::new(file_number, file_size));

            // Account the footer rounding up to the next block
            file.set_real_file_size(
                (file_size - 1) / BLOB_FILE_BLOCK_SIZE * BLOB_FILE_BLOCK_SIZE
                    + BLOB_FILE_BLOCK_SIZE,
            );

            file.transit(FileEvent::FlushOrCompactionOutput);

            log::info!("Table builder finished blob file {file_number}");

            self.file_manager.finish_file(self.cf_id, file)?;

            Ok(())
        } else {
            log::warn!(
                "Table builder failed, deleting blob file {}",
                handle.number(),
            );

            // Surface the original cause, not the cleanup result
            let result = self.take_err();
            let builder_err = builder.finish().err();

            self.file_manager.delete_file(&handle)?;

            result.and(match builder_err {
                Some(e) => Err(e),
                None => Ok(()),
            })
        }
    }

    /// Throws the compaction output away, deleting the tentative blob
    /// file.
    pub fn abandon(&mut self) {
        self.base.abandon();

        if let Some(handle) = self.blob_handle.take() {
            log::info!(
                "Table builder abandoned, deleting blob file {}",
                handle.number(),
            );

            // Close the writer before unlinking
            self.blob_builder = None;

            if let Err(e) = self.file_manager.delete_file(&handle) {
                log::error!("Failed to delete abandoned blob file: {e:?}");
            }
        }
    }

    fn take_err(&mut self) -> crate::Result<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
