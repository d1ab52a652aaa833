// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{dig_hole::DigHoleJob, BlobGc};
use crate::{
    blob_file::{
        builder::BlobFileBuilder, iterator::BlobFileIterator, merge::BlobFileMergeIterator,
        meta::BlobFileMeta,
    },
    coding::{Decode, Encode},
    file::blob_file_path,
    file_manager::{BlobFileHandle, BlobFileManager},
    format::BlobIndex,
    lsm::{ColumnFamilyHandle, LsmEngine, LsmValue, WriteBatch, WriteCallback},
    Error, StopSignal, UserKey,
};
use std::{collections::BTreeSet, sync::Arc};

/// Counters accumulated by one GC job
///
/// Best-effort accounting; reported through the log when the job ends
/// and never the cause of a failure.
#[derive(Debug, Default)]
pub struct GcMetrics {
    /// Bytes read from blob files and the LSM
    pub bytes_read: u64,

    /// Bytes written to new blob files and the LSM
    pub bytes_written: u64,

    /// Records dropped because the LSM has moved on
    pub keys_overwritten: u64,

    /// Bytes dropped because the LSM has moved on
    pub bytes_overwritten: u64,

    /// Records whose index entries now point into an output file
    pub keys_relocated: u64,

    /// Bytes whose index entries now point into an output file
    pub bytes_relocated: u64,

    /// Output files written
    pub new_files: u64,

    /// Input files retired
    pub retired_files: u64,
}

/// Write callback for garbage collection, checking that a key has not
/// been updated between the GC read and the rewrite
///
/// Similar to how optimistic transactions work: it re-reads the index
/// entry inside the engine's write path and admits the write iff the
/// entry still equals the index captured during the GC scan.
struct RewriteCallback {
    cf: Arc<dyn ColumnFamilyHandle>,
    key: UserKey,
    old_index: BlobIndex,
    read_bytes: u64,
}

impl WriteCallback for RewriteCallback {
    fn check(&mut self, db: &dyn LsmEngine) -> crate::Result<()> {
        let Some(entry) = db.get(self.cf.as_ref(), &self.key)? else {
            // Either deleted, or updated with a newer version that got
            // compacted away already
            return Err(Error::Busy("key deleted"));
        };

        self.read_bytes = (self.key.len() + entry.raw().len()) as u64;

        let LsmValue::BlobIndex(raw) = entry else {
            return Err(Error::Busy("key overwritten with inline value"));
        };

        let current = BlobIndex::from_slice(&raw)?;

        if current != self.old_index {
            return Err(Error::Busy("key overwritten with other blob"));
        }

        Ok(())
    }
}

fn discard_entry(
    db: &dyn LsmEngine,
    cf: &dyn ColumnFamilyHandle,
    key: &[u8],
    index: &BlobIndex,
    read_bytes: &mut u64,
) -> crate::Result<bool> {
    let entry = db.get(cf, key)?;

    *read_bytes += (key.len() + entry.as_ref().map_or(0, |e| e.raw().len())) as u64;

    // Missing or inlined means a newer version superseded the blob
    let Some(LsmValue::BlobIndex(raw)) = entry else {
        return Ok(true);
    };

    let current = BlobIndex::from_slice(&raw)?;

    Ok(current != *index)
}

/// One garbage collection cycle over a column family
///
/// Runs the five phases in order: sample candidates, rewrite live
/// records into fresh files, install the outputs, rewrite the index
/// entries behind an optimistic callback, and retire the inputs.
/// Hole-punch candidates are processed in place along the way.
///
/// [`BlobGcJob::run`] does the heavy, mutex-free work;
/// [`BlobGcJob::finish`] performs the manifest and LSM commits. If
/// `run` fails, call [`BlobGcJob::abandon`] to clean up staged outputs.
#[allow(clippy::module_name_repetitions)]
pub struct BlobGcJob<'a> {
    blob_gc: BlobGc,
    db: &'a dyn LsmEngine,
    cf: Arc<dyn ColumnFamilyHandle>,
    file_manager: Arc<BlobFileManager>,
    shutting_down: StopSignal,

    metrics: GcMetrics,

    /// Staged output files; the last one is the active writer
    outputs: Vec<(BlobFileHandle, BlobFileBuilder)>,

    rewrite_batches: Vec<(WriteBatch, RewriteCallback)>,
}

impl<'a> BlobGcJob<'a> {
    /// Creates a job for a picked GC cycle.
    #[must_use]
    pub fn new(
        blob_gc: BlobGc,
        db: &'a dyn LsmEngine,
        cf: Arc<dyn ColumnFamilyHandle>,
        file_manager: Arc<BlobFileManager>,
        shutting_down: StopSignal,
    ) -> Self {
        Self {
            blob_gc,
            db,
            cf,
            file_manager,
            shutting_down,
            metrics: GcMetrics::default(),
            outputs: Vec::new(),
            rewrite_batches: Vec::new(),
        }
    }

    /// Returns the GC cycle descriptor.
    #[must_use]
    pub fn blob_gc(&self) -> &BlobGc {
        &self.blob_gc
    }

    /// Returns the counters accumulated so far.
    #[must_use]
    pub fn metrics(&self) -> &GcMetrics {
        &self.metrics
    }

    /// Runs sampling, the rewrite loop and hole punching.
    ///
    /// # Errors
    ///
    /// Will return `Err` on IO errors, corruption, or shutdown. Call
    /// [`BlobGcJob::abandon`] afterwards in that case.
    pub fn run(&mut self) -> crate::Result<()> {
        self.sample_candidate_files()?;

        if !self.blob_gc.gc_sampled_inputs().is_empty() {
            self.rewrite_records()?;
        }

        if !self.blob_gc.fs_sampled_inputs().is_empty() {
            self.dig_hole()?;
        }

        Ok(())
    }

    /// Phase 1: intersect the picked candidates with what sampling
    /// confirms.
    fn sample_candidate_files(&mut self) -> crate::Result<()> {
        let config = self.blob_gc.config().clone();

        let mut gc_sampled = vec![];
        let mut gc_selected = BTreeSet::new();

        for file in self.blob_gc.gc_inputs().to_vec() {
            if self.shutting_down.is_stopped() {
                return Err(Error::ShutdownInProgress);
            }

            let selected = if file.valid_size() <= config.merge_small_file_threshold {
                true
            } else {
                // Marked files carry stale counters, so ask the LSM
                self.sample_file(&file, config.blob_file_discardable_ratio)?
            };

            if selected {
                log::info!("Selected blob file {} for GC", file.file_number());
                gc_selected.insert(file.file_number());
                gc_sampled.push(file);
            }
        }

        let mut fs_sampled = vec![];

        for file in self.blob_gc.fs_inputs().to_vec() {
            // Files picked for rewriting, and marked files whose
            // counters cannot be trusted, are not hole-punched
            if gc_selected.contains(&file.file_number()) || file.gc_mark() {
                continue;
            }

            if self.shutting_down.is_stopped() {
                return Err(Error::ShutdownInProgress);
            }

            let selected = if file.discardable_size() >= config.free_space_threshold {
                true
            } else if config.fast_reclaim_space_by_sample {
                // Compaction feedback lags behind; sampling sees the
                // up-to-date picture and reclaims space sooner
                self.sample_file(&file, config.blob_file_discardable_ratio)?
            } else {
                false
            };

            if selected {
                log::info!(
                    "Selected blob file {} for hole punching",
                    file.file_number(),
                );
                fs_sampled.push(file);
            }
        }

        self.blob_gc.set_gc_sampled_inputs(gc_sampled);
        self.blob_gc.set_fs_sampled_inputs(fs_sampled);

        Ok(())
    }

    /// Scans a file once, asking the LSM about each record.
    fn sample_file(
        &mut self,
        file: &Arc<BlobFileMeta>,
        discardable_ratio: f64,
    ) -> crate::Result<bool> {
        let path = blob_file_path(self.file_manager.folder(), file.file_number());
        let iter = BlobFileIterator::new(path, file.file_number(), file.file_size())?;

        let mut iterated_size: u64 = 0;
        let mut discardable_size: u64 = 0;

        for entry in iter {
            let entry = entry?;
            let record_size = u64::from(entry.index.handle.size);

            iterated_size += record_size;

            if discard_entry(
                self.db,
                self.cf.as_ref(),
                &entry.key,
                &entry.index,
                &mut self.metrics.bytes_read,
            )? {
                discardable_size += record_size;
            }
        }

        self.metrics.bytes_read += iterated_size;

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let threshold = (iterated_size as f64 * discardable_ratio).ceil() as u64;

        Ok(discardable_size >= threshold)
    }

    /// Phase 2: merge-read the confirmed inputs and stage rewrites of
    /// all still-live records.
    fn rewrite_records(&mut self) -> crate::Result<()> {
        let config = self.blob_gc.config().clone();

        let mut merge = self.build_merge_iterator()?;

        // We obtain each record's index entry at the current latest
        // sequence and re-check it in the write callback. If the key was
        // updated in between, the callback reports Busy and the old blob
        // is simply dropped.
        let mut last_key: Option<UserKey> = None;
        let mut last_key_kept = false;

        while let Some(entry) = merge.next() {
            if self.shutting_down.is_stopped() {
                return Err(Error::ShutdownInProgress);
            }

            let entry = entry?;
            let record_size = u64::from(entry.index.handle.size);
            self.metrics.bytes_read += record_size;

            if last_key.as_ref() == Some(&entry.key) {
                if last_key_kept {
                    // Older version of a key we already rewrote
                    continue;
                }
            } else {
                last_key = Some(entry.key.clone());
                last_key_kept = false;
            }

            if discard_entry(
                self.db,
                self.cf.as_ref(),
                &entry.key,
                &entry.index,
                &mut self.metrics.bytes_read,
            )? {
                self.metrics.keys_overwritten += 1;
                self.metrics.bytes_overwritten += record_size;
                continue;
            }

            last_key_kept = true;

            // Roll over the output when it crosses the target size
            let needs_rollover = self
                .outputs
                .last()
                .map_or(true, |(_, builder)| {
                    builder.file_size() >= config.blob_file_target_size
                });

            if needs_rollover {
                let (handle, builder) = self.file_manager.new_file_builder()?;
                log::info!("New GC output blob file {}", handle.number());
                self.outputs.push((handle, builder));
            }

            #[allow(clippy::expect_used)]
            let (handle, builder) = self.outputs.last_mut().expect("writer was just created");
            let output_file_number = handle.number();

            self.metrics.bytes_written += (entry.key.len() + entry.value.len()) as u64;

            let Some(new_handle) = builder.add(&entry.key, &entry.value) else {
                // Sticky failure; installing the outputs surfaces the
                // cause and deletes the half-built files
                break;
            };

            let new_index = BlobIndex {
                file_number: output_file_number,
                handle: new_handle,
            };

            let mut batch = WriteBatch::default();
            batch.put_blob_index(entry.key.clone(), new_index.encode_into_vec().into());

            self.rewrite_batches.push((
                batch,
                RewriteCallback {
                    cf: self.cf.clone(),
                    key: entry.key,
                    old_index: entry.index,
                    read_bytes: 0,
                },
            ));
        }

        Ok(())
    }

    fn build_merge_iterator(&self) -> crate::Result<BlobFileMergeIterator> {
        let mut list = vec![];

        for file in self.blob_gc.gc_sampled_inputs() {
            let path = blob_file_path(self.file_manager.folder(), file.file_number());
            list.push(BlobFileIterator::new(
                path,
                file.file_number(),
                file.file_size(),
            )?);
        }

        Ok(BlobFileMergeIterator::new(list))
    }

    fn dig_hole(&mut self) -> crate::Result<()> {
        let inputs = self.blob_gc.fs_sampled_inputs().to_vec();

        let db = self.db;
        let cf = self.cf.clone();
        let mut read_bytes: u64 = 0;

        let job = DigHoleJob::new(self.file_manager.folder(), &self.shutting_down);

        let result = job.exec(&inputs, &mut |key, index| {
            discard_entry(db, cf.as_ref(), key, index, &mut read_bytes)
        });

        self.metrics.bytes_read += read_bytes;

        result
    }

    /// Phases 3 to 5: install the outputs, rewrite the index entries,
    /// retire the inputs, and release all files from the cycle.
    ///
    /// # Errors
    ///
    /// Will return `Err` if installing, rewriting or retiring fails;
    /// staged outputs are deleted in that case.
    pub fn finish(&mut self) -> crate::Result<()> {
        let mut result = self.install_output_blob_files();

        if result.is_ok() {
            result = self.rewrite_valid_keys_to_lsm();

            if let Err(e) = &result {
                log::error!(
                    "[{}] GC job failed to rewrite keys to LSM: {e:?}",
                    self.cf.name(),
                );
            }
        }

        if result.is_ok() && !self.cf.is_dropped() {
            result = self.retire_input_blob_files();
        }

        self.blob_gc.release_files();
        self.report_metrics();

        result
    }

    /// Cleans up after a failed [`BlobGcJob::run`], deleting staged
    /// output files and releasing all selected inputs.
    pub fn abandon(&mut self) {
        let outputs = std::mem::take(&mut self.outputs);
        let handles = outputs
            .iter()
            .map(|(handle, _)| handle.clone())
            .collect::<Vec<_>>();

        // Close the writers before unlinking
        drop(outputs);

        if let Err(e) = self.file_manager.batch_delete_files(&handles) {
            log::error!(
                "[{}] Failed to delete abandoned GC output files: {e:?}",
                self.cf.name(),
            );
        }

        self.rewrite_batches.clear();
        self.blob_gc.release_files();
        self.report_metrics();
    }

    /// Phase 3.
    ///
    /// LSM and blob manifests are separate, so all new blob files must
    /// be registered before any key is rewritten to the LSM.
    fn install_output_blob_files(&mut self) -> crate::Result<()> {
        let outputs = std::mem::take(&mut self.outputs);

        if outputs.is_empty() {
            return Ok(());
        }

        let handles = outputs
            .iter()
            .map(|(handle, _)| handle.clone())
            .collect::<Vec<_>>();

        let mut files = vec![];
        let mut result: crate::Result<()> = Ok(());

        for (handle, builder) in outputs {
            match builder.finish() {
                Ok(file_size) => {
                    files.push(Arc::new(BlobFileMeta::new(handle.number(), file_size)));
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if result.is_ok() {
            result = self
                .file_manager
                .batch_finish_files(self.cf.id(), files.clone());
        }

        match result {
            Ok(()) => {
                log::info!(
                    "[{}] Installed {} GC output file(s)",
                    self.cf.name(),
                    files.len(),
                );

                for file in files {
                    self.blob_gc.add_output_file(file);
                    self.metrics.new_files += 1;
                }

                Ok(())
            }
            Err(e) => {
                log::error!(
                    "[{}] Failed to install GC output files, deleting them: {e:?}",
                    self.cf.name(),
                );

                if let Err(delete_err) = self.file_manager.batch_delete_files(&handles) {
                    log::error!(
                        "[{}] Failed to delete GC output files: {delete_err:?}",
                        self.cf.name(),
                    );
                }

                Err(e)
            }
        }
    }

    /// Phase 4.
    fn rewrite_valid_keys_to_lsm(&mut self) -> crate::Result<()> {
        let batches = std::mem::take(&mut self.rewrite_batches);

        for (batch, mut callback) in batches {
            if self.cf.is_dropped() {
                return Err(Error::Aborted("column family dropped"));
            }

            if self.shutting_down.is_stopped() {
                return Err(Error::ShutdownInProgress);
            }

            match self
                .db
                .write_with_callback(self.cf.as_ref(), &batch, &mut callback)
            {
                Ok(()) => {
                    self.metrics.bytes_written += batch.data_size();
                    self.metrics.keys_relocated += 1;
                    self.metrics.bytes_relocated += u64::from(callback.old_index.handle.size);
                }
                Err(e) if e.is_busy() => {
                    // The key was overwritten in the meanwhile;
                    // drop the relocation
                    self.metrics.keys_overwritten += 1;
                    self.metrics.bytes_overwritten += u64::from(callback.old_index.handle.size);
                }
                Err(e) => return Err(e),
            }

            self.metrics.bytes_read += callback.read_bytes;
        }

        // Make the rewrites durable
        self.db.flush_wal(true)?;

        Ok(())
    }

    /// Phase 5.
    fn retire_input_blob_files(&mut self) -> crate::Result<()> {
        let obsolete_seq = self.db.latest_sequence();
        let inputs = self.blob_gc.gc_sampled_inputs().to_vec();

        self.metrics.retired_files += inputs.len() as u64;

        self.file_manager
            .retire_files(self.cf.id(), &inputs, obsolete_seq)
    }

    fn report_metrics(&self) {
        log::info!(
            "[{}] GC job done: {} key(s) relocated ({}B), {} key(s) overwritten ({}B), {} new file(s), {} retired file(s), {}B read, {}B written",
            self.cf.name(),
            self.metrics.keys_relocated,
            self.metrics.bytes_relocated,
            self.metrics.keys_overwritten,
            self.metrics.bytes_overwritten,
            self.metrics.new_files,
            self.metrics.retired_files,
            self.metrics.bytes_read,
            self.metrics.bytes_written,
        );
    }
}
