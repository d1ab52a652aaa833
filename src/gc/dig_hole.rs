// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    blob_file::{iterator::BlobFileIterator, meta::BlobFileMeta},
    file::{blob_file_path, punch_hole},
    format::{BlobIndex, BLOB_FILE_BLOCK_SIZE, BLOB_FILE_HEADER_LEN},
    StopSignal,
};
use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::Arc,
};

/// Decides whether a record is discardable; queries the LSM
pub type DiscardFn<'a> = dyn FnMut(&[u8], &BlobIndex) -> crate::Result<bool> + 'a;

/// Reclaims space inside blob files without rewriting live records
///
/// Contiguous runs of discardable records are hole-punched, shrunk
/// inward to block boundaries so only bytes fully inside discardable
/// records are freed. The logical file size does not change; reads by
/// live handles keep working.
pub struct DigHoleJob<'a> {
    folder: &'a Path,
    shutting_down: &'a StopSignal,
}

impl<'a> DigHoleJob<'a> {
    /// Creates a dig-hole job over the given blob folder.
    #[must_use]
    pub fn new(folder: &'a Path, shutting_down: &'a StopSignal) -> Self {
        Self {
            folder,
            shutting_down,
        }
    }

    /// Punches holes into each input file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, a file is corrupt, or
    /// the shutdown signal is raised.
    pub fn exec(
        &self,
        inputs: &[Arc<BlobFileMeta>],
        discard: &mut DiscardFn<'_>,
    ) -> crate::Result<()> {
        for file in inputs {
            if self.shutting_down.is_stopped() {
                return Err(crate::Error::ShutdownInProgress);
            }

            self.exec_file(file, discard)?;
        }

        Ok(())
    }

    fn exec_file(
        &self,
        meta: &Arc<BlobFileMeta>,
        discard: &mut DiscardFn<'_>,
    ) -> crate::Result<()> {
        let path = blob_file_path(self.folder, meta.file_number());

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let iter = BlobFileIterator::new(&path, meta.file_number(), meta.file_size())?;

        let mut punched: u64 = 0;

        // Current run of discardable records, [start, end) in record
        // region coordinates. Runs break at live records and at
        // alignment padding, which belongs to no record.
        let mut run: Option<(u64, u64)> = None;

        for entry in iter {
            if self.shutting_down.is_stopped() {
                return Err(crate::Error::ShutdownInProgress);
            }

            let entry = entry?;

            let start = entry.index.handle.offset;
            let end = start + u64::from(entry.index.handle.size);

            if discard(&entry.key, &entry.index)? {
                run = match run {
                    Some((run_start, run_end)) if run_end == start => Some((run_start, end)),
                    Some(prev) => {
                        punched += punch_aligned(&file, prev)?;
                        Some((start, end))
                    }
                    None => Some((start, end)),
                };
            } else if let Some(prev) = run.take() {
                punched += punch_aligned(&file, prev)?;
            }
        }

        if let Some(prev) = run.take() {
            punched += punch_aligned(&file, prev)?;
        }

        if punched > 0 {
            meta.on_hole_punched(punched);

            log::info!(
                "Punched {punched}B out of blob file {}, physical size now {}B",
                meta.file_number(),
                meta.real_file_size(),
            );
        }

        Ok(())
    }
}

/// Punches the largest block-aligned range inside the run, returning
/// how many bytes were freed.
fn punch_aligned(file: &File, (start, end): (u64, u64)) -> crate::Result<u64> {
    let physical_start = BLOB_FILE_HEADER_LEN as u64 + start;
    let physical_end = BLOB_FILE_HEADER_LEN as u64 + end;

    let aligned_start = physical_start.next_multiple_of(BLOB_FILE_BLOCK_SIZE);
    let aligned_end = (physical_end / BLOB_FILE_BLOCK_SIZE) * BLOB_FILE_BLOCK_SIZE;

    if aligned_end <= aligned_start {
        return Ok(0);
    }

    punch_hole(file, aligned_start, aligned_end - aligned_start)?;

    Ok(aligned_end - aligned_start)
}
