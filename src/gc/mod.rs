// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod dig_hole;
pub mod job;
pub mod picker;

use crate::{
    blob_file::{
        meta::{BlobFileMeta, FileEvent, FileState},
        BlobFileId,
    },
    BlobConfig,
};
use std::sync::Arc;

/// Scalar ranking of a file's desirability for rewrite (`gc_score`)
/// vs. hole punching (`fs_score`)
#[derive(Clone, Debug)]
pub struct GcScore {
    /// File number
    pub file_number: BlobFileId,

    /// Discardable ratio, boosted to 1.0 for small files worth merging
    pub gc_score: f64,

    /// Discardable ratio
    pub fs_score: f64,
}

/// Describes one garbage collection cycle over a column family
///
/// Produced by the [`BlobGcPicker`](crate::BlobGcPicker); all selected
/// files are in the `BeingGc` state until
/// [`BlobGc::release_files`] runs.
pub struct BlobGc {
    gc_inputs: Vec<Arc<BlobFileMeta>>,
    fs_inputs: Vec<Arc<BlobFileMeta>>,

    gc_sampled_inputs: Vec<Arc<BlobFileMeta>>,
    fs_sampled_inputs: Vec<Arc<BlobFileMeta>>,

    outputs: Vec<Arc<BlobFileMeta>>,

    config: BlobConfig,
    trigger_next: bool,
}

impl BlobGc {
    pub(crate) fn new(
        gc_inputs: Vec<Arc<BlobFileMeta>>,
        fs_inputs: Vec<Arc<BlobFileMeta>>,
        config: BlobConfig,
        trigger_next: bool,
    ) -> Self {
        Self {
            gc_inputs,
            fs_inputs,
            gc_sampled_inputs: Vec::new(),
            fs_sampled_inputs: Vec::new(),
            outputs: Vec::new(),
            config,
            trigger_next,
        }
    }

    /// Candidate files for rewriting.
    #[must_use]
    pub fn gc_inputs(&self) -> &[Arc<BlobFileMeta>] {
        &self.gc_inputs
    }

    /// Candidate files for hole punching.
    #[must_use]
    pub fn fs_inputs(&self) -> &[Arc<BlobFileMeta>] {
        &self.fs_inputs
    }

    /// Rewrite candidates confirmed by the sampling phase.
    #[must_use]
    pub fn gc_sampled_inputs(&self) -> &[Arc<BlobFileMeta>] {
        &self.gc_sampled_inputs
    }

    /// Hole-punch candidates confirmed by the sampling phase.
    #[must_use]
    pub fn fs_sampled_inputs(&self) -> &[Arc<BlobFileMeta>] {
        &self.fs_sampled_inputs
    }

    /// Files written by this cycle.
    #[must_use]
    pub fn outputs(&self) -> &[Arc<BlobFileMeta>] {
        &self.outputs
    }

    /// Configuration of the column family being collected.
    #[must_use]
    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    /// Whether the next GC should begin immediately after this one
    /// commits, because a batch cap left admissible work behind.
    #[must_use]
    pub fn trigger_next(&self) -> bool {
        self.trigger_next
    }

    pub(crate) fn set_gc_sampled_inputs(&mut self, files: Vec<Arc<BlobFileMeta>>) {
        self.gc_sampled_inputs = files;
    }

    pub(crate) fn set_fs_sampled_inputs(&mut self, files: Vec<Arc<BlobFileMeta>>) {
        self.fs_sampled_inputs = files;
    }

    /// Registers a freshly written output file.
    pub(crate) fn add_output_file(&mut self, file: Arc<BlobFileMeta>) {
        file.transit(FileEvent::GcOutput);
        self.outputs.push(file);
    }

    /// Marks every selected input as being collected.
    ///
    /// Called by the picker under the inventory lock, so parallel picks
    /// return disjoint sets. Files sitting in both input sets are
    /// transitioned exactly once.
    pub(crate) fn mark_files_being_gc(&self) {
        for file in self.unique_files(false) {
            file.transit(FileEvent::GcBegin);
        }
    }

    /// Moves all inputs and outputs out of the GC cycle.
    ///
    /// Obsolete inputs stay obsolete; everything else returns to
    /// `Normal`. The gc marks are consumed: a file that survived its
    /// sample pass is only reconsidered once compaction feedback
    /// changes its counters.
    pub fn release_files(&self) {
        for file in self.unique_files(true) {
            file.set_gc_mark(false);

            if file.state() != FileState::Obsolete {
                file.transit(FileEvent::GcCompleted);
            }
        }
    }

    fn unique_files(&self, with_outputs: bool) -> Vec<&Arc<BlobFileMeta>> {
        let mut seen = std::collections::BTreeSet::new();
        let mut unique = vec![];

        let outputs = if with_outputs {
            self.outputs.as_slice()
        } else {
            &[]
        };

        for file in self
            .gc_inputs
            .iter()
            .chain(&self.fs_inputs)
            .chain(outputs)
        {
            if seen.insert(file.file_number()) {
                unique.push(file);
            }
        }

        unique
    }
}
