// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::BlobGc;
use crate::{blob_file::meta::FileState, BlobConfig, BlobStorage};

/// Selects the inputs of the next garbage collection cycle
///
/// Works off the scored file list of the column family's
/// [`BlobStorage`]; selection and the `BeingGc` transition happen under
/// the inventory lock, so parallel picks return disjoint sets.
#[allow(clippy::module_name_repetitions)]
pub struct BlobGcPicker {
    config: BlobConfig,
}

impl BlobGcPicker {
    /// Creates a picker for a column family.
    #[must_use]
    pub fn new(config: BlobConfig) -> Self {
        Self { config }
    }

    /// Picks the next GC cycle, or `None` if no worthwhile work exists.
    ///
    /// Rewrite candidates are taken in GC score order: files whose live
    /// data is small enough to merge are admitted unconditionally,
    /// gc-marked files are admitted for sampling, until the batch cap is
    /// reached. Hole-punch candidates are taken in FS score order: files
    /// above the free-space threshold unconditionally, others as
    /// sampling candidates if fast reclaim is enabled.
    #[must_use]
    pub fn pick_blob_gc(&self, storage: &BlobStorage) -> Option<BlobGc> {
        let config = &self.config;

        storage.with_inner(|inner| {
            let mut trigger_next = false;
            let mut sample_admitted = false;

            // Rewrite inputs, by gc_score descending
            let mut gc_inputs = vec![];
            let mut gc_batch_size: u64 = 0;
            let mut stop_picking = gc_batch_size >= config.max_gc_batch_size;

            for score in &inner.gc_score {
                let Some(file) = inner.files.get(&score.file_number) else {
                    continue;
                };

                if file.state() == FileState::BeingGc {
                    continue;
                }

                let merges_small_file = file.valid_size() <= config.merge_small_file_threshold;

                if stop_picking {
                    // Only known-worthwhile work left behind justifies
                    // an immediate follow-up cycle
                    if merges_small_file {
                        trigger_next = true;
                        break;
                    }
                    continue;
                }

                if merges_small_file {
                    gc_inputs.push(file.clone());
                } else if file.gc_mark() {
                    sample_admitted = true;
                    gc_inputs.push(file.clone());
                } else {
                    continue;
                }

                gc_batch_size += file.file_size();
                if gc_batch_size >= config.max_gc_batch_size {
                    stop_picking = true;
                }
            }

            // Hole-punch inputs, by fs_score descending
            let mut fs_scores = inner.gc_score.clone();
            fs_scores.sort_by(|a, b| {
                b.fs_score
                    .partial_cmp(&a.fs_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.file_number.cmp(&b.file_number))
            });

            let mut fs_inputs = vec![];
            let mut fs_batch_size: u64 = 0;
            let mut stop_picking = fs_batch_size >= config.max_fs_batch_size;

            for score in &fs_scores {
                let Some(file) = inner.files.get(&score.file_number) else {
                    continue;
                };

                if file.state() == FileState::BeingGc {
                    continue;
                }

                let frees_space = file.discardable_size() >= config.free_space_threshold;

                if stop_picking {
                    if frees_space {
                        trigger_next = true;
                        break;
                    }
                    continue;
                }

                if frees_space {
                    fs_inputs.push(file.clone());

                    fs_batch_size += file.file_size();
                    if fs_batch_size >= config.max_fs_batch_size {
                        stop_picking = true;
                    }
                } else if config.fast_reclaim_space_by_sample {
                    // Sampling candidates do not count towards the
                    // batch; their reclaimable volume is unknown
                    sample_admitted = true;
                    fs_inputs.push(file.clone());
                }
            }

            if gc_inputs.is_empty() && fs_inputs.is_empty() {
                return None;
            }

            let below_min = gc_batch_size < config.min_gc_batch_size
                && fs_batch_size < config.min_fs_batch_size;

            if below_min && !sample_admitted {
                return None;
            }

            log::debug!(
                "Picked GC cycle for column family {}: {} rewrite input(s), {} hole-punch input(s), trigger_next={trigger_next}",
                storage.cf_id(),
                gc_inputs.len(),
                fs_inputs.len(),
            );

            let blob_gc = BlobGc::new(gc_inputs, fs_inputs, config.clone(), trigger_next);
            blob_gc.mark_files_being_gc();

            Some(blob_gc)
        })
    }
}
