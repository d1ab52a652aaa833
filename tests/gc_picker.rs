// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(clippy::unwrap_used)]

use blob_store::{
    BlobConfig, BlobFileCache, BlobFileId, BlobFileMeta, BlobGcPicker, BlobStorage, FileEvent,
    FileState,
};
use std::sync::Arc;
use test_log::test;

const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

fn new_storage(config: &BlobConfig) -> (BlobStorage, BlobGcPicker) {
    let storage = BlobStorage::new(
        0,
        "/tmp/does-not-exist",
        config.clone(),
        Arc::new(BlobFileCache::new("/tmp/does-not-exist", 8)),
    );
    let picker = BlobGcPicker::new(config.clone());

    (storage, picker)
}

fn add_blob_file(
    storage: &BlobStorage,
    file_number: BlobFileId,
    file_size: u64,
    discardable_size: u64,
    being_gc: bool,
) {
    let file = Arc::new(BlobFileMeta::new(file_number, file_size));
    file.add_discardable_size(discardable_size);
    file.transit(FileEvent::DbRestart);

    if being_gc {
        file.transit(FileEvent::GcBegin);
    }

    storage.add_blob_file(file);
}

fn file_numbers(files: &[Arc<BlobFileMeta>]) -> Vec<BlobFileId> {
    files.iter().map(|f| f.file_number()).collect()
}

fn remove_inputs(storage: &BlobStorage, files: &[Arc<BlobFileMeta>]) {
    for file in files {
        storage.mark_file_obsolete(file, 0);
    }
}

#[test]
fn picker_basic() {
    let config = BlobConfig::default()
        .gc_batch_size(0, GIB)
        .merge_small_file_threshold(10)
        .free_space_threshold(10);

    let (storage, picker) = new_storage(&config);

    // Will be picked as gc input and fs input
    add_blob_file(&storage, 1, 10, 0, false);
    // Will be picked as fs input
    add_blob_file(&storage, 2, 100, 10, false);

    storage.compute_gc_score();

    let blob_gc = picker.pick_blob_gc(&storage).unwrap();

    assert_eq!(vec![1], file_numbers(blob_gc.gc_inputs()));
    assert_eq!(vec![2, 1], file_numbers(blob_gc.fs_inputs()));

    // Selected files are invisible to further picks
    for file in blob_gc.gc_inputs() {
        assert_eq!(FileState::BeingGc, file.state());
    }
}

#[test]
fn picker_respects_being_gc() {
    let config = BlobConfig::default().gc_batch_size(0, GIB);

    let (storage, picker) = new_storage(&config);
    add_blob_file(&storage, 1, 1, 0, true);
    storage.compute_gc_score();

    assert!(picker.pick_blob_gc(&storage).is_none());

    let (storage, picker) = new_storage(&config);
    add_blob_file(&storage, 1, 1, 0, true);
    add_blob_file(&storage, 2, 1, 0, false);
    storage.compute_gc_score();

    let blob_gc = picker.pick_blob_gc(&storage).unwrap();
    assert_eq!(vec![2], file_numbers(blob_gc.gc_inputs()));
    assert_eq!(vec![2], file_numbers(blob_gc.fs_inputs()));
}

#[test]
fn picker_trigger_next() {
    let base = BlobConfig::default()
        .gc_batch_size(512 * MIB, GIB)
        .fs_batch_size(512 * MIB, GIB)
        .blob_file_target_size(256 * MIB);

    // Triggered by leftover rewrite work
    let config = base
        .clone()
        .merge_small_file_threshold(30 * MIB)
        .free_space_threshold(GIB);

    let (storage, picker) = new_storage(&config);
    add_blob_file(&storage, 1, GIB, 1_000 * MIB, false); // valid = 24 MiB
    add_blob_file(&storage, 2, GIB, 994 * MIB, false); // valid = 30 MiB
    add_blob_file(&storage, 3, GIB, 994 * MIB, false);
    add_blob_file(&storage, 4, GIB, 994 * MIB, false);
    storage.compute_gc_score();

    let blob_gc = picker.pick_blob_gc(&storage).unwrap();
    assert!(blob_gc.trigger_next());

    // Triggered by leftover hole-punch work
    let config = base
        .clone()
        .merge_small_file_threshold(0)
        .free_space_threshold(512 * MIB);

    let (storage, picker) = new_storage(&config);
    add_blob_file(&storage, 1, GIB, 1_000 * MIB, false);
    add_blob_file(&storage, 2, GIB, 512 * MIB, false);
    add_blob_file(&storage, 3, GIB, 512 * MIB, false);
    add_blob_file(&storage, 4, GIB, 512 * MIB, false);
    storage.compute_gc_score();

    let blob_gc = picker.pick_blob_gc(&storage).unwrap();
    assert!(blob_gc.trigger_next());

    // Nothing left behind, no trigger
    let config = base
        .merge_small_file_threshold(0)
        .free_space_threshold(GIB);

    let (storage, picker) = new_storage(&config);
    add_blob_file(&storage, 1, GIB, 0, false);
    add_blob_file(&storage, 2, GIB, 0, false);
    add_blob_file(&storage, 3, GIB, 0, false);
    add_blob_file(&storage, 4, GIB, 0, false);
    storage.compute_gc_score();

    let blob_gc = picker.pick_blob_gc(&storage).unwrap();
    assert!(!blob_gc.trigger_next());
}

#[test]
fn picker_drains_backlog_by_gc_batches() {
    let config = BlobConfig::default()
        .gc_batch_size(512 * MIB, GIB)
        .fs_batch_size(512 * MIB, 0)
        .blob_file_target_size(256 * MIB)
        .merge_small_file_threshold(10 * MIB)
        .free_space_threshold(GIB);

    let (storage, picker) = new_storage(&config);

    // 40 files with 10 MiB of live data each
    for i in 1..41 {
        add_blob_file(&storage, i, 256 * MIB, 246 * MIB, false);
    }
    storage.compute_gc_score();

    let mut gc_times = 0;
    let mut blob_gc = picker.pick_blob_gc(&storage).unwrap();

    while blob_gc.trigger_next() {
        gc_times += 1;
        assert_eq!(4, blob_gc.gc_inputs().len());

        remove_inputs(&storage, blob_gc.gc_inputs());
        storage.compute_gc_score();

        blob_gc = picker.pick_blob_gc(&storage).unwrap();
    }

    assert_eq!(9, gc_times);
    assert_eq!(4, blob_gc.gc_inputs().len());
}

#[test]
fn picker_drains_backlog_by_fs_batches() {
    let config = BlobConfig::default()
        .gc_batch_size(512 * MIB, GIB)
        .fs_batch_size(512 * MIB, GIB)
        .merge_small_file_threshold(0)
        .free_space_threshold(246 * MIB);

    let (storage, picker) = new_storage(&config);

    for i in 1..41 {
        add_blob_file(&storage, i, 256 * MIB, 246 * MIB, false);
    }
    storage.compute_gc_score();

    let mut gc_times = 0;
    let mut blob_gc = picker.pick_blob_gc(&storage).unwrap();

    while blob_gc.trigger_next() {
        gc_times += 1;
        assert_eq!(0, blob_gc.gc_inputs().len());
        assert_eq!(4, blob_gc.fs_inputs().len());

        remove_inputs(&storage, blob_gc.fs_inputs());
        storage.compute_gc_score();

        blob_gc = picker.pick_blob_gc(&storage).unwrap();
    }

    assert_eq!(9, gc_times);
    assert_eq!(0, blob_gc.gc_inputs().len());
    assert_eq!(4, blob_gc.fs_inputs().len());
}

#[test]
fn picker_parallel_picks_are_disjoint() {
    let config = BlobConfig::default()
        .gc_batch_size(512 * MIB, GIB)
        .fs_batch_size(512 * MIB, 0)
        .blob_file_target_size(256 * MIB)
        .merge_small_file_threshold(10 * MIB)
        .free_space_threshold(GIB);

    let (storage, picker) = new_storage(&config);

    // 8 files with 10 MiB of live data each
    for i in 1..9 {
        add_blob_file(&storage, i, 256 * MIB, 246 * MIB, false);
    }
    storage.compute_gc_score();

    let blob_gc1 = picker.pick_blob_gc(&storage).unwrap();
    assert!(blob_gc1.trigger_next());
    assert_eq!(4, blob_gc1.gc_inputs().len());
    assert_eq!(0, blob_gc1.fs_inputs().len());

    // No files were removed in between, yet the second pick must not
    // hand out anything the first one holds
    let blob_gc2 = picker.pick_blob_gc(&storage).unwrap();
    assert!(!blob_gc2.trigger_next());
    assert_eq!(4, blob_gc2.gc_inputs().len());
    assert_eq!(0, blob_gc2.fs_inputs().len());

    let first = file_numbers(blob_gc1.gc_inputs());
    let second = file_numbers(blob_gc2.gc_inputs());
    assert!(first.iter().all(|n| !second.contains(n)));
}

#[test]
fn picker_parallel_fs_picks_are_disjoint() {
    let config = BlobConfig::default()
        .gc_batch_size(512 * MIB, GIB)
        .fs_batch_size(512 * MIB, GIB)
        .merge_small_file_threshold(0)
        .free_space_threshold(246 * MIB);

    let (storage, picker) = new_storage(&config);

    for i in 1..9 {
        add_blob_file(&storage, i, 256 * MIB, 246 * MIB, false);
    }
    storage.compute_gc_score();

    let blob_gc1 = picker.pick_blob_gc(&storage).unwrap();
    assert!(blob_gc1.trigger_next());
    assert_eq!(0, blob_gc1.gc_inputs().len());
    assert_eq!(4, blob_gc1.fs_inputs().len());

    let blob_gc2 = picker.pick_blob_gc(&storage).unwrap();
    assert!(!blob_gc2.trigger_next());
    assert_eq!(0, blob_gc2.gc_inputs().len());
    assert_eq!(4, blob_gc2.fs_inputs().len());

    let first = file_numbers(blob_gc1.fs_inputs());
    let second = file_numbers(blob_gc2.fs_inputs());
    assert!(first.iter().all(|n| !second.contains(n)));
}
