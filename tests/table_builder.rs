// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(clippy::unwrap_used)]

mod common;

use common::write_blob_file;

use blob_store::{
    coding::Decode,
    lsm::LsmValue,
    BlobConfig, BlobFileManager, BlobIndex, BlobRunMode, BlobTableBuilder, TableSink, UserKey,
};
use std::sync::{Arc, Mutex};
use test_log::test;

#[derive(Default)]
struct SinkInner {
    entries: Vec<(UserKey, LsmValue)>,
    finished: bool,
    abandoned: bool,
}

/// Collects whatever the shim forwards to the LSM-side table
#[derive(Clone, Default)]
struct CollectSink(Arc<Mutex<SinkInner>>);

impl CollectSink {
    fn entries(&self) -> Vec<(UserKey, LsmValue)> {
        self.0.lock().unwrap().entries.clone()
    }

    fn finished(&self) -> bool {
        self.0.lock().unwrap().finished
    }

    fn abandoned(&self) -> bool {
        self.0.lock().unwrap().abandoned
    }
}

impl TableSink for CollectSink {
    fn add(&mut self, key: &UserKey, value: &LsmValue) {
        self.0
            .lock()
            .unwrap()
            .entries
            .push((key.clone(), value.clone()));
    }

    fn finish(&mut self) -> blob_store::Result<()> {
        self.0.lock().unwrap().finished = true;
        Ok(())
    }

    fn abandon(&mut self) {
        self.0.lock().unwrap().abandoned = true;
    }
}

fn config_with_mode(mode: BlobRunMode) -> BlobConfig {
    BlobConfig::default().min_blob_size(100).blob_run_mode(mode)
}

#[test]
fn table_builder_externalizes_large_values() -> blob_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = BlobFileManager::open(dir.path(), config_with_mode(BlobRunMode::Normal))?;
    let storage = manager.column_family(0);

    let sink = CollectSink::default();
    let mut builder = BlobTableBuilder::new(sink.clone(), storage.clone(), manager.clone());

    builder.add(&b"small".into(), &LsmValue::Inline(b"tiny".into()));

    let big_value = b"x".repeat(1_000);
    builder.add(&b"big".into(), &LsmValue::Inline(big_value.clone().into()));

    assert!(builder.ok());
    builder.finish()?;
    assert!(sink.finished());

    let entries = sink.entries();
    assert_eq!(2, entries.len());

    // Small value passed through inline
    let (key, value) = entries.first().unwrap();
    assert_eq!(key, b"small".as_slice());
    assert!(matches!(value, LsmValue::Inline(v) if v == b"tiny".as_slice()));

    // Large value was diverted; the entry holds a decodable index
    let (key, value) = entries.get(1).unwrap();
    assert_eq!(key, b"big".as_slice());

    let LsmValue::BlobIndex(raw) = value else {
        panic!("expected a blob index");
    };
    let index = BlobIndex::from_slice(raw).unwrap();

    // The file was published and resolves the index
    let record = storage.get(&index)?;
    assert_eq!(record.key, b"big".as_slice());
    assert_eq!(record.value, &*big_value);

    // Physical allocation is accounted rounded up to 4 KiB
    let file = storage.find_file(index.file_number)?;
    assert_eq!(0, file.real_file_size() % 4_096);
    assert!(file.real_file_size() >= file.file_size());

    Ok(())
}

#[test]
fn table_builder_read_only_mode_passes_through() -> blob_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = BlobFileManager::open(dir.path(), config_with_mode(BlobRunMode::ReadOnly))?;
    let storage = manager.column_family(0);

    let sink = CollectSink::default();
    let mut builder = BlobTableBuilder::new(sink.clone(), storage, manager.clone());

    let big_value = b"x".repeat(1_000);
    builder.add(&b"big".into(), &LsmValue::Inline(big_value.clone().into()));
    builder.finish()?;

    let entries = sink.entries();
    assert_eq!(1, entries.len());
    assert!(matches!(
        &entries.first().unwrap().1,
        LsmValue::Inline(v) if v == &*big_value,
    ));

    Ok(())
}

#[test]
fn table_builder_fallback_inlines_blobs() -> blob_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = BlobFileManager::open(dir.path(), config_with_mode(BlobRunMode::Fallback))?;

    let (_, indexes) = write_blob_file(&manager, 0, &[(b"key", b"externalized value")])?;
    let index = indexes.first().unwrap();

    let storage = manager.column_family(0);

    let sink = CollectSink::default();
    let mut builder = BlobTableBuilder::new(sink.clone(), storage, manager.clone());

    use blob_store::coding::Encode;
    builder.add(
        &b"key".into(),
        &LsmValue::BlobIndex(index.encode_into_vec().into()),
    );

    // Fallback never externalizes, regardless of size
    let big_value = b"y".repeat(1_000);
    builder.add(&b"big".into(), &LsmValue::Inline(big_value.clone().into()));

    builder.finish()?;

    let entries = sink.entries();
    assert_eq!(2, entries.len());

    assert!(matches!(
        &entries.first().unwrap().1,
        LsmValue::Inline(v) if v == b"externalized value".as_slice(),
    ));
    assert!(matches!(
        &entries.get(1).unwrap().1,
        LsmValue::Inline(v) if v == &*big_value,
    ));

    Ok(())
}

#[test]
fn table_builder_fallback_passes_through_missing_blob() -> blob_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = BlobFileManager::open(dir.path(), config_with_mode(BlobRunMode::Fallback))?;
    let storage = manager.column_family(0);

    let sink = CollectSink::default();
    let mut builder = BlobTableBuilder::new(sink.clone(), storage, manager.clone());

    // Points into a file that was GC-deleted
    use blob_store::coding::Encode;
    let dangling = BlobIndex {
        file_number: 999,
        handle: blob_store::BlobHandle {
            offset: 0,
            size: 64,
        },
    };

    let raw: blob_store::UserValue = dangling.encode_into_vec().into();
    builder.add(&b"key".into(), &LsmValue::BlobIndex(raw.clone()));

    builder.finish()?;

    // Keeping the indirection beats losing the entry
    let entries = sink.entries();
    assert_eq!(1, entries.len());
    assert!(matches!(
        &entries.first().unwrap().1,
        LsmValue::BlobIndex(v) if *v == raw,
    ));

    Ok(())
}

#[test]
fn table_builder_abandon_deletes_tentative_file() -> blob_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = BlobFileManager::open(dir.path(), config_with_mode(BlobRunMode::Normal))?;
    let storage = manager.column_family(0);

    let sink = CollectSink::default();
    let mut builder = BlobTableBuilder::new(sink.clone(), storage.clone(), manager.clone());

    builder.add(&b"big".into(), &LsmValue::Inline(b"z".repeat(1_000).into()));

    // A tentative blob file exists on disk now
    let blob_files = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "blob"))
        .count();
    assert_eq!(1, blob_files);

    builder.abandon();
    assert!(sink.abandoned());

    let blob_files = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "blob"))
        .count();
    assert_eq!(0, blob_files);

    // Nothing was published
    assert_eq!(0, storage.file_count());

    Ok(())
}
