// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

#![allow(dead_code, clippy::unwrap_used)]

use blob_store::{
    coding::Encode,
    lsm::{ColumnFamilyHandle, ColumnFamilyId, LsmEngine, LsmValue, WriteBatch, WriteCallback},
    BlobFileManager, BlobFileMeta, BlobIndex, FileEvent, SeqNo, SequenceNumberCounter, UserKey,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// Column family handle for tests
pub struct TestColumnFamily {
    id: ColumnFamilyId,
    name: String,
    dropped: AtomicBool,
}

impl TestColumnFamily {
    pub fn new(id: ColumnFamilyId, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            dropped: AtomicBool::new(false),
        })
    }

    pub fn drop_cf(&self) {
        self.dropped.store(true, Ordering::Release);
    }
}

impl ColumnFamilyHandle for TestColumnFamily {
    fn id(&self) -> ColumnFamilyId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// In-memory LSM stand-in
///
/// A writer lock serializes conditional writes: the callback runs, then
/// the batch is applied, exactly like the engine's write path would.
#[derive(Default)]
pub struct MemLsm {
    data: Mutex<BTreeMap<UserKey, LsmValue>>,
    write_lock: Mutex<()>,
    seq: SequenceNumberCounter,
}

impl MemLsm {
    pub fn insert_inline(&self, key: &[u8], value: &[u8]) {
        let _guard = self.write_lock.lock().unwrap();
        self.data
            .lock()
            .unwrap()
            .insert(key.into(), LsmValue::Inline(value.into()));
        let _ = self.seq.next();
    }

    pub fn insert_blob_index(&self, key: &[u8], index: &BlobIndex) {
        let _guard = self.write_lock.lock().unwrap();
        self.data.lock().unwrap().insert(
            key.into(),
            LsmValue::BlobIndex(index.encode_into_vec().into()),
        );
        let _ = self.seq.next();
    }

    pub fn delete(&self, key: &[u8]) {
        let _guard = self.write_lock.lock().unwrap();
        self.data.lock().unwrap().remove(key);
        let _ = self.seq.next();
    }

    pub fn get_raw(&self, key: &[u8]) -> Option<LsmValue> {
        self.data.lock().unwrap().get(key).cloned()
    }

    /// Returns the decoded blob index a key points to, if it does.
    pub fn get_blob_index(&self, key: &[u8]) -> Option<BlobIndex> {
        use blob_store::coding::Decode;

        match self.get_raw(key)? {
            LsmValue::BlobIndex(raw) => Some(BlobIndex::from_slice(&raw).unwrap()),
            LsmValue::Inline(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl LsmEngine for MemLsm {
    fn get(
        &self,
        _cf: &dyn ColumnFamilyHandle,
        key: &[u8],
    ) -> blob_store::Result<Option<LsmValue>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn write_with_callback(
        &self,
        _cf: &dyn ColumnFamilyHandle,
        batch: &WriteBatch,
        callback: &mut dyn WriteCallback,
    ) -> blob_store::Result<()> {
        let _guard = self.write_lock.lock().unwrap();

        callback.check(self)?;

        let mut data = self.data.lock().unwrap();
        for (key, value) in batch.entries() {
            data.insert(key.clone(), value.clone());
        }
        drop(data);

        let _ = self.seq.next();

        Ok(())
    }

    fn flush_wal(&self, _sync: bool) -> blob_store::Result<()> {
        Ok(())
    }

    fn latest_sequence(&self) -> SeqNo {
        self.seq.get()
    }
}

/// Writes one blob file through the manager and publishes it, returning
/// its metadata and the index entries of its records.
pub fn write_blob_file(
    manager: &Arc<BlobFileManager>,
    cf_id: ColumnFamilyId,
    items: &[(&[u8], &[u8])],
) -> blob_store::Result<(Arc<BlobFileMeta>, Vec<BlobIndex>)> {
    let (handle, mut builder) = manager.new_file_builder()?;

    let mut indexes = vec![];

    for (key, value) in items {
        let blob_handle = builder.add(key, value).unwrap();
        indexes.push(BlobIndex {
            file_number: handle.number(),
            handle: blob_handle,
        });
    }

    let file_size = builder.finish()?;

    let file = Arc::new(BlobFileMeta::new(handle.number(), file_size));
    file.transit(FileEvent::FlushOrCompactionOutput);

    manager.finish_file(cf_id, file.clone())?;

    Ok((file, indexes))
}
