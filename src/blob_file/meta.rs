// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::BlobFileId;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};

/// Lifecycle state of a blob file
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileState {
    /// Freshly created, not yet visible to readers
    Init,

    /// Live and selectable for GC
    Normal,

    /// Currently input or output of a running GC job; the picker
    /// must not select it again
    BeingGc,

    /// Unreferenced; awaiting physical deletion once no live snapshot
    /// can resolve it
    Obsolete,
}

/// Event that drives a [`FileState`] transition
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileEvent {
    /// The file was published by a flush or compaction
    FlushOrCompactionOutput,

    /// The database restarted and replayed its manifest
    DbRestart,

    /// A GC job selected the file as input
    GcBegin,

    /// A GC job produced the file as output
    GcOutput,

    /// The GC job that held the file finished
    GcCompleted,

    /// The file became unreferenced
    Delete,
}

/// Metadata of one blob file, owned by the column family's
/// [`BlobStorage`](crate::BlobStorage) and shared with in-flight jobs
///
/// Jobs never mutate fields except through [`BlobFileMeta::transit`]
/// and the counter methods.
#[derive(Debug)]
pub struct BlobFileMeta {
    file_number: BlobFileId,
    file_size: u64,

    real_file_size: AtomicU64,
    discardable_size: AtomicU64,
    gc_mark: AtomicBool,
    state: Mutex<FileState>,
}

impl BlobFileMeta {
    /// Creates metadata for a freshly written file.
    #[must_use]
    pub fn new(file_number: BlobFileId, file_size: u64) -> Self {
        Self {
            file_number,
            file_size,
            real_file_size: AtomicU64::new(file_size),
            discardable_size: AtomicU64::new(0),
            gc_mark: AtomicBool::new(false),
            state: Mutex::new(FileState::Init),
        }
    }

    /// Returns the file number.
    #[must_use]
    pub fn file_number(&self) -> BlobFileId {
        self.file_number
    }

    /// Returns the number of bytes written to the file.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Returns the physical allocation of the file.
    ///
    /// Starts as the 4 KiB-rounded file size and shrinks as holes
    /// are punched.
    #[must_use]
    pub fn real_file_size(&self) -> u64 {
        self.real_file_size.load(Ordering::Acquire)
    }

    /// Sets the physical allocation of the file.
    pub fn set_real_file_size(&self, bytes: u64) {
        self.real_file_size.store(bytes, Ordering::Release);
    }

    /// Returns the approximate amount of bytes whose records are known
    /// to be overwritten or deleted.
    #[must_use]
    pub fn discardable_size(&self) -> u64 {
        self.discardable_size.load(Ordering::Acquire)
    }

    /// Adds discardable bytes, as reported by compaction.
    pub fn add_discardable_size(&self, bytes: u64) {
        let discardable = self.discardable_size.fetch_add(bytes, Ordering::AcqRel) + bytes;
        debug_assert!(discardable <= self.file_size, "discardable > file size");
    }

    /// Returns the approximate amount of live bytes.
    #[must_use]
    pub fn valid_size(&self) -> u64 {
        self.file_size.saturating_sub(self.discardable_size())
    }

    /// Accounts for a punched hole: the physical allocation shrinks and
    /// the punched range no longer counts as discardable.
    pub fn on_hole_punched(&self, bytes: u64) {
        let mut real = self.real_file_size.load(Ordering::Acquire);
        loop {
            let next = real.saturating_sub(bytes);
            match self.real_file_size.compare_exchange_weak(
                real,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => real = current,
            }
        }

        let mut discardable = self.discardable_size.load(Ordering::Acquire);
        loop {
            let next = discardable.saturating_sub(bytes);
            match self.discardable_size.compare_exchange_weak(
                discardable,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => discardable = current,
            }
        }
    }

    /// Returns `true` if the file is marked for a GC sample pass.
    #[must_use]
    pub fn gc_mark(&self) -> bool {
        self.gc_mark.load(Ordering::Acquire)
    }

    /// Marks or unmarks the file for a GC sample pass.
    pub fn set_gc_mark(&self, marked: bool) {
        self.gc_mark.store(marked, Ordering::Release);
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> FileState {
        *self.state.lock().expect("lock is poisoned")
    }

    /// Applies an event to the file's state machine.
    ///
    /// # Panics
    ///
    /// Panics on an event that is illegal in the current state; that is
    /// a programmer error, not a runtime condition.
    pub fn transit(&self, event: FileEvent) {
        let mut state = self.state.lock().expect("lock is poisoned");

        *state = match (*state, event) {
            (FileState::Init, FileEvent::FlushOrCompactionOutput | FileEvent::DbRestart) => {
                FileState::Normal
            }
            (FileState::Init, FileEvent::GcOutput) => FileState::BeingGc,

            (FileState::Normal, FileEvent::DbRestart) => FileState::Normal,
            (FileState::Normal, FileEvent::GcBegin) => FileState::BeingGc,

            (FileState::BeingGc, FileEvent::DbRestart) => FileState::BeingGc,
            (FileState::BeingGc, FileEvent::GcCompleted) => FileState::Normal,

            (FileState::Init | FileState::Normal | FileState::BeingGc, FileEvent::Delete) => {
                FileState::Obsolete
            }

            (state, event) => {
                panic!("illegal blob file state transition: {state:?} on {event:?}")
            }
        };
    }
}
