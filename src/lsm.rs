// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The seam towards the surrounding LSM engine.
//!
//! The blob store never owns the LSM: it only needs a point lookup that
//! distinguishes inline values from blob indexes, a conditional write,
//! WAL flushing and the latest sequence number. The engine implements
//! these traits; tests use a small in-memory stand-in.

use crate::{SeqNo, UserKey, UserValue};

/// Numeric id of a column family
pub type ColumnFamilyId = u32;

/// Handle to a column family, an independent keyspace with its own
/// blob storage
pub trait ColumnFamilyHandle: Send + Sync {
    /// Returns the column family id.
    fn id(&self) -> ColumnFamilyId;

    /// Returns the column family name.
    fn name(&self) -> &str;

    /// Returns `true` if the column family has been dropped.
    ///
    /// Jobs poll this to abort work that has become pointless.
    fn is_dropped(&self) -> bool;
}

/// A value as the LSM stores it
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LsmValue {
    /// The value is stored inline in the LSM entry
    Inline(UserValue),

    /// The value is externalized; the entry holds an encoded
    /// [`BlobIndex`](crate::BlobIndex)
    BlobIndex(UserValue),
}

impl LsmValue {
    /// Returns `true` if this is an externalized value.
    #[must_use]
    pub fn is_blob_index(&self) -> bool {
        matches!(self, Self::BlobIndex(_))
    }

    /// Returns the raw bytes of the entry.
    #[must_use]
    pub fn raw(&self) -> &UserValue {
        match self {
            Self::Inline(bytes) | Self::BlobIndex(bytes) => bytes,
        }
    }
}

/// An atomic batch of writes into the LSM
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    entries: Vec<(UserKey, LsmValue)>,
}

impl WriteBatch {
    /// Stages a put of an encoded blob index under a key.
    pub fn put_blob_index(&mut self, key: UserKey, index_entry: UserValue) {
        self.entries.push((key, LsmValue::BlobIndex(index_entry)));
    }

    /// Stages a put of an inline value under a key.
    pub fn put(&mut self, key: UserKey, value: UserValue) {
        self.entries.push((key, LsmValue::Inline(value)));
    }

    /// Returns the staged entries.
    #[must_use]
    pub fn entries(&self) -> &[(UserKey, LsmValue)] {
        &self.entries
    }

    /// Returns the amount of staged bytes.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|(k, v)| (k.len() + v.raw().len()) as u64)
            .sum()
    }
}

/// Decides whether a conditional write may commit
///
/// The engine invokes the callback inside its write path, so it must be
/// allocation-free and perform exactly one point lookup.
pub trait WriteCallback {
    /// Called by the engine's write path; the batch commits iff this
    /// returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`](crate::Error::Busy) to reject the write
    /// without failing it, any other error to abort.
    fn check(&mut self, db: &dyn LsmEngine) -> crate::Result<()>;
}

/// The operations the blob store consumes from the LSM engine
pub trait LsmEngine: Send + Sync {
    /// Point lookup at the latest sequence, distinguishing inlined from
    /// externalized values.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    fn get(
        &self,
        cf: &dyn ColumnFamilyHandle,
        key: &[u8],
    ) -> crate::Result<Option<LsmValue>>;

    /// Atomic write whose commit is conditional on the callback
    /// returning `Ok`.
    ///
    /// # Errors
    ///
    /// Surfaces the callback's rejection (`Busy`) or failure verbatim.
    fn write_with_callback(
        &self,
        cf: &dyn ColumnFamilyHandle,
        batch: &WriteBatch,
        callback: &mut dyn WriteCallback,
    ) -> crate::Result<()>;

    /// Flushes the write-ahead log, optionally fsyncing it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    fn flush_wal(&self, sync: bool) -> crate::Result<()>;

    /// Returns the latest committed sequence number.
    fn latest_sequence(&self) -> SeqNo;
}
