// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Blob file storage and garbage collection core for LSM-tree
//! key-value separation.
//!
//! ##### NOTE
//!
//! > This crate only provides the blob area of a storage engine, not the
//! > engine itself. Large values are externalized into append-only blob
//! > files while the surrounding LSM-tree keeps compact index entries;
//! > the LSM collaborates through the narrow traits in [`lsm`].
//!
//! ##### About
//!
//! The crate covers the whole lifecycle of externalized values:
//!
//! - writing blob files during flush and compaction
//!   ([`BlobTableBuilder`], [`BlobFileBuilder`])
//! - keeping a crash-consistent inventory of blob files per column
//!   family ([`BlobStorage`], [`BlobFileManager`], [`Manifest`])
//! - deciding which files are worth reclaiming ([`BlobGcPicker`])
//! - rewriting live records into fresh files while proving, under
//!   concurrent foreground writes, that each relocation is safe to
//!   commit ([`BlobGcJob`])
//! - reclaiming space inside files without rewriting them
//!   ([`DigHoleJob`])
//!
//! A blob record becomes live only once its index entry is committed to
//! the LSM; the blob area never guarantees durability on its own.
//!
//! # Example usage
//!
//! ```
//! use blob_store::{BlobConfig, BlobFileManager, BlobIndex};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let manager = BlobFileManager::open(folder.path(), BlobConfig::default())?;
//!
//! // During compaction, large values go into a new blob file...
//! let (handle, mut builder) = manager.new_file_builder()?;
//! let blob_handle = builder.add(b"my_key", &b"huge value".repeat(1_000)).unwrap();
//! # let file_number = handle.number();
//! let file_size = builder.finish()?;
//!
//! // ...the file is published through the manifest...
//! use blob_store::BlobFileMeta;
//! use std::sync::Arc;
//!
//! let meta = Arc::new(BlobFileMeta::new(file_number, file_size));
//! meta.transit(blob_store::FileEvent::FlushOrCompactionOutput);
//! manager.finish_file(0, meta)?;
//!
//! // ...and the LSM stores only the compact index entry
//! let index = BlobIndex { file_number, handle: blob_handle };
//!
//! let storage = manager.storage(0).unwrap();
//! let record = storage.get(&index)?;
//! assert_eq!(&*record.value, &*b"huge value".repeat(1_000));
//! #
//! # Ok::<(), blob_store::Error>(())
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/lsm-tree/main/logo.png")]
#![doc(html_favicon_url = "https://raw.githubusercontent.com/fjall-rs/lsm-tree/main/logo.png")]
#![deny(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

#[doc(hidden)]
pub mod blob_file;

#[doc(hidden)]
pub mod coding;

mod compression;
mod config;
mod error;

#[doc(hidden)]
pub mod file;

mod file_manager;

#[doc(hidden)]
pub mod format;

#[doc(hidden)]
pub mod gc;

pub mod lsm;

mod manifest;
mod seqno;
mod slice;
mod stop_signal;
mod storage;
mod table_builder;

/// User-facing key, an opaque byte string
pub type UserKey = Slice;

/// User-facing value, an opaque byte string
pub type UserValue = Slice;

/// Hash map with a fast, non-cryptographic hasher
pub type HashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;

pub use {
    blob_file::{
        builder::BlobFileBuilder,
        cache::BlobFileCache,
        iterator::{BlobFileIterator, ScanEntry},
        merge::BlobFileMergeIterator,
        meta::{BlobFileMeta, FileEvent, FileState},
        reader::{BlobFilePrefetcher, BlobFileReader},
        BlobFileId,
    },
    compression::CompressionType,
    config::{BlobConfig, BlobRunMode},
    error::{Error, Result},
    file_manager::{BlobFileHandle, BlobFileManager},
    format::{BlobHandle, BlobIndex, BlobRecord},
    gc::{dig_hole::DigHoleJob, job::BlobGcJob, job::GcMetrics, picker::BlobGcPicker, BlobGc, GcScore},
    manifest::{Manifest, ManifestEdit},
    seqno::{SeqNo, SequenceNumberCounter},
    slice::Slice,
    stop_signal::StopSignal,
    storage::BlobStorage,
    table_builder::{BlobTableBuilder, TableSink},
};
