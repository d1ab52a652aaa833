// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    blob_file::BlobFileId,
    coding::{DecodeError, EncodeError},
    CompressionType,
};

/// Represents errors that can occur in the blob store
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionType),

    /// Invalid checksum value (got, expected)
    ChecksumMismatch {
        /// Checksum computed from the data that was read
        got: u32,

        /// Checksum stored next to the data
        expected: u32,
    },

    /// A referenced blob file is missing from the inventory
    ///
    /// Every committed index entry points into a live file,
    /// so this is a corruption.
    BlobFileNotFound(BlobFileId),

    /// An optimistic rewrite lost against a concurrent foreground write
    ///
    /// Not a failure: the foreground value is newer, so the relocation
    /// is simply dropped.
    Busy(&'static str),

    /// The column family was dropped while a job was running
    Aborted(&'static str),

    /// The engine is shutting down
    ShutdownInProgress,
}

impl Error {
    /// Returns `true` if this is a `Busy` callback rejection.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlobStoreError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Blob store result
pub type Result<T> = std::result::Result<T, Error>;
