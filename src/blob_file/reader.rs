// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::BlobFileId;
use crate::{
    coding::Decode,
    file::read_exact_at,
    format::{
        decode_record, BlobFileFooter, BlobFileHeader, BlobHandle, BlobRecord,
        BLOB_FILE_FOOTER_LEN, BLOB_FILE_HEADER_LEN,
    },
    CompressionType,
};
use std::{fs::File, path::Path, sync::Arc};

const MIN_READAHEAD_SIZE: usize = 16 * 1_024;
const MAX_READAHEAD_SIZE: usize = 256 * 1_024;

/// Serves random reads from a single blob file
///
/// Opened once per file and shared through the
/// [`BlobFileCache`](crate::BlobFileCache); in-flight reads keep an
/// evicted reader alive until they are done.
pub struct BlobFileReader {
    file: File,
    file_number: BlobFileId,

    /// Length of the record region
    records_end: u64,

    compression: CompressionType,
}

impl BlobFileReader {
    /// Opens a blob file, validating its header and footer.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if header or footer
    /// are corrupt.
    pub fn open<P: AsRef<Path>>(
        path: P,
        file_number: BlobFileId,
        file_size: u64,
    ) -> crate::Result<Self> {
        let file = File::open(path)?;

        let header = {
            let bytes = read_exact_at(&file, 0, BLOB_FILE_HEADER_LEN)?;
            BlobFileHeader::from_slice(&bytes)?
        };

        let footer = {
            let offset = file_size
                .checked_sub(BLOB_FILE_FOOTER_LEN as u64)
                .ok_or(crate::coding::DecodeError::InvalidHeader("BlobFileFooter"))?;

            let bytes = read_exact_at(&file, offset, BLOB_FILE_FOOTER_LEN)?;
            BlobFileFooter::from_slice(&bytes)?
        };

        Ok(Self {
            file,
            file_number,
            records_end: footer.meta_index_handle.offset,
            compression: header.compression,
        })
    }

    /// Returns the blob file number.
    #[must_use]
    pub fn file_number(&self) -> BlobFileId {
        self.file_number
    }

    /// Returns the length of the record region.
    #[must_use]
    pub fn records_end(&self) -> u64 {
        self.records_end
    }

    /// Returns the compression codec declared in the file header.
    #[must_use]
    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Reads the record the handle points to.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the record is
    /// corrupt.
    pub fn get(&self, handle: &BlobHandle) -> crate::Result<BlobRecord> {
        let frame = read_exact_at(
            &self.file,
            BLOB_FILE_HEADER_LEN as u64 + handle.offset,
            handle.size as usize,
        )?;

        decode_record(&frame, self.compression)
    }
}

/// Reads records through a private read-ahead buffer
///
/// Sequential `get`s (each handle starting where the previous record
/// ended) are served from the buffer, which grows up to a cap; random
/// `get`s bypass it.
pub struct BlobFilePrefetcher {
    reader: Arc<BlobFileReader>,

    /// Where the previous read ended; the next sequential read starts here
    last_offset: u64,

    readahead_size: usize,

    buffer: Vec<u8>,
    buffer_offset: u64,
}

impl BlobFilePrefetcher {
    /// Creates a prefetcher on top of a shared reader.
    #[must_use]
    pub fn new(reader: Arc<BlobFileReader>) -> Self {
        Self {
            reader,
            last_offset: 0,
            readahead_size: MIN_READAHEAD_SIZE,
            buffer: Vec::new(),
            buffer_offset: 0,
        }
    }

    /// Reads the record the handle points to.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the record is
    /// corrupt.
    pub fn get(&mut self, handle: &BlobHandle) -> crate::Result<BlobRecord> {
        let is_sequential = handle.offset == self.last_offset;
        self.last_offset = handle.offset + u64::from(handle.size);

        if !is_sequential {
            return self.reader.get(handle);
        }

        if !self.buffer_covers(handle) {
            self.fill_buffer(handle)?;
        }

        let start = (handle.offset - self.buffer_offset) as usize;
        let end = start + handle.size as usize;

        let frame = self
            .buffer
            .get(start..end)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short buffer"))?;

        decode_record(frame, self.reader.compression())
    }

    fn buffer_covers(&self, handle: &BlobHandle) -> bool {
        handle.offset >= self.buffer_offset
            && handle.offset + u64::from(handle.size)
                <= self.buffer_offset + self.buffer.len() as u64
    }

    fn fill_buffer(&mut self, handle: &BlobHandle) -> crate::Result<()> {
        let want = (handle.size as usize).max(self.readahead_size);

        // Clamp to the record region; the footer is never prefetched
        let available = self.reader.records_end().saturating_sub(handle.offset);
        let len = (want as u64).min(available);

        self.buffer = read_exact_at(
            &self.reader.file,
            BLOB_FILE_HEADER_LEN as u64 + handle.offset,
            len as usize,
        )?;
        self.buffer_offset = handle.offset;

        // Keep doubling while the access pattern stays sequential
        self.readahead_size = (self.readahead_size * 2).min(MAX_READAHEAD_SIZE);

        Ok(())
    }
}
