// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::BlobFileId;
use crate::{
    coding::Encode,
    format::{
        encode_record, BlobFileFooter, BlobFileHeader, BlobHandle, BLOB_FILE_BLOCK_SIZE,
        BLOB_FILE_FOOTER_LEN, BLOB_FILE_HEADER_LEN,
    },
    CompressionType, Error,
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Appends records to a single append-only blob file
///
/// Handle offsets are relative to the record region, which begins right
/// after the fixed file header; the region start anchors the 4 KiB
/// alignment grid.
///
/// Errors are sticky: once a write fails, further [`BlobFileBuilder::add`]
/// calls are no-ops and [`BlobFileBuilder::finish`] surfaces the original
/// cause.
pub struct BlobFileBuilder {
    path: PathBuf,
    file_number: BlobFileId,

    writer: BufWriter<File>,

    /// Offset of the next record, relative to the record region
    offset: u64,

    item_count: u64,
    compression: CompressionType,

    err: Option<Error>,
}

impl BlobFileBuilder {
    /// Creates a new blob file, writing its header.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn new<P: AsRef<Path>>(
        path: P,
        file_number: BlobFileId,
        compression: CompressionType,
    ) -> crate::Result<Self> {
        let path = path.as_ref();

        let mut writer = BufWriter::new(File::create(path)?);

        let header = BlobFileHeader { compression };
        header.encode_into(&mut writer)?;

        Ok(Self {
            path: path.into(),
            file_number,

            writer,
            offset: 0,

            item_count: 0,
            compression,

            err: None,
        })
    }

    /// Returns the file number.
    #[must_use]
    pub fn file_number(&self) -> BlobFileId {
        self.file_number
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the file, including buffered bytes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        BLOB_FILE_HEADER_LEN as u64 + self.offset
    }

    /// Returns the number of records written so far.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Returns `true` if no write has failed so far.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.err.is_none()
    }

    /// Returns the first error encountered, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Appends a record, returning the handle it can be read back with.
    ///
    /// A record that would straddle a 4 KiB block boundary from an
    /// unaligned offset is pushed to the next boundary with zero padding,
    /// so a record either starts block-aligned or fits entirely inside
    /// the block its offset lies in.
    ///
    /// Returns `None` once the builder has failed.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Option<BlobHandle> {
        if self.err.is_some() {
            return None;
        }

        match self.add_inner(key, value) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!(
                    "Failed to append record to blob file {}: {e:?}",
                    self.file_number,
                );
                self.err = Some(e);
                None
            }
        }
    }

    fn add_inner(&mut self, key: &[u8], value: &[u8]) -> crate::Result<BlobHandle> {
        let frame = encode_record(key, value, self.compression)?;
        let size = frame.len() as u64;

        let block_remaining = BLOB_FILE_BLOCK_SIZE - (self.offset % BLOB_FILE_BLOCK_SIZE);

        if block_remaining < BLOB_FILE_BLOCK_SIZE && size > block_remaining {
            self.pad(block_remaining)?;
        }

        let offset = self.offset;

        self.writer.write_all(&frame)?;
        self.offset += size;
        self.item_count += 1;

        #[allow(clippy::cast_possible_truncation)]
        Ok(BlobHandle {
            offset,
            size: size as u32,
        })
    }

    fn pad(&mut self, bytes: u64) -> crate::Result<()> {
        const ZEROES: [u8; 512] = [0; 512];

        let mut remaining = bytes as usize;
        while remaining > 0 {
            let n = remaining.min(ZEROES.len());
            self.writer.write_all(ZEROES.get(..n).unwrap_or_default())?;
            remaining -= n;
        }

        self.offset += bytes;

        Ok(())
    }

    /// Writes the footer, flushes and syncs the file, and returns the
    /// final file length.
    ///
    /// # Errors
    ///
    /// Surfaces the first sticky error, or any error that occurs while
    /// finishing.
    pub fn finish(mut self) -> crate::Result<u64> {
        if let Some(e) = self.err.take() {
            return Err(e);
        }

        // The (empty) meta index block begins where the records end
        let footer = BlobFileFooter {
            meta_index_handle: BlobHandle {
                offset: self.offset,
                size: 0,
            },
        };
        footer.encode_into(&mut self.writer)?;

        self.writer.flush()?;
        self.writer.get_mut().sync_all()?;

        let file_size =
            (BLOB_FILE_HEADER_LEN + BLOB_FILE_FOOTER_LEN) as u64 + self.offset;

        log::trace!(
            "Finished blob file {} with {} records, {file_size}B",
            self.file_number,
            self.item_count,
        );

        Ok(file_size)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn builder_first_record_at_offset_zero() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000001.blob");

        let mut builder = BlobFileBuilder::new(&path, 1, CompressionType::None)?;
        let handle = builder.add(b"a", b"hello").unwrap();

        assert_eq!(0, handle.offset);
        assert!(builder.ok());

        let file_size = builder.finish()?;
        assert_eq!(file_size, std::fs::metadata(&path)?.len());

        Ok(())
    }

    #[test]
    fn builder_pads_across_boundary() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000002.blob");

        let mut builder = BlobFileBuilder::new(&path, 2, CompressionType::None)?;

        // Fill most of the first block
        let first = builder.add(b"a", &[0xAA; 3_000]).unwrap();
        assert!(first.offset + u64::from(first.size) < BLOB_FILE_BLOCK_SIZE);

        // Does not fit into the remainder of the block
        let second = builder.add(b"b", &[0xBB; 2_000]).unwrap();
        assert_eq!(BLOB_FILE_BLOCK_SIZE, second.offset);

        builder.finish()?;

        Ok(())
    }

    #[test]
    fn builder_oversized_record_starts_aligned() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000003.blob");

        let mut builder = BlobFileBuilder::new(&path, 3, CompressionType::None)?;

        builder.add(b"a", &[0xAA; 100]).unwrap();

        let big = builder.add(b"b", &[0xBB; 10_000]).unwrap();
        assert_eq!(0, big.offset % BLOB_FILE_BLOCK_SIZE);

        builder.finish()?;

        Ok(())
    }
}
