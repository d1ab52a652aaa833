// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::BlobFileId;
use crate::{
    coding::{Decode, DecodeError},
    file::read_exact_at,
    format::{
        verify_record_body, BlobFileFooter, BlobFileHeader, BlobHandle, BlobIndex,
        BLOB_FILE_BLOCK_SIZE, BLOB_FILE_FOOTER_LEN, BLOB_FILE_HEADER_LEN, BLOB_RECORD_TYPE,
    },
    CompressionType, UserKey, UserValue,
};
use byteorder::{LittleEndian, ReadBytesExt};
use std::{
    fs::File,
    io::{BufReader, Seek, SeekFrom},
    path::Path,
};
use varint_rs::VarintReader;

/// A record yielded by a blob file scan
#[derive(Debug)]
pub struct ScanEntry {
    /// User key
    pub key: UserKey,

    /// User value (uncompressed)
    pub value: UserValue,

    /// Location of the record, as its index entry in the LSM would
    /// reference it
    pub index: BlobIndex,
}

/// Reads through a blob file in order
///
/// One-shot and not restartable; termination (end of data, corruption,
/// IO error) is observable through the final `Option<Result>` item.
pub struct BlobFileIterator {
    file_number: BlobFileId,

    inner: BufReader<File>,
    compression: CompressionType,

    /// Offset of the next record, relative to the record region
    offset: u64,

    /// Length of the record region
    records_end: u64,

    is_terminated: bool,
}

impl BlobFileIterator {
    /// Opens a blob file for scanning, validating header and footer.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if header or footer
    /// are corrupt.
    pub fn new<P: AsRef<Path>>(
        path: P,
        file_number: BlobFileId,
        file_size: u64,
    ) -> crate::Result<Self> {
        let file = File::open(path)?;

        let footer = {
            let offset = file_size
                .checked_sub(BLOB_FILE_FOOTER_LEN as u64)
                .ok_or(DecodeError::InvalidHeader("BlobFileFooter"))?;

            let bytes = read_exact_at(&file, offset, BLOB_FILE_FOOTER_LEN)?;
            BlobFileFooter::from_slice(&bytes)?
        };

        let header = {
            let bytes = read_exact_at(&file, 0, BLOB_FILE_HEADER_LEN)?;
            BlobFileHeader::from_slice(&bytes)?
        };

        let mut inner = BufReader::with_capacity(32_000, file);
        inner.seek(SeekFrom::Start(BLOB_FILE_HEADER_LEN as u64))?;

        Ok(Self {
            file_number,
            inner,
            compression: header.compression,
            offset: 0,
            records_end: footer.meta_index_handle.offset,
            is_terminated: false,
        })
    }

    /// Returns the blob file number.
    #[must_use]
    pub fn file_number(&self) -> BlobFileId {
        self.file_number
    }

    fn read_entry(&mut self) -> crate::Result<Option<ScanEntry>> {
        loop {
            if self.offset >= self.records_end {
                return Ok(None);
            }

            let record_type = self.inner.read_u8().map_err(DecodeError::from)?;

            if record_type == BLOB_RECORD_TYPE {
                break;
            }

            if record_type == 0 {
                // Alignment padding; skip to the next block boundary
                let next_block =
                    (self.offset / BLOB_FILE_BLOCK_SIZE + 1) * BLOB_FILE_BLOCK_SIZE;

                #[allow(clippy::cast_possible_wrap)]
                self.inner
                    .seek_relative((next_block - self.offset - 1) as i64)?;
                self.offset = next_block;
                continue;
            }

            return Err(DecodeError::InvalidTag(("BlobRecord", record_type)).into());
        }

        let frame_start = self.offset;

        let key_len = self.inner.read_u32_varint().map_err(DecodeError::from)?;
        let value_len = self.inner.read_u32_varint().map_err(DecodeError::from)?;
        let is_compressed = self.inner.read_u8().map_err(DecodeError::from)? > 0;

        let key = UserKey::from_reader(&mut self.inner, key_len as usize)
            .map_err(DecodeError::from)?;
        let on_disk_value = UserValue::from_reader(&mut self.inner, value_len as usize)
            .map_err(DecodeError::from)?;
        let expected_checksum = self
            .inner
            .read_u32::<LittleEndian>()
            .map_err(DecodeError::from)?;

        let frame_len = 1
            + varint_len(u64::from(key_len))
            + varint_len(u64::from(value_len))
            + 1
            + u64::from(key_len)
            + u64::from(value_len)
            + 4;
        self.offset = frame_start + frame_len;

        let value = verify_record_body(
            &key,
            &on_disk_value,
            is_compressed,
            expected_checksum,
            self.compression,
        )
        .inspect_err(|e| {
            log::error!(
                "Corrupt record in blob file {}@{frame_start}: {e:?}",
                self.file_number,
            );
        })?;

        #[allow(clippy::cast_possible_truncation)]
        let size = frame_len as u32;

        Ok(Some(ScanEntry {
            key,
            value,
            index: BlobIndex {
                file_number: self.file_number,
                handle: BlobHandle {
                    offset: frame_start,
                    size,
                },
            },
        }))
    }
}

fn varint_len(mut value: u64) -> u64 {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

impl Iterator for BlobFileIterator {
    type Item = crate::Result<ScanEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_terminated {
            return None;
        }

        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.is_terminated = true;
                None
            }
            Err(e) => {
                self.is_terminated = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::blob_file::builder::BlobFileBuilder;
    use test_log::test;

    #[test]
    fn blob_iterator_scan() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000001.blob");

        let keys: [&[u8]; 5] = [b"a", b"b", b"c", b"d", b"e"];

        let mut handles = vec![];

        {
            let mut builder = BlobFileBuilder::new(&path, 1, CompressionType::None)?;
            for key in keys {
                handles.push(builder.add(key, &key.repeat(100)).unwrap());
            }
            builder.finish()?;
        }

        let file_size = std::fs::metadata(&path)?.len();
        let mut iter = BlobFileIterator::new(&path, 1, file_size)?;

        for (key, handle) in keys.iter().zip(&handles) {
            let entry = iter.next().unwrap()?;
            assert_eq!(entry.key, *key);
            assert_eq!(entry.value, &*key.repeat(100));
            assert_eq!(&entry.index.handle, handle);
            assert_eq!(1, entry.index.file_number);
        }

        assert!(iter.next().is_none());
        assert!(iter.next().is_none());

        Ok(())
    }

    #[test]
    fn blob_iterator_skips_padding() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000001.blob");

        {
            let mut builder = BlobFileBuilder::new(&path, 1, CompressionType::None)?;

            // Two records that force padding in between
            builder.add(b"a", &[0xAA; 3_000]).unwrap();
            builder.add(b"b", &[0xBB; 2_000]).unwrap();
            builder.finish()?;
        }

        let file_size = std::fs::metadata(&path)?.len();
        let iter = BlobFileIterator::new(&path, 1, file_size)?;

        let entries = iter.collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(2, entries.len());

        let second = entries.get(1).unwrap();
        assert_eq!(BLOB_FILE_BLOCK_SIZE, second.index.handle.offset);

        Ok(())
    }
}
