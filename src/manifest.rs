// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    blob_file::BlobFileId,
    coding::{Decode, DecodeError, Encode, EncodeError},
    file::fsync_directory,
    lsm::ColumnFamilyId,
    SeqNo,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Cursor, Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};
use varint_rs::{VarintReader, VarintWriter};

const ADD_FILE_TAG: u8 = 1;
const DELETE_FILE_TAG: u8 = 2;

/// One edit of the blob file inventory
///
/// Replayed in order on recovery to reconstruct each column family's
/// [`BlobStorage`](crate::BlobStorage).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ManifestEdit {
    /// A blob file was published
    AddFile {
        /// Column family the file belongs to
        cf_id: ColumnFamilyId,

        /// File number
        file_number: BlobFileId,

        /// Size of the file in bytes
        file_size: u64,
    },

    /// A blob file became unreferenced
    DeleteFile {
        /// Column family the file belongs to
        cf_id: ColumnFamilyId,

        /// File number
        file_number: BlobFileId,

        /// LSM sequence number at the time of obsolescence
        obsolete_seq: SeqNo,
    },
}

impl Encode for ManifestEdit {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::AddFile {
                cf_id,
                file_number,
                file_size,
            } => {
                writer.write_u8(ADD_FILE_TAG)?;
                writer.write_u32_varint(*cf_id)?;
                writer.write_u64_varint(*file_number)?;
                writer.write_u64_varint(*file_size)?;
            }
            Self::DeleteFile {
                cf_id,
                file_number,
                obsolete_seq,
            } => {
                writer.write_u8(DELETE_FILE_TAG)?;
                writer.write_u32_varint(*cf_id)?;
                writer.write_u64_varint(*file_number)?;
                writer.write_u64_varint(*obsolete_seq)?;
            }
        }

        Ok(())
    }
}

impl Decode for ManifestEdit {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            ADD_FILE_TAG => Ok(Self::AddFile {
                cf_id: reader.read_u32_varint()?,
                file_number: reader.read_u64_varint()?,
                file_size: reader.read_u64_varint()?,
            }),
            DELETE_FILE_TAG => Ok(Self::DeleteFile {
                cf_id: reader.read_u32_varint()?,
                file_number: reader.read_u64_varint()?,
                obsolete_seq: reader.read_u64_varint()?,
            }),
            tag => Err(DecodeError::InvalidTag(("ManifestEdit", tag))),
        }
    }
}

/// The append-only log of blob inventory edits
///
/// Each record frames one edit as `len (4) | crc32c (4) | payload`.
/// A torn record at the tail (from a crash mid-append) ends recovery;
/// everything before it is intact.
pub struct Manifest {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl Manifest {
    /// Opens (or creates) the manifest, replaying all existing edits.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open<P: Into<PathBuf>>(path: P) -> crate::Result<(Self, Vec<ManifestEdit>)> {
        let path = path.into();

        let exists = path.try_exists()?;

        let edits = if exists {
            Self::replay(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        if !exists {
            file.sync_all()?;

            if let Some(folder) = path.parent() {
                fsync_directory(folder)?;
            }
        }

        log::debug!(
            "Opened blob manifest at {} with {} edit(s)",
            path.display(),
            edits.len(),
        );

        Ok((
            Self {
                path,
                writer: Mutex::new(BufWriter::new(file)),
            },
            edits,
        ))
    }

    /// Returns the manifest's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> crate::Result<Vec<ManifestEdit>> {
        let bytes = std::fs::read(path)?;
        let mut cursor = Cursor::new(&bytes);

        let mut edits = vec![];

        loop {
            let Ok(len) = cursor.read_u32::<LittleEndian>() else {
                break;
            };
            let Ok(expected_crc) = cursor.read_u32::<LittleEndian>() else {
                log::warn!("Torn record at blob manifest tail, stopping recovery");
                break;
            };

            let mut payload = vec![0; len as usize];
            if cursor.read_exact(&mut payload).is_err() {
                log::warn!("Torn record at blob manifest tail, stopping recovery");
                break;
            }

            if crc32c::crc32c(&payload) != expected_crc {
                log::warn!("Checksum mismatch at blob manifest tail, stopping recovery");
                break;
            }

            edits.push(ManifestEdit::from_slice(&payload)?);
        }

        Ok(edits)
    }

    /// Appends edits and syncs them to disk.
    ///
    /// The edits are durable once this returns.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn log_edits(&self, edits: &[ManifestEdit]) -> crate::Result<()> {
        let mut writer = self.writer.lock().expect("lock is poisoned");

        for edit in edits {
            let payload = edit.encode_into_vec();

            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<LittleEndian>(payload.len() as u32)?;
            writer.write_u32::<LittleEndian>(crc32c::crc32c(&payload))?;
            writer.write_all(&payload)?;
        }

        writer.flush()?;
        writer.get_mut().sync_all()?;

        Ok(())
    }
}
