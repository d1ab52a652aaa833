// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    blob_file::BlobFileId,
    coding::{Decode, DecodeError, Encode, EncodeError},
    CompressionType, UserKey, UserValue,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

pub const BLOB_FILE_MAGIC: &[u8] = b"BLBF";
pub const BLOB_FOOTER_MAGIC: &[u8] = b"BLBT";

pub const BLOB_FILE_VERSION: u32 = 1;

/// Fixed header: magic (4) + version (4) + compression (1) + reserved (3)
pub const BLOB_FILE_HEADER_LEN: usize = BLOB_FILE_MAGIC.len() + std::mem::size_of::<u32>() + 4;

/// Fixed footer: meta index handle, zero padded (20) + magic (4)
pub const BLOB_FILE_FOOTER_LEN: usize = 20 + BLOB_FOOTER_MAGIC.len();

/// Record type tag of a blob record
///
/// A zero byte in its place is alignment padding, so scanners skip
/// to the next block boundary when they see one.
pub const BLOB_RECORD_TYPE: u8 = 1;

/// Tag byte of an encoded [`BlobIndex`], letting the LSM distinguish
/// an index entry from an inline value
pub const BLOB_INDEX_TAG: u8 = 1;

/// Blob files are aligned to, and carved up into, 4 KiB blocks
pub const BLOB_FILE_BLOCK_SIZE: u64 = 4_096;

/// A key-value pair stored in a blob file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobRecord {
    /// User key
    pub key: UserKey,

    /// User value (uncompressed)
    pub value: UserValue,
}

/// Points to a record inside a blob file
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct BlobHandle {
    /// Byte offset of the record frame in its file
    pub offset: u64,

    /// On-disk size of the record frame
    pub size: u32,
}

impl Encode for BlobHandle {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.offset)?;
        writer.write_u32_varint(self.size)?;
        Ok(())
    }
}

impl Decode for BlobHandle {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let offset = reader.read_u64_varint()?;
        let size = reader.read_u32_varint()?;
        Ok(Self { offset, size })
    }
}

/// The value the LSM stores for an externalized record
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct BlobIndex {
    /// Number of the blob file the record lives in
    pub file_number: BlobFileId,

    /// Location of the record inside that file
    pub handle: BlobHandle,
}

impl Encode for BlobIndex {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(BLOB_INDEX_TAG)?;
        writer.write_u64_varint(self.file_number)?;
        self.handle.encode_into(writer)?;
        Ok(())
    }
}

impl Decode for BlobIndex {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        if tag != BLOB_INDEX_TAG {
            return Err(DecodeError::InvalidTag(("BlobIndex", tag)));
        }

        let file_number = reader.read_u64_varint()?;
        let handle = BlobHandle::decode_from(reader)?;

        Ok(Self {
            file_number,
            handle,
        })
    }
}

/// Fixed blob file header
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobFileHeader {
    /// Compression codec used for all records in the file
    pub compression: CompressionType,
}

impl Encode for BlobFileHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(BLOB_FILE_MAGIC)?;
        writer.write_u32::<LittleEndian>(BLOB_FILE_VERSION)?;
        self.compression.encode_into(writer)?;

        // Reserved
        writer.write_all(&[0; 3])?;

        Ok(())
    }
}

impl Decode for BlobFileHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; BLOB_FILE_MAGIC.len()];
        reader.read_exact(&mut magic)?;

        if magic != BLOB_FILE_MAGIC {
            return Err(DecodeError::InvalidHeader("BlobFile"));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != BLOB_FILE_VERSION {
            return Err(DecodeError::InvalidHeader("BlobFileVersion"));
        }

        let compression = CompressionType::decode_from(reader)?;

        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;

        Ok(Self { compression })
    }
}

/// Fixed blob file footer, located by seeking to `file_size - BLOB_FILE_FOOTER_LEN`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobFileFooter {
    /// Points at the meta index block; its offset is also
    /// where the record region ends
    pub meta_index_handle: BlobHandle,
}

impl Encode for BlobFileFooter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut v = Vec::with_capacity(BLOB_FILE_FOOTER_LEN);

        self.meta_index_handle.encode_into(&mut v)?;

        // Pad with remaining bytes
        v.resize(BLOB_FILE_FOOTER_LEN - BLOB_FOOTER_MAGIC.len(), 0);

        v.write_all(BLOB_FOOTER_MAGIC)?;

        debug_assert_eq!(v.len(), BLOB_FILE_FOOTER_LEN, "footer has invalid size");

        writer.write_all(&v)?;

        Ok(())
    }
}

impl Decode for BlobFileFooter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut buf = [0u8; BLOB_FILE_FOOTER_LEN];
        reader.read_exact(&mut buf)?;

        let magic_start = BLOB_FILE_FOOTER_LEN - BLOB_FOOTER_MAGIC.len();

        if buf.get(magic_start..) != Some(BLOB_FOOTER_MAGIC) {
            return Err(DecodeError::InvalidHeader("BlobFileFooter"));
        }

        let mut cursor = buf.get(..magic_start).unwrap_or_default();
        let meta_index_handle = BlobHandle::decode_from(&mut cursor)?;

        Ok(Self { meta_index_handle })
    }
}

/// Computes the checksum of a record: the type byte, the key
/// and the *uncompressed* value.
#[must_use]
pub fn record_checksum(key: &[u8], value: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&[BLOB_RECORD_TYPE]);
    let crc = crc32c::crc32c_append(crc, key);
    crc32c::crc32c_append(crc, value)
}

/// Encodes a record frame, compressing the value with the file's codec.
///
/// Frame layout:
///
/// `type (1) | klen (varint) | vlen (varint) | compressed (1) | key | value | crc32c (4)`
///
/// `vlen` is the on-disk value length. If compression does not shrink
/// the value, it is stored raw and the compressed flag stays 0.
pub fn encode_record(
    key: &[u8],
    value: &[u8],
    compression: CompressionType,
) -> crate::Result<Vec<u8>> {
    debug_assert!(!key.is_empty());

    let (body, compressed_flag) = if compression == CompressionType::None {
        (None, 0)
    } else {
        let compressed = compression.compress(value)?;

        if compressed.len() < value.len() {
            (Some(compressed), 1)
        } else {
            (None, 0)
        }
    };
    let on_disk_value = body.as_deref().unwrap_or(value);

    let mut v = Vec::with_capacity(16 + key.len() + on_disk_value.len());

    v.write_u8(BLOB_RECORD_TYPE).map_err(EncodeError::from)?;
    v.write_u32_varint(key.len() as u32)
        .map_err(EncodeError::from)?;
    v.write_u32_varint(on_disk_value.len() as u32)
        .map_err(EncodeError::from)?;
    v.write_u8(compressed_flag).map_err(EncodeError::from)?;
    v.write_all(key).map_err(EncodeError::from)?;
    v.write_all(on_disk_value).map_err(EncodeError::from)?;
    v.write_u32::<LittleEndian>(record_checksum(key, value))
        .map_err(EncodeError::from)?;

    Ok(v)
}

/// Verifies a record body read from disk, decompressing it if needed.
pub fn verify_record_body(
    key: &[u8],
    on_disk_value: &[u8],
    is_compressed: bool,
    expected_checksum: u32,
    compression: CompressionType,
) -> crate::Result<UserValue> {
    let value: UserValue = if is_compressed {
        compression.decompress(on_disk_value)?.into()
    } else {
        on_disk_value.into()
    };

    let got = record_checksum(key, &value);

    if got != expected_checksum {
        log::error!("Checksum mismatch for blob record, got={got}, expected={expected_checksum}");

        return Err(crate::Error::ChecksumMismatch {
            got,
            expected: expected_checksum,
        });
    }

    Ok(value)
}

/// Decodes a full record frame, as read through a [`BlobHandle`].
pub fn decode_record(frame: &[u8], compression: CompressionType) -> crate::Result<BlobRecord> {
    let mut reader = frame;

    let record_type = reader.read_u8().map_err(DecodeError::from)?;
    if record_type != BLOB_RECORD_TYPE {
        return Err(DecodeError::InvalidTag(("BlobRecord", record_type)).into());
    }

    let key_len = reader.read_u32_varint().map_err(DecodeError::from)? as usize;
    let value_len = reader.read_u32_varint().map_err(DecodeError::from)? as usize;
    let is_compressed = reader.read_u8().map_err(DecodeError::from)? > 0;

    let key = UserKey::from_reader(&mut reader, key_len).map_err(DecodeError::from)?;
    let on_disk_value = UserValue::from_reader(&mut reader, value_len).map_err(DecodeError::from)?;
    let expected_checksum = reader.read_u32::<LittleEndian>().map_err(DecodeError::from)?;

    let value = verify_record_body(
        &key,
        &on_disk_value,
        is_compressed,
        expected_checksum,
        compression,
    )?;

    Ok(BlobRecord { key, value })
}
