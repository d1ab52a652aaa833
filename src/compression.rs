// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Compression algorithm to use
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// No compression
    None,

    /// LZ4 compression
    ///
    /// Recommended for use cases with a focus
    /// on speed over compression ratio.
    #[cfg(feature = "lz4")]
    Lz4,

    /// Snappy compression
    #[cfg(feature = "snappy")]
    Snappy,

    /// Zstandard compression
    ///
    /// Recommended for use cases with a focus
    /// on compression ratio over speed.
    #[cfg(feature = "zstd")]
    Zstd,
}

impl CompressionType {
    /// Compresses a chunk of data.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the codec fails.
    pub fn compress(self, data: &[u8]) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),

            #[cfg(feature = "lz4")]
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),

            #[cfg(feature = "snappy")]
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| crate::Error::Io(std::io::Error::other(e))),

            #[cfg(feature = "zstd")]
            Self::Zstd => Ok(zstd::stream::encode_all(data, 0)?),
        }
    }

    /// Decompresses a chunk of data.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the data is corrupt.
    pub fn decompress(self, data: &[u8]) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|_| crate::Error::Decompress(self)),

            #[cfg(feature = "snappy")]
            Self::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|_| crate::Error::Decompress(self)),

            #[cfg(feature = "zstd")]
            Self::Zstd => zstd::stream::decode_all(data).map_err(|_| crate::Error::Decompress(self)),
        }
    }
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::None => writer.write_u8(0)?,

            #[cfg(feature = "lz4")]
            Self::Lz4 => writer.write_u8(1)?,

            #[cfg(feature = "snappy")]
            Self::Snappy => writer.write_u8(2)?,

            #[cfg(feature = "zstd")]
            Self::Zstd => writer.write_u8(3)?,
        }

        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            0 => Ok(Self::None),

            #[cfg(feature = "lz4")]
            1 => Ok(Self::Lz4),

            #[cfg(feature = "snappy")]
            2 => Ok(Self::Snappy),

            #[cfg(feature = "zstd")]
            3 => Ok(Self::Zstd),

            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",

                #[cfg(feature = "lz4")]
                Self::Lz4 => "lz4",

                #[cfg(feature = "snappy")]
                Self::Snappy => "snappy",

                #[cfg(feature = "zstd")]
                Self::Zstd => "zstd",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_serialize_none() {
        let serialized = CompressionType::None.encode_into_vec();
        assert_eq!(1, serialized.len());
    }

    #[test]
    fn compression_decode_unknown_tag() {
        assert!(matches!(
            CompressionType::from_slice(&[17]),
            Err(DecodeError::InvalidTag(("CompressionType", 17))),
        ));
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn compression_roundtrip_lz4() -> crate::Result<()> {
        let data = b"the quick brown fox".repeat(100);
        let compressed = CompressionType::Lz4.compress(&data)?;
        assert!(compressed.len() < data.len());
        assert_eq!(data, &*CompressionType::Lz4.decompress(&compressed)?);
        Ok(())
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn compression_roundtrip_snappy() -> crate::Result<()> {
        let data = b"the quick brown fox".repeat(100);
        let compressed = CompressionType::Snappy.compress(&data)?;
        assert!(compressed.len() < data.len());
        assert_eq!(data, &*CompressionType::Snappy.decompress(&compressed)?);
        Ok(())
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn compression_roundtrip_zstd() -> crate::Result<()> {
        let data = b"the quick brown fox".repeat(100);
        let compressed = CompressionType::Zstd.compress(&data)?;
        assert!(compressed.len() < data.len());
        assert_eq!(data, &*CompressionType::Zstd.decompress(&compressed)?);
        Ok(())
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn compression_decompress_garbage() {
        assert!(matches!(
            CompressionType::Zstd.decompress(b"certainly not zstd"),
            Err(crate::Error::Decompress(CompressionType::Zstd)),
        ));
    }
}
