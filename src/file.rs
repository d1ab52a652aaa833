// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blob_file::BlobFileId;
use std::{
    fs::File,
    path::{Path, PathBuf},
};

/// File extension of blob files
pub const BLOB_FILE_EXTENSION: &str = "blob";

/// Name of the blob manifest file
pub const MANIFEST_FILE: &str = "BLOB_MANIFEST";

/// Returns the path of a blob file inside a folder.
#[must_use]
pub fn blob_file_path(folder: &Path, file_number: BlobFileId) -> PathBuf {
    folder.join(format!("{file_number:06}.{BLOB_FILE_EXTENSION}"))
}

/// Parses a blob file number from a file name, if it is one.
#[must_use]
pub fn parse_blob_file_name(name: &str) -> Option<BlobFileId> {
    let number = name.strip_suffix(&format!(".{BLOB_FILE_EXTENSION}"))?;
    number.parse::<BlobFileId>().ok()
}

/// Reads bytes from a file using `pread`.
pub fn read_exact_at(file: &File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0; size];

    {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            file.read_exact_at(&mut buf, offset)?;
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;

            let mut pos = 0;
            while pos < size {
                let read = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
                if read == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "unexpected EOF in pread",
                    ));
                }
                pos += read;
            }
        }
    }

    Ok(buf)
}

/// Punches a hole into a file, deallocating the physical space of the
/// given range while keeping the logical file size unchanged.
///
/// On platforms without hole punching support this is a no-op.
#[allow(unused_variables)]
#[allow(unsafe_code)]
pub fn punch_hole(file: &File, offset: u64, len: u64) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        // NOTE: i64 casts: offsets are far below 2^63
        #[allow(clippy::cast_possible_wrap)]
        let result = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };

        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        log::trace!("Hole punching is not supported on this platform");
    }

    Ok(())
}

/// Fsyncs a directory, making file creations and deletions durable.
#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

/// Fsyncs a directory, making file creations and deletions durable.
#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directories on Windows
    Ok(())
}
