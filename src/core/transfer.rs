//! Placing pulled files at the destination.
//!
//! All functions here block on file I/O and are run from `spawn_blocking`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::debug;

/// Buffer size for file I/O operations (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceOutcome {
    Placed { bytes: u64 },
    /// Something already sits at the destination path; nothing was written.
    AlreadyExists,
}

#[derive(Debug)]
pub struct PlaceError {
    pub message: String,
    /// The destination itself refuses writes (read-only, full, no access).
    pub destination_unwritable: bool,
}

impl PlaceError {
    fn new(context: &str, path: &Path, e: &io::Error) -> Self {
        Self {
            message: format!("{context} {}: {e}", path.display()),
            destination_unwritable: is_destination_unwritable(e),
        }
    }
}

/// Map a `/`-separated relative path onto a local base directory.
pub fn local_path(base: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .fold(base.to_path_buf(), |path, segment| path.join(segment))
}

/// Copy `source` to a new file at `dest`, fsync it, and apply `mtime`.
///
/// Never overwrites: an existing `dest` yields `AlreadyExists`. A partially
/// written destination is removed so a re-run does not mistake it for a
/// finished copy.
pub fn place_file(source: &Path, dest: &Path, mtime: Option<i64>) -> Result<PlaceOutcome, PlaceError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PlaceError::new("Failed to create directory", parent, &e))?;
    }

    let dest_file = match OpenOptions::new().write(true).create_new(true).open(dest) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(PlaceOutcome::AlreadyExists),
        Err(e) => return Err(PlaceError::new("Failed to create", dest, &e)),
    };

    let bytes = match copy_into(source, dest, dest_file) {
        Ok(bytes) => bytes,
        Err(err) => {
            if let Err(e) = fs::remove_file(dest) {
                debug!(dest = %dest.display(), error = %e, "Failed to remove partial copy");
            }
            return Err(err);
        }
    };

    if let Some(mtime) = mtime {
        let time = FileTime::from_unix_time(mtime, 0);
        if let Err(e) = filetime::set_file_mtime(dest, time) {
            debug!(dest = %dest.display(), error = %e, "Failed to apply device modification time");
        }
    }

    Ok(PlaceOutcome::Placed { bytes })
}

fn copy_into(source: &Path, dest: &Path, dest_file: File) -> Result<u64, PlaceError> {
    let source_file =
        File::open(source).map_err(|e| PlaceError::new("Failed to open", source, &e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| PlaceError::new("Failed to read", source, &e))?;
        if bytes_read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| PlaceError::new("Failed to write", dest, &e))?;
        bytes_written += bytes_read as u64;
    }

    writer
        .flush()
        .map_err(|e| PlaceError::new("Failed to flush", dest, &e))?;
    let inner = writer
        .into_inner()
        .map_err(|e| PlaceError::new("Failed to flush", dest, e.error()))?;
    inner
        .sync_all()
        .map_err(|e| PlaceError::new("Failed to sync", dest, &e))?;

    Ok(bytes_written)
}

/// Hash a file using BLAKE3, streaming in chunks.
pub fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// True when both files hash the same.
pub fn same_contents(a: &Path, b: &Path) -> io::Result<bool> {
    Ok(hash_file(a)? == hash_file(b)?)
}

/// Check if an I/O error means the destination cannot take any more writes.
pub fn is_destination_unwritable(error: &io::Error) -> bool {
    if error.kind() == ErrorKind::PermissionDenied {
        return true;
    }
    error.raw_os_error().is_some_and(|code| {
        matches!(
            code,
            libc::EROFS | libc::ENOSPC | libc::EDQUOT | libc::EACCES | libc::EPERM
        )
    })
}
