//! Segment file manager.
//!
//! A segment is one file named `{WAL_PREFIX}{file_id}` holding a contiguous
//! run of records with no framing beyond the records' own headers. This
//! module enumerates segment ids by scanning the WAL directory — no index
//! file is maintained — and exposes the directory queries the writer and
//! lifecycle controller need: the next id after a given one, the newest id
//! present, and the oldest id safe to prune.

use crate::error::WalError;
use crate::WAL_PREFIX;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Segment identifier. Non-negative values name an on-disk segment;
/// negative values (conventionally `-1`) mean "no such segment", matching
/// the sentinel the directory queries return when nothing matches.
pub type FileId = i64;

/// Returns the filename for a segment, e.g. `wal7`.
pub fn segment_filename(id: FileId) -> String {
    format!("{WAL_PREFIX}{id}")
}

/// Parses a segment id out of a directory entry name, or `None` if the name
/// doesn't match the `{WAL_PREFIX}{decimal}` pattern.
pub fn parse_segment_filename(name: &str) -> Option<FileId> {
    let digits = name.strip_prefix(WAL_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<FileId>().ok()
}

/// Lists every segment id present in `dir`, ascending.
pub fn list_segments(dir: &Path) -> Result<Vec<FileId>, WalError> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(id) = parse_segment_filename(&name.to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// The smallest id strictly greater than `after`. `-1` means "start from the
/// beginning" per the restore caller's convention of passing `restoreFileId - 1`.
pub fn get_next_file(dir: &Path, after: FileId) -> Result<FileId, WalError> {
    let ids = list_segments(dir)?;
    Ok(ids
        .into_iter()
        .find(|&id| id > after)
        .unwrap_or(-1))
}

/// The largest id present, or `-1` if the directory holds no segments.
pub fn get_new_file(dir: &Path) -> Result<FileId, WalError> {
    let ids = list_segments(dir)?;
    Ok(ids.into_iter().max().unwrap_or(-1))
}

/// The oldest id strictly less than `from_id - keep`, or `-1` if none
/// qualifies. Used by prune to find segments safe to delete.
pub fn get_old_file(dir: &Path, from_id: FileId, keep: i64) -> Result<FileId, WalError> {
    let threshold = from_id - keep;
    let ids = list_segments(dir)?;
    Ok(ids.into_iter().find(|&id| id < threshold).unwrap_or(-1))
}

/// One open segment file.
pub struct Segment {
    id: FileId,
    path: PathBuf,
    file: File,
    size: u64,
}

impl Segment {
    /// Creates a brand-new segment file for append, failing if it already exists.
    pub fn create(dir: &Path, id: FileId) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            id,
            path,
            file,
            size: 0,
        })
    }

    /// Opens an existing segment for append, seeking to end-of-file.
    pub fn open_append(dir: &Path, id: FileId) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .append(true)
            .open(&path)?;
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            id,
            path,
            file,
            size,
        })
    }

    /// Opens an existing segment read-write without implying append semantics
    /// (used by the restorer, which seeks freely within the file).
    pub fn open_read_write(dir: &Path, id: FileId) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            id,
            path,
            file,
            size,
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    /// Appends raw bytes at the current end of file, returning the offset the
    /// write started at. A short write still advances `size` by what was
    /// actually written, leaving the caller to surface `Io` and rely on
    /// restore-time truncation to drop the partial tail.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<u64, WalError> {
        let offset = self.size;
        self.file.seek(SeekFrom::End(0))?;
        match self.file.write(bytes) {
            Ok(n) => {
                self.size += n as u64;
                if n != bytes.len() {
                    return Err(WalError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "short write to WAL segment",
                    )));
                }
                Ok(offset)
            }
            Err(e) => {
                Err(WalError::Io(e))
            }
        }
    }

    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Truncates the file to `offset` and fsyncs, for recovery from a
    /// partial write or an unrecoverable corruption tail.
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), WalError> {
        self.file.set_len(offset)?;
        self.size = offset;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn remove(self) -> Result<(), WalError> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }
}
