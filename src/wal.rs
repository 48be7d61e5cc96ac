//! The WAL instance: a single shard's append-only record log.
//!
//! `WalInstance` owns a directory of segment files and serializes all
//! mutating operations (`write`, `renew`, prune, `reset_version`) behind one
//! mutex. `fsync` is the deliberate exception: it takes its own lock over a
//! cloned file handle so a slow fsync never blocks a concurrent writer, and
//! a concurrent writer never blocks fsync either — at the cost of fsync
//! occasionally lagging one segment behind a `renew` that raced it, which is
//! harmless since the new segment has nothing unsynced yet.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{WalLevel, WalSettings};
use crate::error::WalError;
use crate::record::{MsgType, Record};
use crate::restore::{self, Apply, RestoreReport};
use crate::segment::{self, FileId, Segment};

/// An action for [`WalInstance::lifecycle_check`] to perform. Deciding
/// *when* to renew or prune (segment size, elapsed time, a checkpoint
/// landing) is the caller's policy; the WAL only knows how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Close the current segment and open a fresh one.
    Renew,
    /// Delete the oldest segment still eligible for pruning.
    Prune,
}

struct Inner {
    current: Option<Segment>,
    write_file_id: FileId,
    restore_file_id: FileId,
    f_offset: u64,
    version: u64,
    stopped: bool,
}

/// A per-shard write-ahead log.
pub struct WalInstance {
    shard_id: i32,
    dir: PathBuf,
    level: WalLevel,
    file_num: i64,
    fsync_period: Duration,
    inner: Mutex<Inner>,
    fsync_file: Mutex<Option<File>>,
}

impl WalInstance {
    /// Opens (creating if necessary) the WAL directory for `shard_id`. Does
    /// not open a segment for append and does not touch `version` — the
    /// caller must call [`Self::set_restore`] and then [`Self::restore`]
    /// before the first [`Self::write`], exactly as the design mandates
    /// ("An instance is opened by the caller, which calls restore before any
    /// append"). Until `restore` runs, `write` silently no-ops: there is no
    /// current fd yet.
    pub fn open(shard_id: i32, dir: impl AsRef<Path>, settings: &WalSettings) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            shard_id,
            dir,
            level: settings.level,
            file_num: settings.file_num,
            fsync_period: settings.fsync_period,
            inner: Mutex::new(Inner {
                current: None,
                write_file_id: -1,
                restore_file_id: -1,
                f_offset: 0,
                version: 0,
                stopped: false,
            }),
            fsync_file: Mutex::new(None),
        })
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Sets the restore starting point before calling [`Self::restore`]:
    /// `f_offset` is the byte offset into the oldest segment to resume from
    /// (a prior checkpoint partway through it), and `restore_file_id` is the
    /// file id that checkpoint belongs to — also the reference point
    /// [`Self::remove_one_old_file`] prunes against. A fresh instance with no
    /// prior checkpoint uses `f_offset = 0`.
    pub fn set_restore(&self, f_offset: u64, restore_file_id: FileId) {
        let mut inner = self.inner.lock();
        inner.f_offset = f_offset;
        inner.restore_file_id = restore_file_id;
    }

    /// Replays every segment in the directory through `apply`, then opens
    /// the current fd for subsequent appends: the newest segment on disk if
    /// one exists, or a freshly renewed segment `0` otherwise. Must be
    /// called exactly once, after [`Self::open`] and before the first
    /// [`Self::write`].
    pub fn restore<Ctx, A: Apply<Ctx>>(
        &self,
        apply: &A,
        ctx: &mut Ctx,
    ) -> Result<RestoreReport, WalError> {
        let (restore_file_id, f_offset, version_floor) = {
            let inner = self.inner.lock();
            (inner.restore_file_id, inner.f_offset, inner.version)
        };

        let report = restore::restore(&self.dir, restore_file_id, f_offset, version_floor, apply, ctx)?;

        let mut inner = self.inner.lock();
        inner.version = report.last_version;

        let newest = segment::get_new_file(&self.dir)?;
        if newest < 0 {
            drop(inner);
            self.renew()?;
        } else {
            let segment = Segment::open_append(&self.dir, newest)?;
            let fsync_file = segment.file().try_clone()?;
            inner.current = Some(segment);
            inner.write_file_id = newest;
            drop(inner);
            *self.fsync_file.lock() = Some(fsync_file);
        }

        info!(
            shard_id = self.shard_id,
            segments = report.segments_scanned,
            applied = report.records_applied,
            migrated = report.records_migrated,
            skipped_corrupt = report.records_skipped_corrupt,
            version = report.last_version,
            "WAL restore complete"
        );

        Ok(report)
    }

    pub fn get_version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Returns the highest durably observed version together with the
    /// current append offset inside `currentFd` (`0` if no segment is open).
    pub fn get_version_and_offset(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        let offset = inner.current.as_ref().map(Segment::size).unwrap_or(0);
        (inner.version, offset)
    }

    /// Overrides the version guard and the current append offset directly,
    /// bypassing the monotonic check `write` otherwise enforces. Used after
    /// a replica resync moves this shard's version backward or forward out
    /// of band: the peer's log has already replaced this instance's local
    /// segment data, so the current segment is truncated to `new_offset` to
    /// match. A no-op on the offset if no segment is currently open.
    pub fn reset_version(&self, new_version: u64, new_offset: u64) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        debug!(
            shard_id = self.shard_id,
            old_version = inner.version,
            new_version,
            new_offset,
            "resetting WAL version"
        );
        inner.version = new_version;
        if let Some(segment) = inner.current.as_mut() {
            segment.truncate_at(new_offset)?;
        }
        Ok(())
    }

    /// Appends a record if `version` is newer than the last one written.
    /// Returns the number of bytes written, or `0` if the write was skipped
    /// (stale version, `level == NoLog`, no open segment — including after
    /// [`Self::close`], which clears the current fd but otherwise leaves
    /// `write` a silent no-op rather than an error).
    /// Never fsyncs — callers on [`WalLevel::Fsync`] call [`Self::fsync`] on
    /// their own cadence.
    pub fn write(&self, msg_type: MsgType, version: u64, payload: Bytes) -> Result<u64, WalError> {
        let mut inner = self.inner.lock();

        if self.level == WalLevel::NoLog {
            trace!(shard_id = self.shard_id, "write skipped: level is NoLog");
            return Ok(0);
        }
        if version <= inner.version {
            trace!(shard_id = self.shard_id, version, last = inner.version, "write skipped: stale version");
            return Ok(0);
        }
        let segment = match inner.current.as_mut() {
            Some(s) => s,
            None => {
                warn!(shard_id = self.shard_id, "write skipped: no open segment");
                return Ok(0);
            }
        };

        let record = Record::new(msg_type, version, payload)?;
        let encoded = record.encode();
        segment.append_bytes(&encoded)?;
        inner.version = version;

        Ok(encoded.len() as u64)
    }

    /// Fsyncs the current segment. Does not take the main mutex: concurrent
    /// writers and fsync never block each other.
    ///
    /// Flushes when `force` is set, or when the level is [`WalLevel::Fsync`]
    /// and `fsync_period` is zero (no period configured means every call
    /// syncs). With a nonzero period, an unforced call is a no-op; the
    /// caller is expected to invoke `fsync(true)` on that cadence itself.
    pub fn fsync(&self, force: bool) -> Result<(), WalError> {
        if self.level != WalLevel::Fsync {
            return Ok(());
        }
        if !force && self.fsync_period != Duration::ZERO {
            return Ok(());
        }
        let mut guard = self.fsync_file.lock();
        if let Some(file) = guard.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Closes the current segment and opens a new one, id strictly greater
    /// than both the newest id on disk and the last id this instance wrote.
    pub fn renew(&self) -> Result<FileId, WalError> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            trace!(shard_id = self.shard_id, "renew skipped: instance stopped");
            return Ok(inner.write_file_id);
        }
        self.renew_locked(&mut inner)
    }

    fn renew_locked(&self, inner: &mut Inner) -> Result<FileId, WalError> {
        if let Some(segment) = inner.current.as_mut() {
            segment.sync()?;
        }

        let on_disk = segment::get_new_file(&self.dir)?;
        let new_id = on_disk.max(inner.write_file_id) + 1;

        let segment = Segment::create(&self.dir, new_id)?;
        let fsync_file = segment.file().try_clone()?;

        info!(shard_id = self.shard_id, file_id = new_id, "renewed WAL segment");

        inner.current = Some(segment);
        inner.write_file_id = new_id;
        *self.fsync_file.lock() = Some(fsync_file);

        Ok(new_id)
    }

    /// Deletes the oldest segment strictly older than `restore_file_id -
    /// file_num`, if one exists. Returns the id removed.
    pub fn remove_one_old_file(&self) -> Result<Option<FileId>, WalError> {
        let inner = self.inner.lock();
        let old = segment::get_old_file(&self.dir, inner.restore_file_id, self.file_num)?;
        drop(inner);

        if old < 0 {
            return Ok(None);
        }
        let segment = Segment::open_read_write(&self.dir, old)?;
        segment.remove()?;
        info!(shard_id = self.shard_id, file_id = old, "pruned old WAL segment");
        Ok(Some(old))
    }

    /// Deletes every segment file, including the one currently open for
    /// append, and resets write/version state. Used when a shard's entire
    /// log is invalidated (e.g. a full snapshot replaces it).
    pub fn remove_all_old_files(&self) -> Result<usize, WalError> {
        let mut inner = self.inner.lock();

        inner.current = None;
        *self.fsync_file.lock() = None;

        let ids = segment::list_segments(&self.dir)?;
        for id in &ids {
            let segment = Segment::open_read_write(&self.dir, *id)?;
            segment.remove()?;
        }

        inner.write_file_id = -1;
        inner.restore_file_id = -1;
        inner.version = 0;

        info!(shard_id = self.shard_id, count = ids.len(), "removed all WAL segments");
        Ok(ids.len())
    }

    /// Performs one lifecycle action. Deciding when to call this (segment
    /// size, a new checkpoint landing) is the caller's responsibility.
    pub fn lifecycle_check(&self, action: LifecycleAction) -> Result<(), WalError> {
        match action {
            LifecycleAction::Renew => {
                self.renew()?;
                Ok(())
            }
            LifecycleAction::Prune => {
                self.remove_one_old_file()?;
                Ok(())
            }
        }
    }

    /// Returns the path of segment `file_id` and whether it's the segment
    /// currently open for append, if it exists on disk.
    pub fn get_wal_file(&self, file_id: FileId) -> Result<(PathBuf, bool), WalError> {
        let path = self.dir.join(segment::segment_filename(file_id));
        if !path.exists() {
            return Err(WalError::SegmentNotFound(file_id));
        }
        let is_current = self.inner.lock().write_file_id == file_id;
        Ok((path, is_current))
    }

    pub fn write_file_id(&self) -> FileId {
        self.inner.lock().write_file_id
    }

    /// Size in bytes of the currently open segment. Lets the caller decide
    /// when to call [`Self::renew`] against its configured segment size cap
    /// (`WalSettings::max_size`) — the WAL itself doesn't roll on size.
    pub fn current_segment_size(&self) -> u64 {
        self.inner
            .lock()
            .current
            .as_ref()
            .map(Segment::size)
            .unwrap_or(0)
    }

    /// Flushes and closes the current segment. Further writes silently
    /// no-op, same as any other call with no current fd (spec.md §7: "no
    /// current fd on write" drops silently, it is never surfaced as an
    /// error).
    pub fn close(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        if let Some(segment) = inner.current.as_mut() {
            segment.sync()?;
        }
        inner.current = None;
        inner.stopped = true;
        *self.fsync_file.lock() = None;
        Ok(())
    }
}
