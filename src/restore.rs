//! Replay of WAL segments at startup.
//!
//! [`restore`] walks every segment in ascending file-id order, handing each
//! valid record to the caller's [`Apply`] sink. A segment that ends in a
//! partial write is truncated to its last valid record; a segment with a
//! corrupt record in the middle is resynchronized via
//! [`crate::record::skip_corrupted`] and scanning continues past it. A
//! failure reading one segment (a genuine I/O error, not a corruption) does
//! not abort the whole restore — it's recorded in the returned
//! [`RestoreReport`] and the next segment is still attempted, since later
//! segments carry newer data the caller needs regardless.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::WalError;
use crate::migration;
use crate::record::{self, Header, MsgType, Sver};
use crate::segment::{self, FileId, Segment};
use crate::RECORD_HEADER_SIZE;

/// Where a replayed record came from. Currently always [`Source::Wal`]; the
/// variant exists so callers can distinguish WAL-sourced applies from other
/// replay sources without a breaking API change later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Wal,
}

/// The caller-supplied replay sink. `Ctx` is whatever state the caller
/// threads through restore (a state machine, a table cache, ...) — the WAL
/// never inspects it, only passes it through.
pub trait Apply<Ctx> {
    fn apply(
        &self,
        ctx: &mut Ctx,
        header: &Header,
        payload: &[u8],
        source: Source,
    ) -> Result<(), WalError>;
}

impl<Ctx, F> Apply<Ctx> for F
where
    F: Fn(&mut Ctx, &Header, &[u8], Source) -> Result<(), WalError>,
{
    fn apply(
        &self,
        ctx: &mut Ctx,
        header: &Header,
        payload: &[u8],
        source: Source,
    ) -> Result<(), WalError> {
        (self)(ctx, header, payload, source)
    }
}

/// Aggregated outcome of a full restore across every segment in a WAL
/// directory. Earlier designs returned only the last segment's error code;
/// this instead keeps going and reports every segment's outcome, since a
/// single bad segment among many otherwise hides replayable data after it.
#[derive(Debug, Default, Clone)]
pub struct RestoreReport {
    pub segments_scanned: usize,
    pub records_applied: u64,
    pub records_migrated: u64,
    pub records_skipped_corrupt: u64,
    pub last_version: u64,
    pub last_file_id: FileId,
    pub segment_errors: Vec<(FileId, String)>,
}

impl RestoreReport {
    fn merge(&mut self, other: SegmentOutcome) {
        self.records_applied += other.records_applied;
        self.records_migrated += other.records_migrated;
        self.records_skipped_corrupt += other.records_skipped_corrupt;
        if other.last_version > self.last_version {
            self.last_version = other.last_version;
        }
    }
}

#[derive(Debug, Default)]
struct SegmentOutcome {
    records_applied: u64,
    records_migrated: u64,
    records_skipped_corrupt: u64,
    last_version: u64,
}

/// Replays every segment under `dir` with id `>= restore_file_id`, in
/// ascending order, walked via [`segment::get_next_file`] starting at
/// `restore_file_id - 1` rather than a full directory listing — a segment
/// older than `restore_file_id` (a prior checkpoint) is never reopened.
/// `f_offset` is the byte offset to start the *first* restored segment from
/// (a checkpoint partway through it); every later segment is read from its
/// start. `version_floor` suppresses re-applying records already known to
/// be durable elsewhere (idempotent restore after a partial prior restore).
pub fn restore<Ctx, A: Apply<Ctx>>(
    dir: &Path,
    restore_file_id: FileId,
    f_offset: u64,
    version_floor: u64,
    apply: &A,
    ctx: &mut Ctx,
) -> Result<RestoreReport, WalError> {
    let mut report = RestoreReport::default();
    let mut floor = version_floor;
    let mut after = restore_file_id - 1;
    let mut first = true;

    loop {
        let id = segment::get_next_file(dir, after)?;
        if id < 0 {
            break;
        }
        let start_offset = if first { f_offset } else { 0 };
        first = false;

        match restore_one_file(dir, id, start_offset, floor, apply, ctx) {
            Ok(outcome) => {
                floor = floor.max(outcome.last_version);
                report.merge(outcome);
                report.last_file_id = id;
            }
            Err(e) => {
                tracing::error!(file_id = id, error = %e, "failed to restore WAL segment");
                report.segment_errors.push((id, e.to_string()));
            }
        }
        report.segments_scanned += 1;
        after = id;
    }

    report.last_version = floor;
    Ok(report)
}

/// Replays one segment starting at `start_offset`, applying every valid
/// record whose version is greater than `version_floor`. Truncates the
/// segment at the first irrecoverable tail (a partial header or payload at
/// EOF); resynchronizes past any corrupt record found mid-file.
fn restore_one_file<Ctx, A: Apply<Ctx>>(
    dir: &Path,
    file_id: FileId,
    start_offset: u64,
    version_floor: u64,
    apply: &A,
    ctx: &mut Ctx,
) -> Result<SegmentOutcome, WalError> {
    let mut segment = Segment::open_read_write(dir, file_id)?;
    let mut outcome = SegmentOutcome {
        last_version: version_floor,
        ..SegmentOutcome::default()
    };

    let mut pos = start_offset;

    loop {
        segment.file().seek(SeekFrom::Start(pos))?;

        let mut hbuf = [0u8; RECORD_HEADER_SIZE];
        let n = record::read_up_to(segment.file(), &mut hbuf)?;
        if n == 0 {
            break; // clean EOF, nothing more to replay
        }
        if n < RECORD_HEADER_SIZE {
            tracing::warn!(file_id, offset = pos, "truncating partial header at end of segment");
            segment.truncate_at(pos)?;
            break;
        }

        let header = match Header::from_bytes(&hbuf, pos) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(file_id, offset = pos, error = %e, "corrupt record header, resynchronizing");
                match record::skip_corrupted(segment.file(), pos) {
                    Ok(next) => {
                        outcome.records_skipped_corrupt += 1;
                        pos = next;
                        continue;
                    }
                    Err(_) => {
                        segment.truncate_at(pos)?;
                        break;
                    }
                }
            }
        };

        let mut payload = vec![0u8; header.len as usize];
        let pn = record::read_up_to(segment.file(), &mut payload)?;
        if pn < payload.len() {
            tracing::warn!(file_id, offset = pos, "truncating partial payload at end of segment");
            segment.truncate_at(pos)?;
            break;
        }

        if header.sver != Sver::Legacy {
            let expected = record::checksum_whole(&header, &payload);
            if expected != header.cksum {
                tracing::warn!(file_id, offset = pos, "payload checksum mismatch, resynchronizing");
                match record::skip_corrupted(segment.file(), pos) {
                    Ok(next) => {
                        outcome.records_skipped_corrupt += 1;
                        pos = next;
                        continue;
                    }
                    Err(_) => {
                        segment.truncate_at(pos)?;
                        break;
                    }
                }
            }
        }

        let record_len = RECORD_HEADER_SIZE as u64 + header.len as u64;

        if header.version > outcome.last_version {
            let mut effective_header = header.clone();
            let mut effective_payload = payload;

            if header.sver != Sver::Current && header.msg_type == MsgType::SUBMIT {
                if let Some((migrated, len_expand)) =
                    migration::migrate_submit_payload(&effective_payload)?
                {
                    tracing::debug!(file_id, offset = pos, rows = len_expand, "migrated legacy Submit payload");
                    effective_header.len += len_expand;
                    effective_payload = migrated.to_vec();
                    outcome.records_migrated += 1;
                }
            }

            apply.apply(ctx, &effective_header, &effective_payload, Source::Wal)?;
            outcome.records_applied += 1;
            outcome.last_version = header.version;
        }

        pos += record_len;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct Collector(Mutex<Vec<(u64, Vec<u8>)>>);

    impl Apply<Collector> for () {
        fn apply(
            &self,
            ctx: &mut Collector,
            header: &Header,
            payload: &[u8],
            _source: Source,
        ) -> Result<(), WalError> {
            ctx.0.lock().push((header.version, payload.to_vec()));
            Ok(())
        }
    }

    fn write_record(segment: &mut Segment, version: u64, payload: &[u8]) {
        let record = Record::new(MsgType::CREATE_TABLE, version, Bytes::copy_from_slice(payload)).unwrap();
        segment.append_bytes(&record.encode()).unwrap();
    }

    #[test]
    fn restores_all_records_in_order() {
        let dir = TempDir::new().unwrap();
        {
            let mut seg = Segment::create(dir.path(), 0).unwrap();
            write_record(&mut seg, 1, b"a");
            write_record(&mut seg, 2, b"b");
            write_record(&mut seg, 3, b"c");
        }

        let collector = Collector(Mutex::new(Vec::new()));
        let mut ctx = collector;
        let report = restore(dir.path(), 0, 0, 0, &(), &mut ctx).unwrap();

        assert_eq!(report.records_applied, 3);
        assert_eq!(report.last_version, 3);
        assert_eq!(report.segment_errors.len(), 0);

        let seen = ctx.0.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (1, b"a".to_vec()));
        assert_eq!(seen[2], (3, b"c".to_vec()));
    }

    #[test]
    fn version_floor_skips_already_applied_records() {
        let dir = TempDir::new().unwrap();
        {
            let mut seg = Segment::create(dir.path(), 0).unwrap();
            write_record(&mut seg, 1, b"a");
            write_record(&mut seg, 2, b"b");
        }

        let mut ctx = Collector(Mutex::new(Vec::new()));
        let report = restore(dir.path(), 0, 0, 1, &(), &mut ctx).unwrap();
        assert_eq!(report.records_applied, 1);
        assert_eq!(ctx.0.lock()[0].0, 2);
    }

    #[test]
    fn truncates_partial_tail_write() {
        let dir = TempDir::new().unwrap();
        {
            let mut seg = Segment::create(dir.path(), 0).unwrap();
            write_record(&mut seg, 1, b"a");
            // Simulate a torn write: append a truncated header-only fragment.
            seg.append_bytes(&[0xAB; 5]).unwrap();
        }

        let mut ctx = Collector(Mutex::new(Vec::new()));
        let report = restore(dir.path(), 0, 0, 0, &(), &mut ctx).unwrap();
        assert_eq!(report.records_applied, 1);

        let size = std::fs::metadata(dir.path().join("wal0")).unwrap().len();
        let record = Record::new(MsgType::CREATE_TABLE, 1, Bytes::from_static(b"a")).unwrap();
        assert_eq!(size, record.disk_size() as u64);
    }

    #[test]
    fn resyncs_past_corrupted_record() {
        let dir = TempDir::new().unwrap();
        {
            let mut seg = Segment::create(dir.path(), 0).unwrap();
            write_record(&mut seg, 1, b"a");
            write_record(&mut seg, 2, b"b");
            write_record(&mut seg, 3, b"c");
        }

        // Flip a byte inside the second record's payload so its checksum fails.
        let path = dir.path().join("wal0");
        let mut bytes = std::fs::read(&path).unwrap();
        let first_len = Record::new(MsgType::CREATE_TABLE, 1, Bytes::from_static(b"a"))
            .unwrap()
            .disk_size();
        let corrupt_at = first_len + RECORD_HEADER_SIZE; // inside record 2's payload
        bytes[corrupt_at] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut ctx = Collector(Mutex::new(Vec::new()));
        let report = restore(dir.path(), 0, 0, 0, &(), &mut ctx).unwrap();

        assert!(report.records_skipped_corrupt >= 1);
        let seen = ctx.0.lock();
        assert!(seen.iter().any(|(v, _)| *v == 1));
        assert!(seen.iter().any(|(v, _)| *v == 3));
    }

    #[test]
    fn f_offset_applies_only_to_first_segment() {
        let dir = TempDir::new().unwrap();
        let first_len;
        {
            let mut seg = Segment::create(dir.path(), 0).unwrap();
            write_record(&mut seg, 1, b"skip-me");
            first_len = seg.size();
            write_record(&mut seg, 2, b"keep-me");
        }
        {
            let mut seg = Segment::create(dir.path(), 1).unwrap();
            write_record(&mut seg, 3, b"second-segment");
        }

        let mut ctx = Collector(Mutex::new(Vec::new()));
        let report = restore(dir.path(), 0, first_len, 0, &(), &mut ctx).unwrap();

        assert_eq!(report.records_applied, 2);
        let seen = ctx.0.lock();
        assert!(seen.iter().any(|(v, _)| *v == 2));
        assert!(seen.iter().any(|(v, _)| *v == 3));
        assert!(!seen.iter().any(|(v, _)| *v == 1));
    }

    #[test]
    fn failing_segment_does_not_abort_later_segments() {
        let dir = TempDir::new().unwrap();
        {
            let mut seg = Segment::create(dir.path(), 0).unwrap();
            write_record(&mut seg, 1, b"a");
        }
        {
            let mut seg = Segment::create(dir.path(), 1).unwrap();
            write_record(&mut seg, 2, b"b");
        }
        // Segment 0 stays listed on disk but loses read/write permission,
        // forcing restore_one_file's open to fail without removing it from
        // the directory scan entirely.
        let path = dir.path().join("wal0");
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();

        let mut ctx = Collector(Mutex::new(Vec::new()));
        let report = restore(dir.path(), 0, 0, 0, &(), &mut ctx).unwrap();

        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(&path, perms).unwrap();

        assert_eq!(report.segment_errors.len(), 1);
        assert_eq!(report.records_applied, 1);
        assert_eq!(ctx.0.lock()[0].0, 2);
    }
}
