//! # tsdb-wal
//!
//! Per-shard write-ahead log for a distributed time-series database.
//!
//! A WAL instance owns a directory of append-only segment files. A single
//! writer appends length-prefixed, checksummed records to the current
//! segment; a restorer replays every segment in ascending file-id order at
//! startup, forward-migrating any record whose payload predates the current
//! on-disk layout. Corruption is handled by a bounded forward scan that
//! truncates the log at the first irrecoverable gap rather than aborting.
//!
//! The WAL does not interpret record payloads except for one case: a
//! `Submit`-typed record written before format version 2 is opportunistically
//! upgraded in memory while restoring (see [`migration`]).

pub mod config;
pub mod error;
pub mod migration;
pub mod record;
pub mod restore;
pub mod segment;
pub mod wal;

pub use config::{WalLevel, WalSettings};
pub use error::WalError;
pub use record::{Header, MsgType, Record, Sver};
pub use restore::{Apply, RestoreReport, Source};
pub use segment::FileId;
pub use wal::{LifecycleAction, WalInstance};

/// 4-byte sentinel identifying a record header candidate on disk.
pub const WAL_SIGNATURE: [u8; 4] = *b"TWAL";

/// Fixed on-disk header size in bytes (see [`record::Header`]):
/// signature(4) + sver(1) + reserved(1) + msg_type(1) + cksum(4) + version(8) + len(4).
pub const RECORD_HEADER_SIZE: usize = 23;

/// Compile-time cap on the total size (header + payload) of a single record.
pub const WAL_MAX_SIZE: usize = 16 * 1024 * 1024;

/// Maximum accepted payload size: the record buffer minus its header.
pub const MAX_PAYLOAD_SIZE: usize = WAL_MAX_SIZE - RECORD_HEADER_SIZE;

/// Segment filename prefix: segments are named `{WAL_PREFIX}{file_id}`.
pub const WAL_PREFIX: &str = "wal";

/// Default number of most-recent segments kept by prune beyond the
/// checkpointed segment (see [`wal::WalInstance::remove_one_old_file`]).
pub const WAL_FILE_NUM: i64 = 3;
