//! WAL record framing.
//!
//! Each record is a fixed header followed by its payload:
//!
//! ```text
//! +----------+------+----------+----------+----------+
//! | signature| sver | reserved | msg_type | cksum    |
//! | 4 bytes  | 1    | 1        | 1        | 4 bytes  |
//! +----------+------+----------+----------+----------+
//! | version             | len      | cont (len bytes) |
//! | 8 bytes             | 4 bytes  | ...               |
//! +---------------------+----------+-------------------+
//! ```
//!
//! `cksum`, `version`, and `len` are written in host byte order — the WAL is
//! not portable across machines of different endianness. Payload bytes that
//! get forward-migrated (see [`crate::migration`]) use network byte order,
//! since they describe a wire format the WAL itself doesn't otherwise
//! interpret.

use crate::error::WalError;
use crate::{MAX_PAYLOAD_SIZE, RECORD_HEADER_SIZE, WAL_SIGNATURE};
use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// On-disk record format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sver {
    /// Header-only checksum; payload unprotected. Read-only compatibility mode.
    Legacy = 0,
    /// Whole-record checksum, legacy Submit payload layout.
    WholeChecksum = 1,
    /// Whole-record checksum, current Submit payload layout. Always written.
    Current = 2,
}

impl Sver {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Sver::Legacy),
            1 => Some(Sver::WholeChecksum),
            2 => Some(Sver::Current),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Opaque record kind. The WAL does not interpret this byte except for one
/// equality check during payload migration ([`MsgType::SUBMIT`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgType(pub u8);

impl MsgType {
    pub const CREATE_TABLE: MsgType = MsgType(1);
    pub const ALTER_TABLE: MsgType = MsgType(2);
    /// A batch of row data. The only type migration ever rewrites.
    pub const SUBMIT: MsgType = MsgType(3);
    pub const DROP_TABLE: MsgType = MsgType(4);
    pub const CHECKPOINT: MsgType = MsgType(5);
    pub const NOOP: MsgType = MsgType(255);
}

/// A parsed record header.
#[derive(Debug, Clone)]
pub struct Header {
    pub signature: [u8; 4],
    pub sver: Sver,
    pub reserved: u8,
    pub msg_type: MsgType,
    pub cksum: u32,
    pub version: u64,
    pub len: u32,
}

impl Header {
    /// Parses and structurally validates a header read from disk: signature,
    /// `sver`, and length range. For `sver == 0` the checksum covers the
    /// header alone, so it is validated here too; `sver >= 1` checksums are
    /// validated once the payload has also been read (see
    /// [`verify_whole_checksum`]).
    pub fn from_bytes(bytes: &[u8; RECORD_HEADER_SIZE], offset: u64) -> Result<Self, WalError> {
        let signature: [u8; 4] = bytes[0..4].try_into().unwrap();
        if signature != WAL_SIGNATURE {
            return Err(WalError::corrupted(
                offset,
                format!("bad signature {signature:?}"),
            ));
        }

        let sver = Sver::from_u8(bytes[4])
            .ok_or_else(|| WalError::corrupted(offset, format!("unknown sver {}", bytes[4])))?;
        let reserved = bytes[5];
        let msg_type = MsgType(bytes[6]);
        let cksum = u32::from_ne_bytes(bytes[7..11].try_into().unwrap());
        let version = u64::from_ne_bytes(bytes[11..19].try_into().unwrap());
        let len = u32::from_ne_bytes(bytes[19..23].try_into().unwrap());

        if len as usize > MAX_PAYLOAD_SIZE {
            return Err(WalError::corrupted(
                offset,
                format!("payload length {len} exceeds max {MAX_PAYLOAD_SIZE}"),
            ));
        }

        let header = Header {
            signature,
            sver,
            reserved,
            msg_type,
            cksum,
            version,
            len,
        };

        if sver == Sver::Legacy && checksum_header_only(&header) != cksum {
            return Err(WalError::corrupted(offset, "header checksum mismatch"));
        }

        Ok(header)
    }

    /// Serializes the header (without payload) in the fixed 23-byte layout.
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.signature);
        out[4] = self.sver.as_u8();
        out[5] = self.reserved;
        out[6] = self.msg_type.0;
        out[7..11].copy_from_slice(&self.cksum.to_ne_bytes());
        out[11..19].copy_from_slice(&self.version.to_ne_bytes());
        out[19..23].copy_from_slice(&self.len.to_ne_bytes());
        out
    }
}

fn checksum_header_only(header: &Header) -> u32 {
    let mut zeroed = header.clone();
    zeroed.cksum = 0;
    crc32c::crc32c(&zeroed.to_bytes())
}

/// Recomputes the whole-record checksum (header with `cksum` zeroed, plus
/// payload) for `sver >= 1` records.
pub fn checksum_whole(header: &Header, payload: &[u8]) -> u32 {
    let mut zeroed = header.clone();
    zeroed.cksum = 0;
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&zeroed.to_bytes());
    buf.extend_from_slice(payload);
    crc32c::crc32c(&buf)
}

/// A complete record: header plus payload.
#[derive(Debug, Clone)]
pub struct Record {
    pub header: Header,
    pub payload: Bytes,
}

impl Record {
    /// Builds a record for append. Always writes the current format version
    /// (`sver = 2`) with a whole-record checksum.
    pub fn new(msg_type: MsgType, version: u64, payload: Bytes) -> Result<Self, WalError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WalError::InvalidState(format!(
                "payload of {} bytes exceeds max {MAX_PAYLOAD_SIZE}",
                payload.len()
            )));
        }

        let mut header = Header {
            signature: WAL_SIGNATURE,
            sver: Sver::Current,
            reserved: 0,
            msg_type,
            cksum: 0,
            version,
            len: payload.len() as u32,
        };
        header.cksum = checksum_whole(&header, &payload);

        Ok(Self { header, payload })
    }

    /// Serializes header + payload for appending to a segment.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}

/// Reads into `buf` until it is full or EOF is reached. Returns the number
/// of bytes actually read, which is less than `buf.len()` only at EOF.
pub(crate) fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize, WalError> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Resynchronizes after a corrupt record by advancing one byte at a time
/// from `offset + 1`, retrying full validation (header, and for `sver >= 1`
/// the whole-record checksum) at each position. Returns the offset of the
/// first valid record found, or a `Corrupted` error once EOF is reached
/// without finding one.
///
/// This is the documented "deliberate simplification" from the design
/// notes: a signature-search fast path could replace the byte-by-byte scan
/// as long as it returns the same first valid offset >= `offset + 1`.
pub fn skip_corrupted(file: &mut File, offset: u64) -> Result<u64, WalError> {
    let mut pos = offset + 1;

    loop {
        file.seek(SeekFrom::Start(pos))?;

        let mut hbuf = [0u8; RECORD_HEADER_SIZE];
        let n = read_up_to(file, &mut hbuf)?;
        if n < RECORD_HEADER_SIZE {
            return Err(WalError::corrupted(
                pos,
                "reached end of file while resynchronizing",
            ));
        }

        let header = match Header::from_bytes(&hbuf, pos) {
            Ok(h) => h,
            Err(_) => {
                pos += 1;
                continue;
            }
        };

        match header.sver {
            Sver::Legacy => return Ok(pos),
            Sver::WholeChecksum | Sver::Current => {
                let mut payload = vec![0u8; header.len as usize];
                let n = read_up_to(file, &mut payload)?;
                if n < payload.len() {
                    pos += 1;
                    continue;
                }
                if checksum_whole(&header, &payload) == header.cksum {
                    return Ok(pos);
                }
                pos += 1;
            }
        }
    }
}
