//! WAL settings: defaults overridden by environment variables.
//!
//! Shard identity, the data directory root, and logging are owned by the
//! caller; this module only resolves the handful of knobs the WAL itself
//! needs (durability level, fsync cadence, segment retention, segment size
//! cap). Same layering as the surrounding server's configuration: compiled
//! defaults, then environment overrides — no config file for a
//! subsystem this small.

use std::env;
use std::time::Duration;

use crate::WAL_FILE_NUM;

/// Durability level, checked on every write before a record is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalLevel {
    /// Don't write records at all; `write` is a no-op that still advances
    /// the in-memory version counter.
    NoLog,
    /// Write records to the segment file but never fsync them.
    WriteOnly,
    /// Write records and fsync on the configured cadence.
    Fsync,
}

impl WalLevel {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "0" | "none" | "nolog" => Some(WalLevel::NoLog),
            "1" | "write" | "write_only" => Some(WalLevel::WriteOnly),
            "2" | "fsync" => Some(WalLevel::Fsync),
            _ => None,
        }
    }
}

impl Default for WalLevel {
    fn default() -> Self {
        WalLevel::Fsync
    }
}

/// Resolved WAL settings for one shard instance.
#[derive(Debug, Clone)]
pub struct WalSettings {
    pub level: WalLevel,
    pub fsync_period: Duration,
    pub file_num: i64,
    pub max_size: usize,
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            level: WalLevel::default(),
            fsync_period: Duration::from_millis(3000),
            file_num: WAL_FILE_NUM,
            max_size: crate::WAL_MAX_SIZE,
        }
    }
}

impl WalSettings {
    /// Builds settings from compiled defaults, then applies any of
    /// `TSDB_WAL_LEVEL`, `TSDB_WAL_FSYNC_PERIOD_MS`, `TSDB_WAL_FILE_NUM`,
    /// `TSDB_WAL_MAX_SIZE` found in the environment. Unrecognized or
    /// unparsable values are ignored; the compiled default wins.
    pub fn load() -> Self {
        let mut settings = Self::default();

        if let Ok(raw) = env::var("TSDB_WAL_LEVEL") {
            if let Some(level) = WalLevel::from_str(raw.trim()) {
                settings.level = level;
            } else {
                tracing::warn!(value = %raw, "ignoring unrecognized TSDB_WAL_LEVEL");
            }
        }

        if let Ok(raw) = env::var("TSDB_WAL_FSYNC_PERIOD_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => settings.fsync_period = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = %raw, "ignoring unparsable TSDB_WAL_FSYNC_PERIOD_MS"),
            }
        }

        if let Ok(raw) = env::var("TSDB_WAL_FILE_NUM") {
            match raw.trim().parse::<i64>() {
                Ok(n) if n >= 0 => settings.file_num = n,
                _ => tracing::warn!(value = %raw, "ignoring invalid TSDB_WAL_FILE_NUM"),
            }
        }

        if let Ok(raw) = env::var("TSDB_WAL_MAX_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > crate::RECORD_HEADER_SIZE => settings.max_size = n,
                _ => tracing::warn!(value = %raw, "ignoring invalid TSDB_WAL_MAX_SIZE"),
            }
        }

        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_fsync_with_three_file_retention() {
        let settings = WalSettings::default();
        assert_eq!(settings.level, WalLevel::Fsync);
        assert_eq!(settings.file_num, WAL_FILE_NUM);
    }

    #[test]
    fn level_from_str_accepts_aliases() {
        assert_eq!(WalLevel::from_str("0"), Some(WalLevel::NoLog));
        assert_eq!(WalLevel::from_str("nolog"), Some(WalLevel::NoLog));
        assert_eq!(WalLevel::from_str("write_only"), Some(WalLevel::WriteOnly));
        assert_eq!(WalLevel::from_str("fsync"), Some(WalLevel::Fsync));
        assert_eq!(WalLevel::from_str("bogus"), None);
    }
}
