//! The in-memory backup record and its enum-typed attributes.

use anyhow::bail;

use walmeta::{Lsn, TimeLineID};

use crate::id::BackupId;

/// Sentinel for "size not known" byte counters.
pub const BYTES_INVALID: i64 = -1;

pub const DEFAULT_BLOCK_SIZE: u32 = 8192;
pub const DEFAULT_WAL_BLOCK_SIZE: u32 = 8192;
pub const DEFAULT_COMPRESS_LEVEL: i32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackupMode {
    /// Set before the control file has been read.
    #[default]
    Invalid,
    /// Self-contained copy of the whole data directory.
    Full,
    /// Incremental, via WAL page records since the parent.
    Page,
    /// Incremental, via the ptrack change map.
    Ptrack,
    /// Incremental, via block-level comparison against the parent.
    Delta,
}

impl BackupMode {
    pub fn is_incremental(self) -> bool {
        matches!(self, BackupMode::Page | BackupMode::Ptrack | BackupMode::Delta)
    }

    /// Rendering used in the control file.
    pub fn as_control_str(self) -> &'static str {
        match self {
            BackupMode::Invalid => "",
            BackupMode::Page => "PAGE",
            BackupMode::Ptrack => "PTRACK",
            BackupMode::Delta => "DELTA",
            BackupMode::Full => "FULL",
        }
    }
}

/// Parse a backup mode. Any non-empty case-insensitive prefix of the mode
/// name is accepted. An unrecognized value is an error: a record with an
/// unparseable mode cannot be classified at all.
pub fn parse_backup_mode(value: &str) -> anyhow::Result<BackupMode> {
    let v = value.trim_start();

    if !v.is_empty() && "full".starts_with(&v.to_ascii_lowercase()) {
        Ok(BackupMode::Full)
    } else if !v.is_empty() && "page".starts_with(&v.to_ascii_lowercase()) {
        Ok(BackupMode::Page)
    } else if !v.is_empty() && "ptrack".starts_with(&v.to_ascii_lowercase()) {
        Ok(BackupMode::Ptrack)
    } else if !v.is_empty() && "delta".starts_with(&v.to_ascii_lowercase()) {
        Ok(BackupMode::Delta)
    } else {
        bail!("invalid backup-mode \"{value}\"")
    }
}

pub fn deparse_backup_mode(mode: BackupMode) -> &'static str {
    match mode {
        BackupMode::Full => "full",
        BackupMode::Page => "page",
        BackupMode::Ptrack => "ptrack",
        BackupMode::Delta => "delta",
        BackupMode::Invalid => "invalid",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackupStatus {
    /// Set before the control file has been read.
    #[default]
    Invalid,
    /// Completed and validated.
    Ok,
    /// Aborted or failed.
    Error,
    /// In progress.
    Running,
    /// Being merged into its parent.
    Merging,
    /// Being deleted.
    Deleting,
    /// Data files removed, meta kept.
    Deleted,
    /// Completed, not yet validated.
    Done,
    /// Parent chain is broken.
    Orphan,
    /// Validation found it damaged.
    Corrupt,
}

impl BackupStatus {
    /// Only OK and DONE backups participate in parent selection and
    /// retention decisions.
    pub fn is_valid(self) -> bool {
        matches!(self, BackupStatus::Ok | BackupStatus::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Invalid => "INVALID",
            BackupStatus::Ok => "OK",
            BackupStatus::Error => "ERROR",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Merging => "MERGING",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Done => "DONE",
            BackupStatus::Orphan => "ORPHAN",
            BackupStatus::Corrupt => "CORRUPT",
        }
    }

    pub fn parse(s: &str) -> Option<BackupStatus> {
        match s {
            "OK" => Some(BackupStatus::Ok),
            "ERROR" => Some(BackupStatus::Error),
            "RUNNING" => Some(BackupStatus::Running),
            "MERGING" => Some(BackupStatus::Merging),
            "DELETING" => Some(BackupStatus::Deleting),
            "DELETED" => Some(BackupStatus::Deleted),
            "DONE" => Some(BackupStatus::Done),
            "ORPHAN" => Some(BackupStatus::Orphan),
            "CORRUPT" => Some(BackupStatus::Corrupt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressAlg {
    #[default]
    NotDefined,
    None,
    Pglz,
    Zlib,
}

/// Parse a compression algorithm name, accepting any non-empty
/// case-insensitive prefix. Unrecognized values are an error.
pub fn parse_compress_alg(value: &str) -> anyhow::Result<CompressAlg> {
    let v = value.trim_start();

    if v.is_empty() {
        bail!("compress algorithm is empty");
    }
    let lower = v.to_ascii_lowercase();
    if "zlib".starts_with(&lower) {
        Ok(CompressAlg::Zlib)
    } else if "pglz".starts_with(&lower) {
        Ok(CompressAlg::Pglz)
    } else if "none".starts_with(&lower) {
        Ok(CompressAlg::None)
    } else {
        bail!("invalid compress algorithm value \"{value}\"")
    }
}

pub fn deparse_compress_alg(alg: CompressAlg) -> &'static str {
    match alg {
        CompressAlg::None | CompressAlg::NotDefined => "none",
        CompressAlg::Zlib => "zlib",
        CompressAlg::Pglz => "pglz",
    }
}

/// One backup's control record.
///
/// Field defaults mirror an uninitialized record: sentinel ids and LSNs,
/// `Invalid` mode and status, `BYTES_INVALID` for the sizes only the backup
/// pipeline knows.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    /// Creation timestamp; doubles as `start-time` in the control file.
    pub id: BackupId,
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub tli: TimeLineID,

    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,

    /// Unix seconds; `0` means unset for all of these.
    pub merge_time: i64,
    pub end_time: i64,
    pub recovery_time: i64,
    pub recovery_xid: u64,

    pub data_bytes: i64,
    pub wal_bytes: i64,
    pub uncompressed_bytes: i64,
    pub pgdata_bytes: i64,

    pub block_size: u32,
    pub wal_block_size: u32,
    pub checksum_version: u32,

    pub compress_alg: CompressAlg,
    pub compress_level: i32,

    pub stream: bool,
    pub from_replica: bool,

    pub program_version: String,
    pub server_version: String,
    pub primary_conninfo: Option<String>,
    pub external_dirs: Option<String>,

    /// Direct parent for incremental backups, `INVALID` for FULL.
    pub parent_id: BackupId,
    /// Index of the parent record within the owning [`crate::list::BackupList`].
    /// Resolved by the enumerator, never persisted.
    pub parent_link: Option<usize>,
}

impl Default for BackupRecord {
    fn default() -> Self {
        BackupRecord {
            id: BackupId::INVALID,
            mode: BackupMode::Invalid,
            status: BackupStatus::Invalid,
            tli: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            merge_time: 0,
            end_time: 0,
            recovery_time: 0,
            recovery_xid: 0,
            data_bytes: BYTES_INVALID,
            wal_bytes: BYTES_INVALID,
            uncompressed_bytes: 0,
            pgdata_bytes: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            wal_block_size: DEFAULT_WAL_BLOCK_SIZE,
            checksum_version: 0,
            compress_alg: CompressAlg::NotDefined,
            compress_level: DEFAULT_COMPRESS_LEVEL,
            stream: false,
            from_replica: false,
            program_version: String::new(),
            server_version: String::new(),
            primary_conninfo: None,
            external_dirs: None,
            parent_id: BackupId::INVALID,
            parent_link: None,
        }
    }
}

impl BackupRecord {
    pub fn start_time(&self) -> i64 {
        self.id.start_time()
    }
}
