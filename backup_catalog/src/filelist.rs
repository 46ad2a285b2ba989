//! `backup_content.control`: the list of files captured by a backup.
//!
//! One JSON object per line. The writer keeps the historical field order
//! and renders every value as a string; the reader takes strings or bare
//! numbers. Writing the list also recomputes the backup's aggregate byte
//! counters, since the file list is the authority on what was copied.

use std::fs;
use std::io::{BufWriter, Write};

use anyhow::Context;
use camino::Utf8Path;
use serde_json::Value;
use tracing::warn;

use walmeta::crashsafe;
use walmeta::xlog::IsXLogFileName;

use crate::backup::{deparse_compress_alg, parse_compress_alg, BackupRecord, CompressAlg};
use crate::id::BackupId;
use crate::paths::BACKUP_FILELIST_FILE;

/// Flush granularity of the file-list writer, ~250 KiB.
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Sentinel for "block count not known".
pub const BLOCKNUM_INVALID: i32 = -1;

// Unix file-mode bits, as stored in the `mode` field.
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// One entry of the backup file list.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Path relative to the backup's data directory (or to the numbered
    /// external directory for external files).
    pub path: String,
    /// Bytes actually written into the backup.
    pub size: i64,
    /// Unix mode bits.
    pub mode: u32,
    pub is_datafile: bool,
    pub is_cfs: bool,
    pub crc: u32,
    pub compress_alg: CompressAlg,
    /// `0` for files from the data directory, else the 1-based number of
    /// the external directory the file came from.
    pub external_dir_num: i32,
    pub db_oid: u32,
    /// Relation segment number; only meaningful for data files.
    pub segno: Option<i64>,
    /// Symlink target, when the entry is a link.
    pub linked: Option<String>,
    pub n_blocks: Option<i32>,
    /// Size before compression. Not persisted in the list; feeds the
    /// `uncompressed-bytes` counter.
    pub uncompressed_size: i64,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: i64, mode: u32) -> Self {
        FileEntry {
            path: path.into(),
            size,
            mode,
            is_datafile: false,
            is_cfs: false,
            crc: 0,
            compress_alg: CompressAlg::NotDefined,
            external_dir_num: 0,
            db_oid: 0,
            segno: None,
            linked: None,
            n_blocks: None,
            uncompressed_size: size,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Last component of `path`.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    fn deparse(&self) -> String {
        let mut line = format!(
            "{{\"path\":\"{}\", \"size\":\"{}\", \"mode\":\"{}\", \
             \"is_datafile\":\"{}\", \"is_cfs\":\"{}\", \"crc\":\"{}\", \
             \"compress_alg\":\"{}\", \"external_dir_num\":\"{}\", \"dbOid\":\"{}\"",
            self.path,
            self.size,
            self.mode,
            self.is_datafile as u8,
            self.is_cfs as u8,
            self.crc,
            deparse_compress_alg(self.compress_alg),
            self.external_dir_num,
            self.db_oid,
        );
        if self.is_datafile {
            line.push_str(&format!(",\"segno\":\"{}\"", self.segno.unwrap_or(0)));
        }
        if let Some(linked) = &self.linked {
            line.push_str(&format!(",\"linked\":\"{linked}\""));
        }
        if let Some(n_blocks) = self.n_blocks {
            if n_blocks != BLOCKNUM_INVALID {
                line.push_str(&format!(",\"n_blocks\":\"{n_blocks}\""));
            }
        }
        line.push_str("}\n");
        line
    }
}

// The historical writer stringified every value, so accept both `"5"` and 5.
fn get_i64(obj: &Value, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn get_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key)?.as_str()
}

fn parse_file_entry(line: &str) -> anyhow::Result<FileEntry> {
    let obj: Value = serde_json::from_str(line).context("malformed file list line")?;

    let path = get_str(&obj, "path")
        .context("file list entry without \"path\"")?
        .to_string();
    let size = get_i64(&obj, "size").context("file list entry without \"size\"")?;
    let mode = get_i64(&obj, "mode").context("file list entry without \"mode\"")? as u32;

    let compress_alg = match get_str(&obj, "compress_alg") {
        Some(s) => parse_compress_alg(s)?,
        None => CompressAlg::NotDefined,
    };

    Ok(FileEntry {
        path,
        size,
        mode,
        is_datafile: get_i64(&obj, "is_datafile").unwrap_or(0) != 0,
        is_cfs: get_i64(&obj, "is_cfs").unwrap_or(0) != 0,
        crc: get_i64(&obj, "crc").unwrap_or(0) as u32,
        compress_alg,
        external_dir_num: get_i64(&obj, "external_dir_num").unwrap_or(0) as i32,
        db_oid: get_i64(&obj, "dbOid").unwrap_or(0) as u32,
        segno: get_i64(&obj, "segno"),
        linked: get_str(&obj, "linked").map(str::to_string),
        n_blocks: get_i64(&obj, "n_blocks").map(|n| n as i32),
        uncompressed_size: size,
    })
}

/// Write the backup's file list, atomically.
///
/// Entries are buffered and flushed in ~250 KiB chunks; the temp file is
/// fsynced and renamed over the real one, and unlinked on any failure.
///
/// As a side effect the aggregate counters on `backup` are recomputed:
/// `data_bytes` sums regular non-WAL files plus 4096 per directory entry,
/// `wal_bytes` sums streamed WAL segments (XLOG-named files outside
/// external directories), `uncompressed_bytes` sums pre-compression sizes.
pub fn write_backup_filelist(
    backup: &mut BackupRecord,
    backup_dir: &Utf8Path,
    files: &[FileEntry],
) -> anyhow::Result<()> {
    let path = backup_dir.join(BACKUP_FILELIST_FILE);
    let path_tmp = crashsafe::path_with_suffix_extension(&path, "tmp");

    let mut data_bytes: i64 = 0;
    let mut wal_bytes: i64 = 0;
    let mut uncompressed_bytes: i64 = 0;

    fs::remove_file(&path_tmp).or_else(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Ok(())
        } else {
            Err(e)
        }
    })?;

    let mut do_write = || -> anyhow::Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path_tmp)
            .with_context(|| format!("Failed to open file list \"{path_tmp}\""))?;
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        for entry in files {
            if entry.is_dir() {
                data_bytes += 4096;
                uncompressed_bytes += 4096;
            }

            if entry.is_regular() && entry.size > 0 {
                // WAL streamed into the backup is counted separately
                if IsXLogFileName(entry.file_name()) && entry.external_dir_num == 0 {
                    wal_bytes += entry.size;
                } else {
                    data_bytes += entry.size;
                    uncompressed_bytes += entry.uncompressed_size;
                }
            }

            out.write_all(entry.deparse().as_bytes())
                .with_context(|| format!("Failed to write file list \"{path_tmp}\""))?;
        }

        let file = out
            .into_inner()
            .with_context(|| format!("Failed to write file list \"{path_tmp}\""))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync file list \"{path_tmp}\""))?;
        drop(file);

        fs::rename(&path_tmp, &path)
            .with_context(|| format!("Failed to rename \"{path_tmp}\" to \"{path}\""))?;
        crashsafe::fsync(backup_dir)?;
        Ok(())
    };

    do_write().map_err(|e| {
        let _ = fs::remove_file(&path_tmp);
        e
    })?;

    backup.data_bytes = data_bytes;
    backup.wal_bytes = wal_bytes;
    backup.uncompressed_bytes = uncompressed_bytes;
    Ok(())
}

/// Read a backup's file list. Unlike the control file, an unreadable file
/// list is an error: callers that got hold of a backup record expect its
/// content listing to exist.
pub fn get_backup_filelist(backup_dir: &Utf8Path, id: BackupId) -> anyhow::Result<Vec<FileEntry>> {
    let path = backup_dir.join(BACKUP_FILELIST_FILE);

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to get filelist for backup {id}"))?;

    let mut files = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = parse_file_entry(line)
            .with_context(|| format!("\"{}\", line {}", path, lineno + 1))?;
        files.push(entry);
    }

    if files.is_empty() {
        warn!("File list of backup {} is empty", id);
    }
    Ok(files)
}
