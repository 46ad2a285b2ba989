//! `backup.control` serialization, deserialization and persistence.
//!
//! The control file is `key = value` text, values optionally single-quoted,
//! `#` introduces a comment. The writer emits a fixed section order; the
//! reader is permissive: unknown keys are warned about and skipped, and a
//! file that is missing, empty or has no `start-time` yields `None` rather
//! than a partially populated record.

use anyhow::Context;
use camino::Utf8Path;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use tracing::warn;

use walmeta::crashsafe;

use crate::backup::{
    deparse_compress_alg, parse_backup_mode, parse_compress_alg, BackupRecord, BackupStatus,
    BYTES_INVALID,
};
use crate::id::BackupId;
use crate::paths::{BackupCatalog, BACKUP_CONTROL_FILE};

const ISO_TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S%z";

/// Render Unix seconds as ISO-8601 in the local timezone.
pub fn time2iso(ts: i64) -> String {
    match Local.timestamp_opt(ts, 0) {
        chrono::LocalResult::Single(dt) => dt.format(ISO_TIMESTAMP_FMT).to_string(),
        // unreachable for epoch input, which is unambiguous in any zone
        _ => String::new(),
    }
}

/// Parse an ISO-8601 timestamp, with or without a zone offset. A naive
/// timestamp is interpreted in the local timezone.
pub fn parse_iso_time(value: &str) -> Option<i64> {
    let v = value.trim();
    if let Ok(dt) = DateTime::parse_from_str(v, ISO_TIMESTAMP_FMT) {
        return Some(dt.timestamp());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(v, "%Y-%m-%d %H:%M:%S") {
        return Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp());
    }
    None
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "1" => Some(true),
        "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Serialize a backup record in the control-file format. Optional fields
/// carrying their sentinel value are omitted.
pub fn deparse_backup_record(backup: &BackupRecord) -> String {
    let mut out = String::with_capacity(1024);

    out.push_str("#Configuration\n");
    out.push_str(&format!("backup-mode = {}\n", backup.mode.as_control_str()));
    out.push_str(&format!("stream = {}\n", backup.stream));
    out.push_str(&format!(
        "compress-alg = {}\n",
        deparse_compress_alg(backup.compress_alg)
    ));
    out.push_str(&format!("compress-level = {}\n", backup.compress_level));
    out.push_str(&format!("from-replica = {}\n", backup.from_replica));

    out.push_str("\n#Compatibility\n");
    out.push_str(&format!("block-size = {}\n", backup.block_size));
    out.push_str(&format!("xlog-block-size = {}\n", backup.wal_block_size));
    out.push_str(&format!("checksum-version = {}\n", backup.checksum_version));
    if !backup.program_version.is_empty() {
        out.push_str(&format!("program-version = {}\n", backup.program_version));
    }
    if !backup.server_version.is_empty() {
        out.push_str(&format!("server-version = {}\n", backup.server_version));
    }

    out.push_str("\n#Result backup info\n");
    out.push_str(&format!("timelineid = {}\n", backup.tli));
    out.push_str(&format!("start-lsn = {}\n", backup.start_lsn));
    out.push_str(&format!("stop-lsn = {}\n", backup.stop_lsn));
    out.push_str(&format!("start-time = '{}'\n", time2iso(backup.start_time())));
    if backup.merge_time > 0 {
        out.push_str(&format!("merge-time = '{}'\n", time2iso(backup.merge_time)));
    }
    if backup.end_time > 0 {
        out.push_str(&format!("end-time = '{}'\n", time2iso(backup.end_time)));
    }
    out.push_str(&format!("recovery-xid = {}\n", backup.recovery_xid));
    if backup.recovery_time > 0 {
        out.push_str(&format!(
            "recovery-time = '{}'\n",
            time2iso(backup.recovery_time)
        ));
    }
    if backup.data_bytes != BYTES_INVALID {
        out.push_str(&format!("data-bytes = {}\n", backup.data_bytes));
    }
    if backup.wal_bytes != BYTES_INVALID {
        out.push_str(&format!("wal-bytes = {}\n", backup.wal_bytes));
    }
    if backup.uncompressed_bytes >= 0 {
        out.push_str(&format!(
            "uncompressed-bytes = {}\n",
            backup.uncompressed_bytes
        ));
    }
    if backup.pgdata_bytes >= 0 {
        out.push_str(&format!("pgdata-bytes = {}\n", backup.pgdata_bytes));
    }
    out.push_str(&format!("status = {}\n", backup.status.as_str()));
    if backup.parent_id.is_valid() {
        out.push_str(&format!("parent-backup-id = '{}'\n", backup.parent_id));
    }
    if let Some(conninfo) = &backup.primary_conninfo {
        out.push_str(&format!("primary_conninfo = '{conninfo}'\n"));
    }
    if let Some(dirs) = &backup.external_dirs {
        out.push_str(&format!("external-dirs = '{dirs}'\n"));
    }

    out
}

/// Save a backup record into the backup directory's control file.
///
/// The write is atomic: content goes to `backup.control.tmp` first and is
/// renamed over the control file after an fsync.
pub fn write_backup(backup_dir: &Utf8Path, backup: &BackupRecord) -> anyhow::Result<()> {
    let path = backup_dir.join(BACKUP_CONTROL_FILE);
    let path_tmp = crashsafe::path_with_suffix_extension(&path, "tmp");

    crashsafe::overwrite(&path, &path_tmp, deparse_backup_record(backup).as_bytes())
        .with_context(|| format!("Failed to write control file \"{path}\""))
}

/// Split one `key = value` line, stripping quotes and trailing comments.
/// Returns `None` for blank and comment lines.
fn split_kv(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    let raw = raw.trim();

    let value = if let Some(quoted) = raw.strip_prefix('\'') {
        // quoted value runs to the closing quote; '#' inside is literal
        quoted.rsplit_once('\'').map(|(v, _)| v).unwrap_or(quoted)
    } else {
        // unquoted value ends at a comment, if any
        raw.split('#').next().unwrap_or(raw).trim_end()
    };
    Some((key, value))
}

/// Parse control-file content. `path` is only used in log messages.
pub fn parse_backup_record(path: &Utf8Path, content: &str) -> anyhow::Result<Option<BackupRecord>> {
    let mut backup = BackupRecord::default();
    let mut start_time: i64 = 0;
    let mut parsed_options = 0;

    macro_rules! parse_or_warn {
        ($key:expr, $value:expr, $parser:expr, $slot:expr) => {
            match $parser {
                Some(v) => {
                    $slot = v;
                    parsed_options += 1;
                }
                None => warn!("Invalid value \"{}\" for option \"{}\" in \"{}\"", $value, $key, path),
            }
        };
    }

    for line in content.lines() {
        let Some((key, value)) = split_kv(line) else {
            continue;
        };

        match key {
            "backup-mode" => {
                backup.mode = parse_backup_mode(value)?;
                parsed_options += 1;
            }
            "compress-alg" => {
                backup.compress_alg = parse_compress_alg(value)?;
                parsed_options += 1;
            }
            "stream" => parse_or_warn!(key, value, parse_bool(value), backup.stream),
            "from-replica" => parse_or_warn!(key, value, parse_bool(value), backup.from_replica),
            "compress-level" => {
                parse_or_warn!(key, value, value.parse().ok(), backup.compress_level)
            }
            "block-size" => parse_or_warn!(key, value, value.parse().ok(), backup.block_size),
            "xlog-block-size" => {
                parse_or_warn!(key, value, value.parse().ok(), backup.wal_block_size)
            }
            "checksum-version" => {
                parse_or_warn!(key, value, value.parse().ok(), backup.checksum_version)
            }
            "program-version" => {
                backup.program_version = value.to_string();
                parsed_options += 1;
            }
            "server-version" => {
                backup.server_version = value.to_string();
                parsed_options += 1;
            }
            "timelineid" => parse_or_warn!(key, value, value.parse().ok(), backup.tli),
            "start-lsn" => match value.parse() {
                Ok(lsn) => {
                    backup.start_lsn = lsn;
                    parsed_options += 1;
                }
                Err(_) => warn!("Invalid START_LSN \"{}\"", value),
            },
            "stop-lsn" => match value.parse() {
                Ok(lsn) => {
                    backup.stop_lsn = lsn;
                    parsed_options += 1;
                }
                Err(_) => warn!("Invalid STOP_LSN \"{}\"", value),
            },
            "start-time" => parse_or_warn!(key, value, parse_iso_time(value), start_time),
            "merge-time" => parse_or_warn!(key, value, parse_iso_time(value), backup.merge_time),
            "end-time" => parse_or_warn!(key, value, parse_iso_time(value), backup.end_time),
            "recovery-time" => {
                parse_or_warn!(key, value, parse_iso_time(value), backup.recovery_time)
            }
            "recovery-xid" => parse_or_warn!(key, value, value.parse().ok(), backup.recovery_xid),
            "data-bytes" => parse_or_warn!(key, value, value.parse().ok(), backup.data_bytes),
            "wal-bytes" => parse_or_warn!(key, value, value.parse().ok(), backup.wal_bytes),
            "uncompressed-bytes" => {
                parse_or_warn!(key, value, value.parse().ok(), backup.uncompressed_bytes)
            }
            "pgdata-bytes" => parse_or_warn!(key, value, value.parse().ok(), backup.pgdata_bytes),
            "status" => match BackupStatus::parse(value) {
                Some(status) => {
                    backup.status = status;
                    parsed_options += 1;
                }
                None => warn!("Invalid STATUS \"{}\"", value),
            },
            "parent-backup-id" => match value.parse() {
                Ok(id) => {
                    backup.parent_id = id;
                    parsed_options += 1;
                }
                Err(_) => warn!("Invalid parent-backup-id \"{}\"", value),
            },
            // the writer uses an underscore here; accept the hyphenated
            // spelling older tool versions produced
            "primary_conninfo" | "primary-conninfo" => {
                backup.primary_conninfo = Some(value.to_string());
                parsed_options += 1;
            }
            "external-dirs" => {
                backup.external_dirs = Some(value.to_string());
                parsed_options += 1;
            }
            _ => warn!("Unknown option \"{}\" in \"{}\"", key, path),
        }
    }

    if parsed_options == 0 {
        warn!("Control file \"{}\" is empty", path);
        return Ok(None);
    }
    if start_time == 0 {
        warn!(
            "Invalid ID/start-time, control file \"{}\" is corrupted",
            path
        );
        return Ok(None);
    }

    backup.id = BackupId(start_time as u64);
    Ok(Some(backup))
}

/// Read a backup record from a control file on disk. Returns `Ok(None)`
/// (with a warning) when the file is missing or unusable.
pub fn read_backup_control_file(path: &Utf8Path) -> anyhow::Result<Option<BackupRecord>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Control file \"{}\" doesn't exist", path);
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read control file \"{path}\""))
        }
    };
    parse_backup_record(path, &content)
}

/// Read backup meta information by id. If no backup matches, return `None`.
pub fn read_backup(
    catalog: &BackupCatalog,
    instance: &str,
    id: BackupId,
) -> anyhow::Result<Option<BackupRecord>> {
    let path = catalog
        .backup_dir(instance, id)
        .join(BACKUP_CONTROL_FILE);
    read_backup_control_file(&path)
}

/// Save a new status into the backup's control file.
///
/// The record is re-read from disk and rewritten with only the status
/// changed, so concurrent edits to other fields are not clobbered. If the
/// control file can no longer be read the function silently returns, the
/// read already logged a warning.
pub fn write_backup_status(
    catalog: &BackupCatalog,
    instance: &str,
    backup: &mut BackupRecord,
    status: BackupStatus,
) -> anyhow::Result<()> {
    let Some(mut on_disk) = read_backup(catalog, instance, backup.id)? else {
        return Ok(());
    };

    backup.status = status;
    on_disk.status = status;
    write_backup(&catalog.backup_dir(instance, backup.id), &on_disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupMode, CompressAlg};
    use walmeta::Lsn;

    fn sample_backup() -> BackupRecord {
        BackupRecord {
            id: BackupId(1561473148),
            mode: BackupMode::Delta,
            status: BackupStatus::Ok,
            tli: 3,
            start_lsn: Lsn(0x2000028),
            stop_lsn: Lsn(0x2000138),
            merge_time: 1561473200,
            end_time: 1561473190,
            recovery_time: 1561473195,
            recovery_xid: 505,
            data_bytes: 22288792,
            wal_bytes: 16777216,
            uncompressed_bytes: 39845888,
            pgdata_bytes: 22288792,
            block_size: 8192,
            wal_block_size: 8192,
            checksum_version: 1,
            compress_alg: CompressAlg::Zlib,
            compress_level: 1,
            stream: true,
            from_replica: false,
            program_version: "2.1.3".to_string(),
            server_version: "12".to_string(),
            primary_conninfo: Some("host=localhost port=5432".to_string()),
            external_dirs: Some("/etc/tablespaces".to_string()),
            parent_id: BackupId(1561473000),
            parent_link: None,
        }
    }

    fn assert_records_equal(a: &BackupRecord, b: &BackupRecord) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.mode, b.mode);
        assert_eq!(a.status, b.status);
        assert_eq!(a.tli, b.tli);
        assert_eq!(a.start_lsn, b.start_lsn);
        assert_eq!(a.stop_lsn, b.stop_lsn);
        assert_eq!(a.merge_time, b.merge_time);
        assert_eq!(a.end_time, b.end_time);
        assert_eq!(a.recovery_time, b.recovery_time);
        assert_eq!(a.recovery_xid, b.recovery_xid);
        assert_eq!(a.data_bytes, b.data_bytes);
        assert_eq!(a.wal_bytes, b.wal_bytes);
        assert_eq!(a.uncompressed_bytes, b.uncompressed_bytes);
        assert_eq!(a.pgdata_bytes, b.pgdata_bytes);
        assert_eq!(a.block_size, b.block_size);
        assert_eq!(a.wal_block_size, b.wal_block_size);
        assert_eq!(a.checksum_version, b.checksum_version);
        assert_eq!(a.compress_alg, b.compress_alg);
        assert_eq!(a.compress_level, b.compress_level);
        assert_eq!(a.stream, b.stream);
        assert_eq!(a.from_replica, b.from_replica);
        assert_eq!(a.program_version, b.program_version);
        assert_eq!(a.server_version, b.server_version);
        assert_eq!(a.primary_conninfo, b.primary_conninfo);
        assert_eq!(a.external_dirs, b.external_dirs);
        assert_eq!(a.parent_id, b.parent_id);
    }

    #[test]
    fn test_control_file_roundtrip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let backup = sample_backup();

        write_backup(dir.path(), &backup).unwrap();
        let reread = read_backup_control_file(&dir.path().join(BACKUP_CONTROL_FILE))
            .unwrap()
            .expect("control file must parse");

        assert_records_equal(&backup, &reread);
    }

    #[test]
    fn test_minimal_record_roundtrip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let backup = BackupRecord {
            id: BackupId(100),
            mode: BackupMode::Full,
            status: BackupStatus::Running,
            ..Default::default()
        };

        write_backup(dir.path(), &backup).unwrap();
        let content = std::fs::read_to_string(dir.path().join(BACKUP_CONTROL_FILE)).unwrap();
        // sentinel-valued optionals are omitted entirely
        assert!(!content.contains("merge-time"));
        assert!(!content.contains("end-time"));
        assert!(!content.contains("data-bytes"));
        assert!(!content.contains("wal-bytes"));
        assert!(!content.contains("parent-backup-id"));
        assert!(!content.contains("primary_conninfo"));
        assert!(!content.contains("external-dirs"));

        let reread = read_backup_control_file(&dir.path().join(BACKUP_CONTROL_FILE))
            .unwrap()
            .expect("control file must parse");
        assert_records_equal(&backup, &reread);
    }

    #[test]
    fn test_missing_and_empty_control_files() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join(BACKUP_CONTROL_FILE);

        assert!(read_backup_control_file(&path).unwrap().is_none());

        std::fs::write(&path, "").unwrap();
        assert!(read_backup_control_file(&path).unwrap().is_none());

        // comments only is as good as empty
        std::fs::write(&path, "#Configuration\n\n# nothing here\n").unwrap();
        assert!(read_backup_control_file(&path).unwrap().is_none());
    }

    #[test]
    fn test_record_without_start_time_is_rejected() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join(BACKUP_CONTROL_FILE);
        std::fs::write(&path, "backup-mode = FULL\nstatus = OK\n").unwrap();
        assert!(read_backup_control_file(&path).unwrap().is_none());
    }

    #[test]
    fn test_permissive_parsing() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join(BACKUP_CONTROL_FILE);
        std::fs::write(
            &path,
            "# a comment\n\
             backup-mode = FULL\n\
             some-future-key = 42\n\
             status = NOT_A_STATUS\n\
             start-lsn = garbage\n\
             start-time = '2019-06-25 14:32:28+0000'\n\
             primary-conninfo = 'host=example port=5432' # trailing note\n",
        )
        .unwrap();

        let backup = read_backup_control_file(&path).unwrap().expect("accepted");
        assert_eq!(backup.mode, BackupMode::Full);
        // unknown status string leaves the sentinel in place
        assert_eq!(backup.status, BackupStatus::Invalid);
        assert_eq!(backup.start_lsn, Lsn::INVALID);
        assert_eq!(backup.id, BackupId(1561473148));
        assert_eq!(
            backup.primary_conninfo.as_deref(),
            Some("host=example port=5432")
        );
    }

    #[test]
    fn test_invalid_mode_is_fatal() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join(BACKUP_CONTROL_FILE);
        std::fs::write(
            &path,
            "backup-mode = WUMBO\nstart-time = '2019-06-25 14:32:28+0000'\n",
        )
        .unwrap();
        assert!(read_backup_control_file(&path).is_err());
    }

    #[test]
    fn test_write_backup_status() {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = BackupCatalog::new(dir.path().to_owned());
        let mut backup = sample_backup();

        let backup_dir = catalog.backup_dir("node1", backup.id);
        std::fs::create_dir_all(&backup_dir).unwrap();
        write_backup(&backup_dir, &backup).unwrap();

        write_backup_status(&catalog, "node1", &mut backup, BackupStatus::Orphan).unwrap();
        assert_eq!(backup.status, BackupStatus::Orphan);

        let reread = read_backup(&catalog, "node1", backup.id).unwrap().unwrap();
        assert_eq!(reread.status, BackupStatus::Orphan);

        // status update for a vanished backup is a no-op
        let mut ghost = BackupRecord {
            id: BackupId(42),
            ..Default::default()
        };
        write_backup_status(&catalog, "node1", &mut ghost, BackupStatus::Corrupt).unwrap();
    }

    #[test]
    fn test_time_roundtrip() {
        let ts = 1561473148;
        assert_eq!(parse_iso_time(&time2iso(ts)), Some(ts));
        assert_eq!(parse_iso_time("2019-06-25 14:32:28+0000"), Some(1561473148));
        assert_eq!(parse_iso_time("not a date"), None);
    }
}
