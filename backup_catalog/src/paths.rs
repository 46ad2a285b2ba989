//! Deterministic construction of paths within the catalog root.
//!
//! Layout:
//!
//! ```text
//! {root}/backups/{instance}/{base36(id)}/backup.control
//! {root}/backups/{instance}/{base36(id)}/backup_content.control
//! {root}/backups/{instance}/{base36(id)}/backup.pid
//! {root}/backups/{instance}/{base36(id)}/database/...
//! {root}/backups/{instance}/{base36(id)}/external_directories/external_{N}/...
//! {root}/wal/{instance}/...
//! ```

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};

use crate::backup::BackupRecord;
use crate::id::BackupId;

pub const BACKUPS_DIR: &str = "backups";
pub const WAL_DIR: &str = "wal";

pub const BACKUP_CONTROL_FILE: &str = "backup.control";
pub const BACKUP_FILELIST_FILE: &str = "backup_content.control";
pub const BACKUP_LOCK_FILE: &str = "backup.pid";

pub const DATABASE_DIR: &str = "database";
pub const EXTERNAL_DIR: &str = "external_directories";
pub const EXTERNAL_DIR_PREFIX: &str = "external_";

/// Handle to a backup catalog root. Cheap to clone; computes paths on
/// demand, nothing is cached.
#[derive(Debug, Clone)]
pub struct BackupCatalog {
    root: Utf8PathBuf,
}

impl BackupCatalog {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        BackupCatalog { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn backups_dir(&self) -> Utf8PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    pub fn instance_backups_dir(&self, instance: &str) -> Utf8PathBuf {
        self.backups_dir().join(instance)
    }

    pub fn wal_archive_dir(&self, instance: &str) -> Utf8PathBuf {
        self.root.join(WAL_DIR).join(instance)
    }

    pub fn backup_dir(&self, instance: &str, id: BackupId) -> Utf8PathBuf {
        self.instance_backups_dir(instance).join(id.to_string())
    }

    /// Backup directory with optional trailing sub-directory components.
    pub fn backup_subdir(&self, instance: &str, id: BackupId, subdirs: &[&str]) -> Utf8PathBuf {
        let mut path = self.backup_dir(instance, id);
        for sub in subdirs {
            path.push(sub);
        }
        path
    }

    /// The `external_directories/external_{n}` container; numbering starts
    /// with 1.
    pub fn external_dir(&self, instance: &str, id: BackupId, n: usize) -> Utf8PathBuf {
        self.backup_subdir(
            instance,
            id,
            &[EXTERNAL_DIR, &format!("{EXTERNAL_DIR_PREFIX}{n}")],
        )
    }
}

/// Create the directory skeleton for a new backup: the backup directory,
/// `database/`, and one numbered container per external directory. The
/// destination must not already hold files.
pub fn create_backup_dir(
    catalog: &BackupCatalog,
    instance: &str,
    backup: &BackupRecord,
) -> anyhow::Result<()> {
    let path = catalog.backup_dir(instance, backup.id);

    match std::fs::read_dir(&path) {
        Ok(mut dir) => {
            if dir.next().is_some() {
                bail!("backup destination is not empty \"{path}\"");
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Cannot open directory \"{path}\"")),
    }

    let mut subdirs = vec![path.join(DATABASE_DIR)];
    if let Some(external_dirs) = &backup.external_dirs {
        // numbering of external dir containers starts with 1
        for n in 1..=external_dirs.split(':').count() {
            subdirs.push(catalog.external_dir(instance, backup.id, n));
        }
    }

    for subdir in subdirs {
        std::fs::create_dir_all(&subdir)
            .with_context(|| format!("Cannot create directory \"{subdir}\""))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let catalog = BackupCatalog::new("/var/lib/wal_catalog");
        let id = BackupId(1561473148); // "ptnse4"

        assert_eq!(catalog.backups_dir(), "/var/lib/wal_catalog/backups");
        assert_eq!(
            catalog.instance_backups_dir("node1"),
            "/var/lib/wal_catalog/backups/node1"
        );
        assert_eq!(
            catalog.wal_archive_dir("node1"),
            "/var/lib/wal_catalog/wal/node1"
        );
        assert_eq!(
            catalog.backup_dir("node1", id),
            "/var/lib/wal_catalog/backups/node1/ptnse4"
        );
        assert_eq!(
            catalog.backup_subdir("node1", id, &[DATABASE_DIR, "base"]),
            "/var/lib/wal_catalog/backups/node1/ptnse4/database/base"
        );
        assert_eq!(
            catalog.external_dir("node1", id, 2),
            "/var/lib/wal_catalog/backups/node1/ptnse4/external_directories/external_2"
        );
    }

    #[test]
    fn test_create_backup_dir() {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = BackupCatalog::new(dir.path().to_owned());
        let backup = BackupRecord {
            id: BackupId(100),
            external_dirs: Some("/etc/one:/etc/two".to_string()),
            ..Default::default()
        };

        create_backup_dir(&catalog, "node1", &backup).unwrap();
        let base = catalog.backup_dir("node1", backup.id);
        assert!(base.join(DATABASE_DIR).is_dir());
        assert!(catalog.external_dir("node1", backup.id, 1).is_dir());
        assert!(catalog.external_dir("node1", backup.id, 2).is_dir());

        // the destination now holds files, a second create must refuse
        assert!(create_backup_dir(&catalog, "node1", &backup).is_err());
    }
}
