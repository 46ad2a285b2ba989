//! Catalog enumeration: instances, and the per-instance backup list.

use anyhow::{bail, Context};
use camino::Utf8Path;
use tracing::warn;

use crate::backup::BackupRecord;
use crate::config::InstanceConfig;
use crate::control_file::read_backup_control_file;
use crate::id::BackupId;
use crate::paths::{BackupCatalog, BACKUP_CONTROL_FILE};

/// The enumerated backups of one instance, sorted in order of descending
/// id. The list owns its records; `parent_link` fields are indices into
/// this same list (spec'd out graph, no pointers).
#[derive(Debug, Default)]
pub struct BackupList {
    backups: Vec<BackupRecord>,
}

impl BackupList {
    /// Build a list from unordered records: sort descending by id and
    /// resolve every incremental backup's parent link.
    pub fn from_records(mut backups: Vec<BackupRecord>) -> Self {
        backups.sort_by(|a, b| b.id.cmp(&a.id));
        let mut list = BackupList { backups };
        list.link_parents();
        list
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    pub fn get(&self, idx: usize) -> &BackupRecord {
        &self.backups[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut BackupRecord {
        &mut self.backups[idx]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BackupRecord> {
        self.backups.iter()
    }

    /// Binary search by id; the list is sorted descending.
    pub fn find_by_id(&self, id: BackupId) -> Option<usize> {
        self.backups.binary_search_by(|b| id.cmp(&b.id)).ok()
    }

    /// Linear lookup with a warning on a miss, for callers that hold a
    /// record from an earlier enumeration. The index holds true until the
    /// list is rebuilt.
    pub fn index_of(&self, id: BackupId) -> Option<usize> {
        let found = self.backups.iter().position(|b| b.id == id);
        if found.is_none() {
            warn!("Failed to find backup {}", id);
        }
        found
    }

    // Link incremental backups with their ancestors.
    fn link_parents(&mut self) {
        for i in 0..self.backups.len() {
            if !self.backups[i].mode.is_incremental() {
                continue;
            }
            self.backups[i].parent_link = self.find_by_id(self.backups[i].parent_id);
        }
    }
}

impl<'a> IntoIterator for &'a BackupList {
    type Item = &'a BackupRecord;
    type IntoIter = std::slice::Iter<'a, BackupRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.backups.iter()
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// List the instances present in the catalog, with their configuration.
/// An empty catalog is a warning, not an error.
pub fn list_instances(catalog: &BackupCatalog) -> anyhow::Result<Vec<InstanceConfig>> {
    let path = catalog.backups_dir();
    let dir = std::fs::read_dir(&path)
        .with_context(|| format!("Cannot open directory \"{path}\""))?;

    let mut instances = Vec::new();
    for entry in dir {
        let entry = entry.with_context(|| format!("Cannot read directory \"{path}\""))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_hidden(&name) {
            continue;
        }
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let instance = InstanceConfig::load(&catalog.instance_backups_dir(&name), &name)?;
        instances.push(instance);
    }
    instances.sort_by(|a, b| a.name.cmp(&b.name));

    if instances.is_empty() {
        warn!("This backup catalog contains no backup instances");
    }
    Ok(instances)
}

/// Read one backup subdirectory into a record.
///
/// An unreadable control file still yields a minimal placeholder with the
/// id taken from the directory name, so purging logic can see the leftover
/// directory. A directory whose name is not a backup id at all is skipped.
fn read_backup_dir(backup_dir: &Utf8Path, dir_name: &str) -> anyhow::Result<Option<BackupRecord>> {
    let dir_id: BackupId = match dir_name.parse() {
        Ok(id) => id,
        Err(_) => {
            warn!("\"{}\" is not a backup directory, skipping", backup_dir);
            return Ok(None);
        }
    };

    let control_path = backup_dir.join(BACKUP_CONTROL_FILE);
    let mut backup = match read_backup_control_file(&control_path)? {
        Some(backup) => backup,
        None => {
            // the warning was already logged by the reader
            return Ok(Some(BackupRecord {
                id: dir_id,
                ..Default::default()
            }));
        }
    };

    if backup.id != dir_id {
        warn!(
            "backup ID in control file \"{}\" doesn't match name of the backup folder \"{}\"",
            backup.id, control_path
        );
        // the directory name is authoritative for identity and ordering
        backup.id = dir_id;
    }
    Ok(Some(backup))
}

/// Create the list of backups of an instance, sorted in order of
/// descending id, with parent links resolved.
///
/// If `requested_backup_id` is set, only the matching backup is listed.
pub fn list_backups(
    catalog: &BackupCatalog,
    instance: &str,
    requested_backup_id: Option<BackupId>,
) -> anyhow::Result<BackupList> {
    let instance_dir = catalog.instance_backups_dir(instance);

    let dir = match std::fs::read_dir(&instance_dir) {
        Ok(dir) => dir,
        Err(e) => {
            warn!("cannot open directory \"{}\": {}", instance_dir, e);
            bail!("Failed to get backup list");
        }
    };

    let mut backups = Vec::new();
    for entry in dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("cannot read directory \"{}\": {}", instance_dir, e);
                bail!("Failed to get backup list");
            }
        };
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        // skip not-directory entries and hidden entries
        if is_hidden(&name) || !entry.file_type()?.is_dir() {
            continue;
        }

        let Some(backup) = read_backup_dir(&instance_dir.join(&name), &name)? else {
            continue;
        };
        if let Some(requested) = requested_backup_id {
            if requested != backup.id {
                continue;
            }
        }
        backups.push(backup);
    }

    Ok(BackupList::from_records(backups))
}
