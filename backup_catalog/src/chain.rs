//! Analysis of incremental backup chains over the enumerated list.

use tracing::{debug, info, warn};

use walmeta::TimeLineID;

use crate::backup::BackupMode;
use crate::id::BackupId;
use crate::list::BackupList;

/// Verdict of a parent-chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainHealth {
    /// The walk ended on a non-FULL backup whose parent is not in the
    /// list; its `parent_id` names the missing ancestor.
    Broken,
    /// Every link resolves, but at least one backup in the chain is not
    /// OK/DONE.
    ContainsInvalid,
    /// Every link resolves and every backup is OK/DONE.
    Intact,
}

/// Iterate over the parent chain of `start` and look for any problems.
///
/// The returned witness index depends on the verdict:
/// [`ChainHealth::Broken`]: the oldest reachable backup (the one whose
/// parent is missing); [`ChainHealth::ContainsInvalid`]: the oldest
/// not-OK backup in the chain; [`ChainHealth::Intact`]: the base FULL.
pub fn scan_parent_chain(list: &BackupList, start: usize) -> (ChainHealth, usize) {
    let mut target = start;
    let mut invalid: Option<usize> = None;

    while let Some(parent) = list.get(target).parent_link {
        if !list.get(target).status.is_valid() {
            // oldest invalid backup seen so far in the chain
            invalid = Some(target);
        }
        target = parent;
    }

    // the loop does not examine the chain's end, do it here
    if list.get(target).mode == BackupMode::Full && !list.get(target).status.is_valid() {
        invalid = Some(target);
    }

    if list.get(target).mode != BackupMode::Full {
        return (ChainHealth::Broken, target);
    }
    if let Some(invalid) = invalid {
        return (ChainHealth::ContainsInvalid, invalid);
    }
    (ChainHealth::Intact, target)
}

/// Find the base FULL backup of `start` by walking parent links. Returns
/// `None`, with a warning, when the chain does not end on a FULL backup.
pub fn find_parent_full_backup(list: &BackupList, start: usize) -> Option<usize> {
    let mut base = start;
    while let Some(parent) = list.get(base).parent_link {
        base = parent;
    }

    if list.get(base).mode != BackupMode::Full {
        if list.get(base).parent_id.is_valid() {
            warn!("Backup {} is missing", list.get(base).parent_id);
        } else {
            warn!(
                "Failed to find parent FULL backup for {}",
                list.get(start).id
            );
        }
        return None;
    }
    Some(base)
}

/// Determine if the backup at `child` descends from the backup with id
/// `parent_id`. This does NOT guarantee that the chain is intact: links
/// beyond a missing backup are simply not reachable. With `inclusive`, a
/// backup counts as its own descendant.
pub fn is_parent(list: &BackupList, parent_id: BackupId, child: usize, inclusive: bool) -> bool {
    if inclusive && list.get(child).id == parent_id {
        return true;
    }

    let mut cur = child;
    while let Some(parent) = list.get(cur).parent_link {
        if list.get(cur).parent_id == parent_id {
            break;
        }
        cur = parent;
    }
    list.get(cur).parent_id == parent_id
}

/// Find the latest valid descendant of the latest valid FULL backup on the
/// given timeline. Backups with the id `current_backup_id` are skipped
/// silently (a backup cannot be its own parent candidate).
pub fn last_data_backup(
    list: &BackupList,
    tli: TimeLineID,
    current_backup_id: BackupId,
) -> Option<usize> {
    // the list is sorted in order of descending id
    let full = list.iter().position(|b| {
        b.mode == BackupMode::Full && b.status.is_valid() && b.tli == tli
    })?;

    debug!("Latest valid FULL backup: {}", list.get(full).id);

    for idx in 0..list.len() {
        let backup = list.get(idx);

        // only valid descendants are acceptable for evaluation
        if backup.status.is_valid() {
            match scan_parent_chain(list, idx) {
                (ChainHealth::Broken, witness) => {
                    warn!(
                        "Backup {} has missing parent: {}. Cannot be a parent",
                        backup.id,
                        list.get(witness).parent_id
                    );
                    continue;
                }
                (ChainHealth::ContainsInvalid, witness) => {
                    warn!(
                        "Backup {} has invalid parent: {}. Cannot be a parent",
                        backup.id,
                        list.get(witness).id
                    );
                    continue;
                }
                (ChainHealth::Intact, _) => {
                    if is_parent(list, list.get(full).id, idx, true) {
                        info!("Parent backup: {}", backup.id);
                        return Some(idx);
                    }
                }
            }
        } else if backup.id == current_backup_id {
            continue;
        } else {
            warn!(
                "Backup {} has status: {}. Cannot be a parent.",
                backup.id,
                backup.status.as_str()
            );
        }
    }

    None
}

/// Check if multiple valid backups consider the target their direct parent.
pub fn is_prolific(list: &BackupList, target: usize) -> bool {
    let target_id = list.get(target).id;
    let mut child_counter = 0;

    for backup in list {
        if backup.parent_id == target_id && backup.status.is_valid() {
            child_counter += 1;
            if child_counter > 1 {
                return true;
            }
        }
    }
    false
}
