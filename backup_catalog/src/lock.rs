//! Per-backup exclusive lock files.
//!
//! A lock is a `backup.pid` file in the backup's directory holding the
//! owner's PID. Stale owners (dead processes, our own or our parent's PID
//! left over from a previous boot cycle) are detected and their files
//! removed. Locks held by this process are unlinked by an exit hook.

use std::fs;
use std::io::Write;
use std::sync::{Mutex, Once};

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getppid, Pid};
use once_cell::sync::Lazy;
use tracing::warn;

use crate::id::BackupId;
use crate::list::BackupList;
use crate::paths::{BackupCatalog, BACKUP_LOCK_FILE};

/// Lock files held by this process, unlinked at exit.
static LOCK_FILES: Lazy<Mutex<Vec<Utf8PathBuf>>> = Lazy::new(|| Mutex::new(Vec::new()));

static EXIT_HOOK: Once = Once::new();

extern "C" fn unlink_locks_at_exit() {
    let Ok(mut files) = LOCK_FILES.lock() else {
        return;
    };
    for lock_file in files.drain(..) {
        if let Err(e) = fs::remove_file(&lock_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                eprintln!("could not remove lock file \"{lock_file}\": {e}");
            }
        }
    }
}

fn register_lock_file(lock_file: Utf8PathBuf) {
    EXIT_HOOK.call_once(|| unsafe {
        libc::atexit(unlink_locks_at_exit);
    });
    if let Ok(mut files) = LOCK_FILES.lock() {
        files.push(lock_file);
    }
}

/// Create an exclusive lock file in the backup's directory.
///
/// Returns `Ok(false)` when another live process holds the lock; that is
/// the only non-fatal refusal. A corrupt lock file (empty, bogus PID) or
/// any I/O failure is an error.
pub fn lock_backup(backup_dir: &Utf8Path, id: BackupId) -> anyhow::Result<bool> {
    let lock_file = backup_dir.join(BACKUP_LOCK_FILE);

    let my_pid = std::process::id() as i32;
    // If the PID in the lockfile is our own PID or our parent's PID, the
    // file must be stale: a reboot can assign exactly the PID that was
    // recorded before it.
    let my_p_pid = getppid().as_raw();

    // A loop because of race conditions against other would-be creators,
    // bounded so a non-writable directory cannot spin us forever.
    let mut ntries = 0;
    let mut file = loop {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_file)
        {
            Ok(file) => break file,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                if ntries > 100 {
                    return Err(e)
                        .with_context(|| format!("Could not create lock file \"{lock_file}\""));
                }
                ntries += 1;
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Could not create lock file \"{lock_file}\""))
            }
        }

        // Read the file to get the old owner's PID. Note race condition
        // here: the file might have been deleted since we tried to create it.
        let content = match fs::read_to_string(&lock_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Could not open lock file \"{lock_file}\""))
            }
        };

        if content.is_empty() {
            bail!("Lock file \"{lock_file}\" is empty");
        }
        let first_line = content.lines().next().unwrap_or("");
        let encoded_pid: i32 = match first_line.trim().parse() {
            Ok(pid) if pid > 0 => pid,
            _ => bail!("Bogus data in lock file \"{lock_file}\": \"{first_line}\""),
        };

        if encoded_pid != my_pid && encoded_pid != my_p_pid {
            // Probe the owner with a zero signal.
            match kill(Pid::from_raw(encoded_pid), None) {
                Ok(()) => {
                    warn!(
                        "Process {} is using backup {} and still is running",
                        encoded_pid, id
                    );
                    return Ok(false);
                }
                Err(Errno::ESRCH) => {
                    warn!(
                        "Process {} which used backup {} no longer exists",
                        encoded_pid, id
                    );
                }
                Err(e) => bail!("Failed to send signal 0 to a process {encoded_pid}: {e}"),
            }
        }

        // Looks like nobody's home. Unlink the file and try again.
        fs::remove_file(&lock_file)
            .with_context(|| format!("Could not remove old lock file \"{lock_file}\""))?;
    };

    // Successfully created the file, now fill it.
    let fill = (|| -> std::io::Result<()> {
        file.write_all(format!("{my_pid}\n").as_bytes())?;
        file.sync_all()
    })();
    drop(file);
    if let Err(e) = fill {
        let _ = fs::remove_file(&lock_file);
        return Err(e).with_context(|| format!("Could not write lock file \"{lock_file}\""));
    }

    register_lock_file(lock_file);
    Ok(true)
}

/// Lock a range of backups from the enumerated list, from the highest index
/// of the range toward the lowest. The first refusal or failure aborts the
/// whole operation; locks taken so far stay held until process exit.
pub fn lock_backup_list(
    catalog: &BackupCatalog,
    instance: &str,
    backup_list: &BackupList,
    from_idx: usize,
    to_idx: usize,
) -> anyhow::Result<()> {
    if backup_list.is_empty() {
        return Ok(());
    }

    let start_idx = from_idx.max(to_idx);
    let end_idx = from_idx.min(to_idx);

    for i in (end_idx..=start_idx).rev() {
        let backup = backup_list.get(i);
        let backup_dir = catalog.backup_dir(instance, backup.id);
        if !lock_backup(&backup_dir, backup.id)? {
            bail!("Cannot lock backup {} directory", backup.id);
        }
    }
    Ok(())
}
