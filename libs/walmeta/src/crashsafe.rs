use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};

/// Adds a suffix to the file name, either appending the suffix to the end of
/// its extension, or if there's no extension, creates one and puts a suffix
/// there.
pub fn path_with_suffix_extension(original_path: impl AsRef<Utf8Path>, suffix: &str) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => Cow::Owned(format!("{extension}.{suffix}")),
        None => Cow::Borrowed(suffix),
    };
    original_path.as_ref().with_extension(new_extension)
}

pub fn fsync(path: &Utf8Path) -> io::Result<()> {
    File::open(path)
        .and_then(|file| file.sync_all())
        .map_err(|e| io::Error::new(e.kind(), format!("Failed to fsync file {path:?}: {e}")))
}

pub fn fsync_file_and_parent(file_path: &Utf8Path) -> io::Result<()> {
    let parent = file_path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("File {file_path:?} has no parent"),
        )
    })?;

    fsync(file_path)?;
    fsync(parent)?;
    Ok(())
}

fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

/// Writes a file to `final_path` in a crash safe fashion.
///
/// The content is first written to `tmp_path`, fsynced, and only then
/// renamed over `final_path`; the rename is the linearization point. If we
/// crash at any point there will never be a partially written file at
/// `final_path` (but maybe at `tmp_path`). On any error after the temp file
/// was created, the temp file is unlinked before the error is returned.
///
/// Callers are responsible for serializing calls of this function for a
/// given `final_path`.
pub fn overwrite(final_path: &Utf8Path, tmp_path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    let Some(final_path_parent) = final_path.parent() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("File {final_path:?} has no parent"),
        ));
    };
    fs::remove_file(tmp_path).or_else(ignore_not_found)?;

    let do_write = || -> io::Result<()> {
        // `create_new` so that, if we race with ourselves or something else,
        // we bail out instead of causing damage.
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file); // don't keep the fd open for longer than we have to

        fs::rename(tmp_path, final_path)?;

        let final_parent_dirfd = fs::OpenOptions::new().read(true).open(final_path_parent)?;
        final_parent_dirfd.sync_all()?;
        Ok(())
    };

    do_write().map_err(|e| {
        let _ = fs::remove_file(tmp_path);
        e
    })
}
