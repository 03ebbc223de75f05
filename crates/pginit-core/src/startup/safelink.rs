//! Relocation of the WAL directory behind a symbolic link.
//!
//! PostgreSQL always writes WAL into `$PGDATA/pg_wal`. The supported way to
//! keep those files elsewhere is to make `pg_wal` a symbolic link, which is
//! what `initdb --waldir` does. [`safelink`] moves whatever `pg_wal`
//! currently resolves to onto the desired location and points `pg_wal`
//! there, refusing every case where two sets of WAL would have to be merged.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::info;

use super::PrepareError;

/// Result of [`safelink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relink {
    /// `name` already resolved to the desired location.
    Unchanged,
    /// The contents of `from` now live at the desired location.
    Moved { from: PathBuf },
}

/// Moves what `name` resolves to onto `desired` and replaces `name` with a
/// symbolic link to `desired`.
pub fn safelink(desired: &Path, name: &Path) -> Result<Relink, PrepareError> {
    let current = match fs::canonicalize(name) {
        Ok(path) => path,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PrepareError::WalRelocation(format!(
                "{} does not resolve to anything that can be moved to {}",
                name.display(),
                desired.display()
            )));
        }
        Err(e) => return Err(PrepareError::io(format!("resolving {}", name.display()), e)),
    };

    if current == desired || fs::canonicalize(desired).is_ok_and(|d| d == current) {
        return Ok(Relink::Unchanged);
    }

    let current_meta = fs::metadata(&current)
        .map_err(|e| PrepareError::io(format!("inspecting {}", current.display()), e))?;
    let desired_meta = match fs::metadata(desired) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(PrepareError::io(format!("inspecting {}", desired.display()), e)),
    };

    if current_meta.is_dir() {
        match &desired_meta {
            Some(meta) if !meta.is_dir() => {
                return Err(PrepareError::WalRelocation(format!(
                    "cannot overwrite non-directory {} with directory {}",
                    desired.display(),
                    current.display()
                )));
            }
            Some(_) if !is_empty_dir(desired)? => {
                return Err(PrepareError::WalRelocation(format!(
                    "refusing to merge {} into non-empty directory {}",
                    current.display(),
                    desired.display()
                )));
            }
            _ => {}
        }
    } else if desired_meta.as_ref().is_some_and(fs::Metadata::is_dir) {
        return Err(PrepareError::WalRelocation(format!(
            "cannot overwrite directory {} with non-directory {}",
            desired.display(),
            current.display()
        )));
    }

    info!("moving {} to {}", current.display(), desired.display());
    move_path(&current, desired).map_err(|e| {
        PrepareError::io(
            format!("moving {} to {}", current.display(), desired.display()),
            e,
        )
    })?;

    replace_with_symlink(desired, name)
        .map_err(|e| PrepareError::io(format!("linking {}", name.display()), e))?;

    Ok(Relink::Moved { from: current })
}

fn is_empty_dir(path: &Path) -> Result<bool, PrepareError> {
    let mut entries = fs::read_dir(path)
        .map_err(|e| PrepareError::io(format!("reading {}", path.display()), e))?;
    Ok(entries.next().is_none())
}

/// Renames `from` to `to`; across filesystems the tree is copied and the
/// source removed, as `mv` does.
fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            copy_tree(from, to)?;
            if fs::symlink_metadata(from)?.is_dir() {
                fs::remove_dir_all(from)
            } else {
                fs::remove_file(from)
            }
        }
        other => other,
    }
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(from)?;
    if meta.file_type().is_symlink() {
        symlink(fs::read_link(from)?, to)
    } else if meta.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_tree(&entry.path(), &to.join(entry.file_name()))?;
        }
        fs::set_permissions(to, meta.permissions())
    } else {
        fs::copy(from, to).map(|_| ())
    }
}

/// Points `name` at `target` in one rename so no reader sees it missing.
fn replace_with_symlink(target: &Path, name: &Path) -> io::Result<()> {
    let file_name = name
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "link has no file name"))?;
    let mut staging_name = std::ffi::OsString::from(".");
    staging_name.push(file_name);
    staging_name.push(".link");
    let staging = name.with_file_name(staging_name);

    match fs::remove_file(&staging) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    symlink(target, &staging)?;
    fs::rename(&staging, name)
}
