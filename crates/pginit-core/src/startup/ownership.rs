//! Ownership and permission repair of instance directories.
//!
//! PostgreSQL refuses to start unless its directories belong to the user
//! running the server. Some storage providers honour the pod's `fsGroup`
//! by handing out volumes owned by another uid with the setgid bit and
//! group write permission set. Such a directory can be taken over by
//! moving its entries into a fresh sibling that the running user owns.

use std::ffi::OsString;
use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::PrepareError;

const SET_GID: u32 = 0o2000;
const GROUP_WRITE: u32 = 0o020;

/// The user and groups the process runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub groups: Vec<u32>,
}

impl Identity {
    /// Returns the effective uid and every group of this process.
    pub fn current() -> Self {
        // SAFETY: these calls only read process credentials.
        let uid = unsafe { libc::geteuid() };
        let mut groups = vec![unsafe { libc::getegid() }];

        // SAFETY: a zero-sized query returns the number of groups.
        let count = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
        if count > 0 {
            let mut buffer: Vec<libc::gid_t> = vec![0; count as usize];
            // SAFETY: the buffer holds `count` entries.
            let filled = unsafe { libc::getgroups(count, buffer.as_mut_ptr()) };
            if filled > 0 {
                buffer.truncate(filled as usize);
                groups.extend(buffer);
            }
        }
        groups.sort_unstable();
        groups.dedup();

        Self { uid, groups }
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.groups.contains(&gid)
    }
}

/// What is on disk at a directory path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryState {
    pub is_dir: bool,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits including setuid, setgid, and sticky.
    pub mode: u32,
}

impl DirectoryState {
    /// Inspects `path`, following symbolic links. Returns `None` when nothing exists.
    pub fn of(path: &Path) -> io::Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Self {
                is_dir: meta.is_dir(),
                uid: meta.uid(),
                gid: meta.gid(),
                mode: meta.mode() & 0o7777,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The fingerprint a Kubernetes `fsGroup` pass leaves behind.
    fn is_group_owned_by(&self, identity: &Identity) -> bool {
        self.mode & SET_GID != 0 && self.mode & GROUP_WRITE != 0 && identity.in_group(self.gid)
    }
}

/// The action taken for one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// Nothing was there; the directory was created.
    Create,
    /// Already owned by the running user.
    Keep,
    /// Owned by another user through `fsGroup`; rebuilt in place.
    Recreate,
    /// Cannot be used safely.
    Conflict,
}

/// Decides how to repair a directory in `state` for `identity`.
pub fn plan(state: Option<&DirectoryState>, identity: &Identity) -> Repair {
    match state {
        None => Repair::Create,
        Some(s) if !s.is_dir => Repair::Conflict,
        Some(s) if s.uid == identity.uid => Repair::Keep,
        Some(s) if s.is_group_owned_by(identity) => Repair::Recreate,
        Some(_) => Repair::Conflict,
    }
}

/// Makes `path` a directory owned by `identity`, creating it with `mode`
/// or rebuilding it with `mode` when needed.
pub fn ensure_directory(
    path: &Path,
    mode: u32,
    identity: &Identity,
) -> Result<Repair, PrepareError> {
    restore_interrupted(path)
        .map_err(|e| PrepareError::io(format!("restoring {}", path.display()), e))?;

    let state = DirectoryState::of(path)
        .map_err(|e| PrepareError::io(format!("inspecting {}", path.display()), e))?;

    let repair = plan(state.as_ref(), identity);
    match repair {
        Repair::Create => {
            info!("creating directory {} with mode {:o}", path.display(), mode);
            create_directory(path, mode)
                .map_err(|e| PrepareError::io(format!("creating {}", path.display()), e))?;
        }
        Repair::Keep => {
            debug!("directory {} is already owned by uid {}", path.display(), identity.uid);
        }
        Repair::Recreate => {
            info!("recreating directory {} with mode {:o}", path.display(), mode);
            recreate(path, mode)
                .map_err(|e| PrepareError::io(format!("recreating {}", path.display()), e))?;
        }
        Repair::Conflict => {
            return Err(PrepareError::OwnershipConflict {
                path: path.to_path_buf(),
                chain: permission_chain(path),
            });
        }
    }
    Ok(repair)
}

fn create_directory(path: &Path, mode: u32) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(mode).create(path)?;
    // The umask may have removed bits from the requested mode.
    fs::set_permissions(path, Permissions::from_mode(mode))
}

/// Replaces `path` with a directory owned by the running user.
///
/// A sibling on the same filesystem receives every entry by rename, so
/// nothing is copied. When a rename fails the entries already moved are
/// put back before the error is returned.
pub fn recreate(path: &Path, mode: u32) -> io::Result<()> {
    recreate_with(path, mode, |from, to| fs::rename(from, to))
}

fn recreate_with<R>(path: &Path, mode: u32, mut rename: R) -> io::Result<()>
where
    R: FnMut(&Path, &Path) -> io::Result<()>,
{
    let staging = staging_path(path)?;
    restore_interrupted(path)?;

    DirBuilder::new().mode(mode).create(&staging)?;
    fs::set_permissions(&staging, Permissions::from_mode(mode))?;

    let mut moved: Vec<OsString> = Vec::new();
    for entry in fs::read_dir(path)? {
        let name = entry?.file_name();
        if let Err(e) = rename(&path.join(&name), &staging.join(&name)) {
            roll_back(path, &staging, &moved);
            return Err(e);
        }
        moved.push(name);
    }
    fs::remove_dir(path)?;
    fs::rename(&staging, path)
}

/// The sibling that holds the entries of `path` while it is recreated.
fn staging_path(path: &Path) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .filter(|_| path.parent().is_some_and(|p| !p.as_os_str().is_empty()))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "directory has no parent"))?;
    let mut staging = OsString::from(".");
    staging.push(name);
    staging.push(".recreate");
    Ok(path.with_file_name(staging))
}

fn roll_back(path: &Path, staging: &Path, moved: &[OsString]) {
    for name in moved.iter().rev() {
        if let Err(e) = fs::rename(staging.join(name), path.join(name)) {
            warn!(
                "cannot move {} back into {}: {}",
                staging.join(name).display(),
                path.display(),
                e
            );
        }
    }
    if let Err(e) = fs::remove_dir(staging) {
        warn!("cannot remove {}: {}", staging.display(), e);
    }
}

/// Finishes or undoes a [`recreate`] of `path` that was killed part way.
///
/// With `path` gone the staging directory already holds every entry and
/// takes its place. Otherwise its entries return to `path`.
fn restore_interrupted(path: &Path) -> io::Result<()> {
    let Ok(staging) = staging_path(path) else {
        return Ok(());
    };
    match fs::symlink_metadata(&staging) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    if fs::symlink_metadata(path).is_err() {
        info!("completing interrupted recreate of {}", path.display());
        return fs::rename(&staging, path);
    }

    info!("restoring entries of {} from {}", path.display(), staging.display());
    for entry in fs::read_dir(&staging)? {
        let name = entry?.file_name();
        fs::rename(staging.join(&name), path.join(&name))?;
    }
    fs::remove_dir(&staging)
}

/// Describes every directory from the root down to `path`, one line each,
/// as `<mode> <uid> <gid> <path>`. Symbolic links are described as links.
pub fn permission_chain(path: &Path) -> Vec<String> {
    let mut ancestors: Vec<&Path> = path.ancestors().filter(|p| !p.as_os_str().is_empty()).collect();
    ancestors.reverse();

    ancestors
        .into_iter()
        .map(|p| match fs::symlink_metadata(p) {
            Ok(meta) => format!(
                "{} {:>4} {:>4} {}",
                mode_string(&meta),
                meta.uid(),
                meta.gid(),
                p.display()
            ),
            Err(e) => format!("?????????? {:>4} {:>4} {} ({})", "?", "?", p.display(), e),
        })
        .collect()
}

/// Formats file type and permission bits the way `ls -l` does.
fn mode_string(meta: &fs::Metadata) -> String {
    let mode = meta.mode();
    let kind = if meta.is_dir() {
        'd'
    } else if meta.file_type().is_symlink() {
        'l'
    } else {
        '-'
    };

    let triple = |shift: u32, special: bool, set: char, unset: char| {
        let bits = (mode >> shift) & 0o7;
        let r = if bits & 0o4 != 0 { 'r' } else { '-' };
        let w = if bits & 0o2 != 0 { 'w' } else { '-' };
        let x = match (bits & 0o1 != 0, special) {
            (true, true) => set,
            (false, true) => unset,
            (true, false) => 'x',
            (false, false) => '-',
        };
        [r, w, x]
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    out.extend(triple(6, mode & 0o4000 != 0, 's', 'S'));
    out.extend(triple(3, mode & 0o2000 != 0, 's', 'S'));
    out.extend(triple(0, mode & 0o1000 != 0, 't', 'T'));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn entries(path: &Path) -> BTreeSet<String> {
        fs::read_dir(path)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().mode() & 0o7777
    }

    /// An identity that does not own anything it did not create itself.
    fn stranger(path: &Path) -> Identity {
        let meta = fs::metadata(path).unwrap();
        Identity {
            uid: meta.uid().wrapping_add(1),
            groups: vec![meta.gid()],
        }
    }

    #[test]
    fn test_plan() {
        let me = Identity {
            uid: 26,
            groups: vec![26, 1000],
        };
        let dir = |uid, gid, mode| DirectoryState {
            is_dir: true,
            uid,
            gid,
            mode,
        };

        assert_eq!(plan(None, &me), Repair::Create);
        assert_eq!(plan(Some(&dir(26, 26, 0o700)), &me), Repair::Keep);
        assert_eq!(plan(Some(&dir(0, 1000, 0o2775)), &me), Repair::Recreate);
        assert_eq!(plan(Some(&dir(0, 1000, 0o775)), &me), Repair::Conflict);
        assert_eq!(plan(Some(&dir(0, 1000, 0o2755)), &me), Repair::Conflict);
        assert_eq!(plan(Some(&dir(0, 5, 0o2775)), &me), Repair::Conflict);

        let file = DirectoryState {
            is_dir: false,
            ..dir(26, 26, 0o600)
        };
        assert_eq!(plan(Some(&file), &me), Repair::Conflict);
    }

    #[test]
    fn test_create_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pgbackrest/log");

        let repair = ensure_directory(&path, 0o775, &Identity::current()).unwrap();

        assert_eq!(repair, Repair::Create);
        assert!(path.is_dir());
        assert_eq!(mode_of(&path), 0o775);
    }

    #[test]
    fn test_owned_directory_is_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pg16");
        fs::create_dir(&path).unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o750)).unwrap();
        fs::write(path.join("PG_VERSION"), "16\n").unwrap();
        let inode = fs::metadata(&path).unwrap().ino();

        let repair = ensure_directory(&path, 0o700, &Identity::current()).unwrap();

        assert_eq!(repair, Repair::Keep);
        assert_eq!(fs::metadata(&path).unwrap().ino(), inode);
        assert_eq!(mode_of(&path), 0o750);
    }

    #[test]
    fn test_group_owned_directory_is_recreated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pg16");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("PG_VERSION"), "16\n").unwrap();
        fs::write(path.join(".hidden"), "x").unwrap();
        fs::create_dir(path.join("base")).unwrap();
        fs::write(path.join("base/1"), "data").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o2775)).unwrap();
        let before = entries(&path);

        let identity = stranger(&path);
        let repair = ensure_directory(&path, 0o700, &identity).unwrap();

        assert_eq!(repair, Repair::Recreate);
        assert_eq!(entries(&path), before);
        assert_eq!(mode_of(&path), 0o700);
        assert_eq!(fs::read_to_string(path.join("base/1")).unwrap(), "data");
        // Only the directory itself remains next to the tempdir root.
        assert_eq!(entries(tmp.path()), BTreeSet::from(["pg16".to_string()]));
    }

    #[test]
    fn test_foreign_directory_without_group_write_is_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pg16");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("PG_VERSION"), "16\n").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();

        let identity = stranger(&path);
        let err = ensure_directory(&path, 0o700, &identity).unwrap_err();

        match &err {
            PrepareError::OwnershipConflict { path: p, chain } => {
                assert_eq!(p, &path);
                assert!(chain.last().unwrap().ends_with(&*path.to_string_lossy()));
                assert!(chain.first().unwrap().ends_with(" /"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!err.to_string().is_empty());
        assert!(path.join("PG_VERSION").exists());
    }

    #[test]
    fn test_failed_recreate_puts_entries_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pg16");
        fs::create_dir(&path).unwrap();
        for name in ["a", "b", "c", "d"] {
            fs::write(path.join(name), name).unwrap();
        }
        let before = entries(&path);

        // Fails on the third entry, whatever the directory order is.
        let mut calls = 0;
        let err = recreate_with(&path, 0o700, |from, to| {
            calls += 1;
            if calls == 3 {
                return Err(io::Error::new(io::ErrorKind::ResourceBusy, "busy"));
            }
            fs::rename(from, to)
        })
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::ResourceBusy);
        assert_eq!(entries(&path), before);
        assert_eq!(entries(tmp.path()), BTreeSet::from(["pg16".to_string()]));

        recreate(&path, 0o700).unwrap();
        assert_eq!(entries(&path), before);
        assert_eq!(mode_of(&path), 0o700);
    }

    #[test]
    fn test_interrupted_recreate_is_undone() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pg16");
        let staging = tmp.path().join(".pg16.recreate");
        fs::create_dir(&path).unwrap();
        fs::create_dir(&staging).unwrap();
        fs::write(path.join("PG_VERSION"), "16\n").unwrap();
        fs::create_dir(staging.join("base")).unwrap();
        fs::write(staging.join("base/1"), "data").unwrap();

        let repair = ensure_directory(&path, 0o700, &Identity::current()).unwrap();

        assert_eq!(repair, Repair::Keep);
        assert_eq!(
            entries(&path),
            BTreeSet::from(["PG_VERSION".to_string(), "base".to_string()])
        );
        assert_eq!(fs::read_to_string(path.join("base/1")).unwrap(), "data");
        assert!(!staging.exists());
    }

    #[test]
    fn test_interrupted_recreate_after_rmdir_is_completed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pg16");
        let staging = tmp.path().join(".pg16.recreate");
        fs::create_dir(&staging).unwrap();
        fs::write(staging.join("PG_VERSION"), "16\n").unwrap();

        let repair = ensure_directory(&path, 0o700, &Identity::current()).unwrap();

        assert_eq!(repair, Repair::Keep);
        assert_eq!(fs::read_to_string(path.join("PG_VERSION")).unwrap(), "16\n");
        assert!(!staging.exists());
    }

    #[test]
    fn test_permission_chain_shows_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real");
        fs::create_dir_all(real.join("pg16")).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let chain = permission_chain(&link.join("pg16"));
        let link_line = &chain[chain.len() - 2];
        assert!(link_line.starts_with('l'), "{}", link_line);
        assert!(link_line.ends_with("/link"));
        assert!(chain.last().unwrap().starts_with('d'));
    }

    #[test]
    fn test_mode_string() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("d");
        fs::create_dir(&path).unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o2770)).unwrap();
        assert_eq!(mode_string(&fs::metadata(&path).unwrap()), "drwxrws---");

        let file = tmp.path().join("f");
        fs::write(&file, "").unwrap();
        fs::set_permissions(&file, Permissions::from_mode(0o640)).unwrap();
        assert_eq!(mode_string(&fs::metadata(&file).unwrap()), "-rw-r-----");
    }

    #[test]
    fn test_permission_chain_is_root_first() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b");
        fs::create_dir_all(&path).unwrap();

        let chain = permission_chain(&path);
        assert_eq!(chain.len(), path.ancestors().count());
        assert!(chain[0].ends_with(" /"));
        assert!(chain.last().unwrap().ends_with("/a/b"));
    }
}
