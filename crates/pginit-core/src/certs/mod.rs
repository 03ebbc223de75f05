//! Certificate staging and reload.
//!
//! Secret volumes are mounted read-only with permissions PostgreSQL's
//! `libpq` rejects for private keys, so replication certificates are copied
//! into a private scratch directory before the server or Patroni uses them.

pub mod reload;

use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use tracing::debug;

pub use reload::{CertificateWatcher, PostmasterSignal, ReloadSignal};

const PRIVATE_DIRECTORY_MODE: u32 = 0o700;
const PRIVATE_FILE_MODE: u32 = 0o600;

/// Copies each of `files`, relative to `source`, into `destination` under
/// its base name.
///
/// `destination` is created with mode 0700 and every file is written with
/// mode 0600. Each file appears by rename, so a reader sees either the old
/// or the new content.
pub fn install_private(source: &Path, files: &[&str], destination: &Path) -> io::Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(PRIVATE_DIRECTORY_MODE)
        .create(destination)?;
    fs::set_permissions(destination, Permissions::from_mode(PRIVATE_DIRECTORY_MODE))?;

    for file in files {
        let from = source.join(file);
        let name = from.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no file name", from.display()),
            )
        })?;
        let to = destination.join(name);

        let content = fs::read(&from)?;
        let mut staged = tempfile::Builder::new()
            .prefix(".install-")
            .tempfile_in(destination)?;
        staged.write_all(&content)?;
        staged
            .as_file()
            .set_permissions(Permissions::from_mode(PRIVATE_FILE_MODE))?;
        staged.as_file().sync_all()?;
        staged.persist(&to).map_err(|e| e.error)?;

        debug!("installed {} as {}", from.display(), to.display());
    }
    Ok(())
}
