//! Preparation of the data volume before PostgreSQL starts.
//!
//! [`DirectoryPreparer::run`] performs the startup protocol of an instance
//! container in order:
//!
//! 1. check the server binary's major version
//! 2. check the configured data directory, preferring a restore's
//!    `<PGDATA>_bootstrap` sibling when one exists
//! 3. create or repair the data, tablespace, and log directories
//! 4. stage the replication certificates with private permissions
//! 5. write the `pg_rewind` wrapper when data encryption is configured
//! 6. stop if the cluster is not initialized yet
//! 7. check the data directory's major version
//! 8. make sure `postgresql.conf` exists
//! 9. move WAL to its configured location behind `pg_wal`
//! 10. remove a leftover `recovery.signal`
//!
//! Every step is idempotent, so a container that dies halfway through
//! converges on the next start.

pub mod ownership;
pub mod safelink;

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::certs;
use crate::cluster::Cluster;
use crate::layout;

pub use ownership::{Identity, Repair, ensure_directory, permission_chain};
pub use safelink::{Relink, safelink};

const DATA_DIRECTORY_MODE: u32 = 0o700;
const LOG_DIRECTORY_MODE: u32 = 0o775;
const WRAPPER_MODE: u32 = 0o755;

/// Error type for startup failures. Every variant is fatal.
#[derive(Debug)]
pub enum PrepareError {
    /// A major version did not match the expected one.
    VersionMismatch {
        what: String,
        expected: u32,
        found: String,
    },
    /// The server would not use `$PGDATA` as its data directory.
    DataDirectoryMismatch { expected: PathBuf, found: String },
    /// A directory exists but cannot be made usable.
    OwnershipConflict { path: PathBuf, chain: Vec<String> },
    WalRelocation(String),
    /// An external program could not be run.
    Command { program: String, message: String },
    Io { context: String, source: io::Error },
}

impl PrepareError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        PrepareError::Io {
            context: context.into(),
            source,
        }
    }
}

impl std::fmt::Display for PrepareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepareError::VersionMismatch {
                what,
                expected,
                found,
            } => write!(
                f,
                "Expected {} version {}, found {:?}",
                what, expected, found
            ),
            PrepareError::DataDirectoryMismatch { expected, found } => write!(
                f,
                "Expected matching config and data directories: {} != {}",
                found,
                expected.display()
            ),
            PrepareError::OwnershipConflict { path, chain } => {
                write!(f, "Permissions! cannot use {}", path.display())?;
                for line in chain {
                    write!(f, "\n{}", line)?;
                }
                Ok(())
            }
            PrepareError::WalRelocation(msg) => write!(f, "WAL relocation failed: {}", msg),
            PrepareError::Command { program, message } => {
                write!(f, "{} failed: {}", program, message)
            }
            PrepareError::Io { context, source } => write!(f, "{}: {}", context, source),
        }
    }
}

impl std::error::Error for PrepareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PrepareError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for PrepareError {
    fn from(e: io::Error) -> Self {
        PrepareError::io("I/O error", e)
    }
}

/// The `postgres` executable as seen by the startup protocol.
pub trait ServerBinary {
    /// Output of `postgres --version`.
    fn version(&self) -> Result<String, PrepareError>;

    /// Value of the runtime parameter `name` for the cluster at `pgdata`,
    /// as printed by `postgres -C`.
    fn setting(&self, pgdata: &Path, name: &str) -> Result<String, PrepareError>;
}

/// Runs a real `postgres` executable.
#[derive(Debug, Clone)]
pub struct PostgresBinary {
    program: String,
}

impl PostgresBinary {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn output(&self, command: &mut Command) -> Result<String, PrepareError> {
        let output = command.output().map_err(|e| PrepareError::Command {
            program: self.program.clone(),
            message: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(PrepareError::Command {
                program: self.program.clone(),
                message: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ServerBinary for PostgresBinary {
    fn version(&self) -> Result<String, PrepareError> {
        self.output(Command::new(&self.program).arg("--version"))
    }

    fn setting(&self, pgdata: &Path, name: &str) -> Result<String, PrepareError> {
        self.output(
            Command::new(&self.program)
                .arg("-D")
                .arg(pgdata)
                .arg("-C")
                .arg(name),
        )
    }
}

/// Returns true when `postgres --version` output names major `expected`,
/// as in `postgres (PostgreSQL) 16.4`.
pub fn matches_major(output: &str, expected: u32) -> bool {
    output.contains(&format!(") {}.", expected))
}

/// Inputs of the startup protocol.
#[derive(Debug, Clone)]
pub struct PrepareConfig {
    pub expected_version: u32,
    /// `$PGDATA`.
    pub pgdata: PathBuf,
    pub wal_directory: PathBuf,
    pub pgbackrest_log_directory: PathBuf,
    pub tablespace_directories: Vec<PathBuf>,
    /// Server log directory to create; `None` leaves it to the server.
    pub log_directory: Option<PathBuf>,
    /// Mount of the certificate volume.
    pub certificate_directory: PathBuf,
    /// Private copy of the replication certificates.
    pub scratch_directory: PathBuf,
    pub encryption_key_command: bool,
    pub tde_wrapper: PathBuf,
    pub postgres_bin: String,
}

impl PrepareConfig {
    /// Derives the protocol inputs for `cluster` from the volume layout.
    pub fn for_cluster(cluster: &Cluster) -> Self {
        Self {
            expected_version: cluster.postgres_version,
            pgdata: PathBuf::from(layout::data_directory(cluster)),
            wal_directory: PathBuf::from(layout::wal_directory(cluster)),
            pgbackrest_log_directory: PathBuf::from(layout::PGBACKREST_LOG_PATH),
            tablespace_directories: cluster
                .tablespaces
                .iter()
                .map(|name| PathBuf::from(layout::tablespace_directory(name)))
                .collect(),
            log_directory: None,
            certificate_directory: PathBuf::from(layout::CERT_MOUNT_PATH),
            scratch_directory: PathBuf::from(layout::REPLICATION_TMP),
            encryption_key_command: cluster.has_encryption_key_command(),
            tde_wrapper: PathBuf::from(layout::TDE_REWIND_WRAPPER),
            postgres_bin: "postgres".to_string(),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    /// No cluster exists yet; Patroni will run `initdb`.
    Uninitialized { data_directory: PathBuf },
    Initialized {
        data_directory: PathBuf,
        wal_directory: PathBuf,
    },
}

/// Runs the startup protocol against one instance's volumes.
pub struct DirectoryPreparer<B: ServerBinary> {
    config: PrepareConfig,
    binary: B,
    identity: Identity,
}

impl<B: ServerBinary> DirectoryPreparer<B> {
    pub fn new(config: PrepareConfig, binary: B) -> Self {
        Self {
            config,
            binary,
            identity: Identity::current(),
        }
    }

    /// Overrides the user the ownership checks are made for.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn config(&self) -> &PrepareConfig {
        &self.config
    }

    pub fn run(&self) -> Result<Prepared, PrepareError> {
        let config = &self.config;
        info!(uid = self.identity.uid, groups = ?self.identity.groups, "preparing instance");

        let version = self.binary.version()?;
        info!("postgres path: {}", config.postgres_bin);
        info!("postgres version: {}", version);
        if !matches_major(&version, config.expected_version) {
            return Err(PrepareError::VersionMismatch {
                what: "PostgreSQL executable".to_string(),
                expected: config.expected_version,
                found: version,
            });
        }

        let data_directory = self.data_directory()?;
        info!("data directory: {}", data_directory.display());

        ensure_directory(&data_directory, DATA_DIRECTORY_MODE, &self.identity)?;
        ensure_directory(
            &config.pgbackrest_log_directory,
            LOG_DIRECTORY_MODE,
            &self.identity,
        )?;
        for tablespace in &config.tablespace_directories {
            ensure_directory(tablespace, DATA_DIRECTORY_MODE, &self.identity)?;
        }
        if let Some(log_directory) = &config.log_directory {
            ensure_directory(log_directory, LOG_DIRECTORY_MODE, &self.identity)?;
        }

        certs::install_private(
            &config.certificate_directory,
            &layout::REPLICATION_FILES,
            &config.scratch_directory,
        )
        .map_err(|e| {
            PrepareError::io(
                format!(
                    "installing replication certificates into {}",
                    config.scratch_directory.display()
                ),
                e,
            )
        })?;

        if config.encryption_key_command {
            self.write_rewind_wrapper()?;
        }

        let version_file = data_directory.join("PG_VERSION");
        let data_version = match fs::read_to_string(&version_file) {
            Ok(content) => content.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("data directory is not initialized");
                return Ok(Prepared::Uninitialized { data_directory });
            }
            Err(e) => {
                return Err(PrepareError::io(
                    format!("reading {}", version_file.display()),
                    e,
                ));
            }
        };
        info!("data version: {}", data_version);
        if data_version != config.expected_version.to_string() {
            return Err(PrepareError::VersionMismatch {
                what: "data directory".to_string(),
                expected: config.expected_version,
                found: data_version,
            });
        }

        // The server fails to start without one even when every parameter
        // comes from the command line.
        let postgresql_conf = data_directory.join("postgresql.conf");
        if !postgresql_conf.exists() {
            info!("creating empty {}", postgresql_conf.display());
            fs::write(&postgresql_conf, "")
                .map_err(|e| PrepareError::io(format!("creating {}", postgresql_conf.display()), e))?;
        }

        match safelink(&config.wal_directory, &data_directory.join("pg_wal"))? {
            Relink::Unchanged => debug!("WAL already in {}", config.wal_directory.display()),
            Relink::Moved { from } => info!(
                "WAL moved from {} to {}",
                from.display(),
                config.wal_directory.display()
            ),
        }

        let recovery_signal = data_directory.join("recovery.signal");
        match fs::remove_file(&recovery_signal) {
            Ok(()) => info!("removed {}", recovery_signal.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PrepareError::io(
                    format!("removing {}", recovery_signal.display()),
                    e,
                ));
            }
        }

        Ok(Prepared::Initialized {
            data_directory,
            wal_directory: config.wal_directory.clone(),
        })
    }

    /// Returns the directory the remaining steps operate on.
    fn data_directory(&self) -> Result<PathBuf, PrepareError> {
        let pgdata = &self.config.pgdata;

        if pgdata.is_dir() {
            let found = match self.binary.setting(pgdata, "data_directory") {
                Ok(found) => found,
                Err(e) => {
                    warn!("cannot read data_directory from the server: {}", e);
                    pgdata.to_string_lossy().into_owned()
                }
            };
            if Path::new(&found) != pgdata.as_path() {
                return Err(PrepareError::DataDirectoryMismatch {
                    expected: pgdata.clone(),
                    found,
                });
            }
        }

        let bootstrap = layout::bootstrap_directory(pgdata);
        if bootstrap.is_dir() {
            info!("bootstrap directory: {}", bootstrap.display());
            return Ok(bootstrap);
        }
        Ok(pgdata.clone())
    }

    fn write_rewind_wrapper(&self) -> Result<(), PrepareError> {
        let path = &self.config.tde_wrapper;
        let script = format!(
            "#!/bin/bash\nexec pg_rewind -K \"$({} -C encryption_key_command)\" \"$@\"\n",
            self.config.postgres_bin
        );
        fs::write(path, script)
            .and_then(|()| fs::set_permissions(path, Permissions::from_mode(WRAPPER_MODE)))
            .map_err(|e| PrepareError::io(format!("writing {}", path.display()), e))?;
        info!("wrote {}", path.display());
        Ok(())
    }
}
