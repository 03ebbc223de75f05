//! Volume layout of a PostgreSQL instance container.
//!
//! Every path that the reconciler mounts and that the startup protocol,
//! the reload sidecar, and the configuration generators agree on lives here.
//!
//! ```text
//! /pgdata/pg<N>                 data directory ($PGDATA)
//! /pgdata/pg<N>_bootstrap       data directory staged by a restore
//! /pgdata/pg<N>_wal             WAL without a dedicated volume
//! /pgwal/pg<N>_wal              WAL on a dedicated volume
//! /pgdata/pgbackrest/log        pgBackRest logs
//! /pgdata/logs/postgres         default server log directory
//! /tablespaces/<name>/data      one directory per tablespace volume
//! /pgconf/tls                   server certificates (read-only)
//! /pgconf/tls/replication       replication client certificates (read-only)
//! /tmp/replication              private copy of the replication certificates
//! ```

use std::path::{Path, PathBuf};

use crate::cluster::Cluster;

/// Mount path of the main data volume.
pub const DATA_MOUNT_PATH: &str = "/pgdata";

/// Mount path of the optional WAL volume.
pub const WAL_MOUNT_PATH: &str = "/pgwal";

/// Mount path of the optional temporary-file volume.
pub const TMP_MOUNT_PATH: &str = "/pgtmp";

/// Parent of every tablespace volume mount.
pub const TABLESPACE_MOUNT_PATH: &str = "/tablespaces";

/// Where the server binds and clients connect to UNIX sockets.
pub const SOCKET_DIRECTORY: &str = "/tmp/postgres";

/// Mount path of the certificate volume.
pub const CERT_MOUNT_PATH: &str = "/pgconf/tls";

/// Replication client certificate, key, and authority, relative to
/// [`CERT_MOUNT_PATH`].
pub const REPLICATION_FILES: [&str; 3] = [
    "replication/tls.crt",
    "replication/tls.key",
    "replication/ca.crt",
];

/// Private scratch copy of the replication client certificates.
pub const REPLICATION_TMP: &str = "/tmp/replication";

/// pgBackRest log directory on the data volume.
pub const PGBACKREST_LOG_PATH: &str = "/pgdata/pgbackrest/log";

/// Server log directory used when the requested one is unsafe, relative to a volume.
pub const DEFAULT_LOG_SUBDIRECTORY: &str = "logs/postgres";

/// Wrapper around `pg_rewind` that supplies the encryption key.
pub const TDE_REWIND_WRAPPER: &str = "/tmp/pg_rewind_tde.sh";

/// Role created by Patroni for streaming replication and `pg_rewind`.
pub const REPLICATION_USER: &str = "_crunchyrepl";

/// Bootstrap superuser.
pub const SUPERUSER: &str = "postgres";

/// Returns `$PGDATA` for the cluster.
pub fn data_directory(cluster: &Cluster) -> String {
    format!("{}/pg{}", DATA_MOUNT_PATH, cluster.postgres_version)
}

/// Returns the directory where an instance stores WAL files.
///
/// Without a dedicated WAL volume the files stay on the data volume.
pub fn wal_directory(cluster: &Cluster) -> String {
    let storage = if cluster.wal_volume {
        WAL_MOUNT_PATH
    } else {
        DATA_MOUNT_PATH
    };
    format!("{}/pg{}_wal", storage, cluster.postgres_version)
}

/// Returns the data directory inside the volume of tablespace `name`.
pub fn tablespace_directory(name: &str) -> String {
    format!("{}/{}/data", TABLESPACE_MOUNT_PATH, name)
}

/// Returns the sibling directory a restore leaves behind for bootstrapping.
pub fn bootstrap_directory(data_directory: &Path) -> PathBuf {
    let mut name = data_directory.as_os_str().to_owned();
    name.push("_bootstrap");
    PathBuf::from(name)
}

/// Environment variables required to invoke PostgreSQL utilities.
pub fn environment(cluster: &Cluster) -> Vec<(&'static str, String)> {
    vec![
        ("PGDATA", data_directory(cluster)),
        ("PGHOST", SOCKET_DIRECTORY.to_string()),
        ("PGPORT", cluster.port.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(version: u32) -> Cluster {
        Cluster {
            postgres_version: version,
            ..Cluster::default()
        }
    }

    #[test]
    fn test_data_directory() {
        assert_eq!(data_directory(&cluster(16)), "/pgdata/pg16");
    }

    #[test]
    fn test_wal_directory_follows_volume() {
        let mut c = cluster(17);
        assert_eq!(wal_directory(&c), "/pgdata/pg17_wal");

        c.wal_volume = true;
        assert_eq!(wal_directory(&c), "/pgwal/pg17_wal");
    }

    #[test]
    fn test_bootstrap_directory_is_sibling() {
        assert_eq!(
            bootstrap_directory(Path::new("/pgdata/pg16")),
            PathBuf::from("/pgdata/pg16_bootstrap")
        );
    }

    #[test]
    fn test_environment() {
        let env = environment(&cluster(15));
        assert!(env.contains(&("PGDATA", "/pgdata/pg15".to_string())));
        assert!(env.contains(&("PGHOST", "/tmp/postgres".to_string())));
        assert!(env.contains(&("PGPORT", "5432".to_string())));
    }
}
