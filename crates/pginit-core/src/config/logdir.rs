//! Sanitizing of the server `log_directory` parameter.
//!
//! PostgreSQL writes its log files into whatever directory this parameter
//! names, relative to the data directory when the path is relative. A
//! careless or hostile value could point the server at its own catalog,
//! WAL, or control files. [`sanitize_log_directory`] maps any request to an
//! absolute path that cannot collide with those.

use crate::cluster::Cluster;
use crate::layout::{self, DATA_MOUNT_PATH, DEFAULT_LOG_SUBDIRECTORY, TMP_MOUNT_PATH, WAL_MOUNT_PATH};

/// Relative names PostgreSQL creates inside its data directory.
const RESERVED_NAMES: &[&str] = &[
    "base",
    "global",
    "current_logfiles",
    "PG_VERSION",
    "postgresql.conf",
    "postgresql.auto.conf",
    "recovery.signal",
    "standby.signal",
];

/// Prefixes of data-directory entries owned by PostgreSQL.
const RESERVED_PREFIXES: &[&str] = &["pg_", "postmaster"];

/// Suffixes of WAL archive files.
const RESERVED_SUFFIXES: &[&str] = &[".history", ".partial", ".backup"];

/// Returns an absolute log directory that is safe for `cluster`.
///
/// Never performs I/O and always returns an absolute path.
pub fn sanitize_log_directory(cluster: &Cluster, requested: &str) -> String {
    let directory = strip_climb_out(&clean(requested));
    let data = layout::data_directory(cluster);

    // PostgreSQL's own default.
    if directory == "log" {
        return format!("{}/log", data);
    }

    if matches!(directory.as_str(), "" | "." | "/") || is_reserved(cluster, &directory) {
        return default_log_directory(cluster, &directory);
    }

    if !directory.starts_with('/') {
        return format!("{}/{}", data, directory);
    }

    directory
}

/// Picks a log directory on the volume `directory` points at.
fn default_log_directory(cluster: &Cluster, directory: &str) -> String {
    let volume = if cluster.wal_volume && is_within(directory, WAL_MOUNT_PATH) {
        WAL_MOUNT_PATH
    } else if cluster.temp_volume && is_within(directory, TMP_MOUNT_PATH) {
        TMP_MOUNT_PATH
    } else {
        DATA_MOUNT_PATH
    };
    format!("{}/{}", volume, DEFAULT_LOG_SUBDIRECTORY)
}

fn is_reserved(cluster: &Cluster, directory: &str) -> bool {
    match directory.strip_prefix('/') {
        Some(absolute) => is_reserved_absolute(cluster, absolute),
        None => directory.split('/').next().is_some_and(is_reserved_name),
    }
}

/// Absolute paths inside a versioned data, WAL, or bootstrap directory on a
/// known volume. The server's own `log` subdirectory stays allowed.
fn is_reserved_absolute(cluster: &Cluster, absolute: &str) -> bool {
    let full = format!("/{}", absolute);
    let own_log = format!("{}/log", layout::data_directory(cluster));
    if is_within(&full, &own_log) {
        return false;
    }

    let mut components = absolute.split('/');
    let volume = components.next().unwrap_or("");
    if !matches!(volume, "pgdata" | "pgwal" | "pgtmp") {
        return false;
    }
    components.next().is_some_and(is_versioned_directory)
}

/// Matches `pg<digits>`, `pg<digits>_wal`, and `pg<digits>_bootstrap`.
fn is_versioned_directory(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("pg") else {
        return false;
    };
    let digits = rest
        .strip_suffix("_wal")
        .or_else(|| rest.strip_suffix("_bootstrap"))
        .unwrap_or(rest);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
        || RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
        || RESERVED_SUFFIXES.iter().any(|s| name.ends_with(s))
        || is_wal_file_name(name)
}

/// WAL segment and relation-like names: 24 or more hexadecimal digits.
fn is_wal_file_name(name: &str) -> bool {
    let hex = name.split('.').next().unwrap_or("");
    hex.len() >= 24 && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_within(path: &str, root: &str) -> bool {
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

/// Lexically resolves `.`, `..`, and repeated slashes.
///
/// `..` at the root is dropped; leading `..` in a relative path is kept.
/// The empty path cleans to `.`.
fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            _ => parts.push(part),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Removes leading `../` segments from a cleaned relative path.
fn strip_climb_out(path: &str) -> String {
    let mut rest = path;
    while let Some(stripped) = rest.strip_prefix("../") {
        rest = stripped;
    }
    if rest == ".." {
        rest = ".";
    }
    rest.to_string()
}
