//! Filesystem access behind a trait so `/proc` scanning can be tested
//! without a live system.

use std::io;
use std::path::{Path, PathBuf};

/// Read-only view of a filesystem.
pub trait FileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn exists(&self, path: &Path) -> bool;

    /// Returns the full paths of the direct children of `path`.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }
}

#[cfg(test)]
pub use mock::MockFs;
