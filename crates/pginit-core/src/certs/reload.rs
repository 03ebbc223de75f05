//! Hot reload of server certificates.
//!
//! Kubernetes updates a mounted secret by swapping a symbolic link inside
//! the volume, which changes the modification time of the mount directory.
//! The watcher notices the change, refreshes the private copy of the
//! replication certificates, and asks the postmaster to reload its
//! configuration with SIGHUP.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::fs::FileSystem;
use crate::procfs::{self, ProcStat};

/// Error type for reload failures.
#[derive(Debug)]
pub enum ReloadError {
    /// No process named `postgres` is a child of pid 1.
    NoPostmaster,
    /// Sending the signal failed.
    Signal { pid: u32, source: std::io::Error },
    Io(std::io::Error),
}

impl std::fmt::Display for ReloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReloadError::NoPostmaster => write!(f, "no postmaster process found"),
            ReloadError::Signal { pid, source } => {
                write!(f, "failed to signal pid {}: {}", pid, source)
            }
            ReloadError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ReloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReloadError::Signal { source, .. } => Some(source),
            ReloadError::Io(e) => Some(e),
            ReloadError::NoPostmaster => None,
        }
    }
}

impl From<std::io::Error> for ReloadError {
    fn from(e: std::io::Error) -> Self {
        ReloadError::Io(e)
    }
}

/// Asks the server to reload its configuration.
pub trait ReloadSignal {
    /// Returns the number of processes signalled.
    fn reload(&self) -> Result<usize, ReloadError>;
}

/// Sends SIGHUP to every process named exactly `postgres` whose parent is
/// pid 1, which inside a container is the postmaster started by Patroni.
pub struct PostmasterSignal<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
}

impl<F: FileSystem> PostmasterSignal<F> {
    pub fn new(fs: F, proc_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
        }
    }

    /// Returns the processes that [`reload`](ReloadSignal::reload) signals.
    pub fn postmasters(&self) -> Result<Vec<ProcStat>, ReloadError> {
        let found = procfs::find_processes(&self.fs, &self.proc_path, |stat| {
            stat.comm == "postgres" && stat.ppid == 1
        })?;
        if found.is_empty() {
            return Err(ReloadError::NoPostmaster);
        }
        Ok(found)
    }
}

impl<F: FileSystem> ReloadSignal for PostmasterSignal<F> {
    fn reload(&self) -> Result<usize, ReloadError> {
        let postmasters = self.postmasters()?;
        for stat in &postmasters {
            debug!("sending SIGHUP to pid {}", stat.pid);
            // SAFETY: kill has no memory-safety preconditions.
            let rc = unsafe { libc::kill(stat.pid as libc::pid_t, libc::SIGHUP) };
            if rc != 0 {
                return Err(ReloadError::Signal {
                    pid: stat.pid,
                    source: std::io::Error::last_os_error(),
                });
            }
        }
        Ok(postmasters.len())
    }
}

/// Polls the certificate volume and reloads the server when it changes.
pub struct CertificateWatcher<S: ReloadSignal> {
    certificate_directory: PathBuf,
    scratch_directory: PathBuf,
    files: Vec<String>,
    signal: S,
    baseline: SystemTime,
}

impl<S: ReloadSignal> CertificateWatcher<S> {
    /// Creates a watcher whose baseline is the current time, so certificates
    /// already present at startup do not trigger a reload.
    pub fn new(
        certificate_directory: impl Into<PathBuf>,
        scratch_directory: impl Into<PathBuf>,
        files: &[&str],
        signal: S,
    ) -> Self {
        Self {
            certificate_directory: certificate_directory.into(),
            scratch_directory: scratch_directory.into(),
            files: files.iter().map(|f| f.to_string()).collect(),
            signal,
            baseline: SystemTime::now(),
        }
    }

    pub fn with_baseline(mut self, baseline: SystemTime) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn baseline(&self) -> SystemTime {
        self.baseline
    }

    /// Checks the certificate directory once.
    ///
    /// Returns the modification time of the certificates that were loaded,
    /// or `None` when nothing changed. On error the baseline is kept so the
    /// next poll tries again.
    pub fn poll(&mut self) -> Result<Option<SystemTime>, ReloadError> {
        let modified = std::fs::metadata(&self.certificate_directory)?.modified()?;
        if modified <= self.baseline {
            return Ok(None);
        }

        let files: Vec<&str> = self.files.iter().map(String::as_str).collect();
        crate::certs::install_private(&self.certificate_directory, &files, &self.scratch_directory)?;

        let signalled = self.signal.reload()?;
        self.baseline = SystemTime::now();

        info!(
            "Loaded certificates dated {} ({} process{} signalled)",
            format_time(modified),
            signalled,
            if signalled == 1 { "" } else { "es" }
        );
        Ok(Some(modified))
    }

    /// Polls every `interval` until `running` is cleared.
    pub fn run(&mut self, interval: Duration, running: &AtomicBool) {
        info!(
            "Watching {} every {:?}",
            self.certificate_directory.display(),
            interval
        );

        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.poll() {
                warn!("Certificate reload failed: {}", e);
            }

            let sleep_interval = Duration::from_millis(100);
            let mut remaining = interval;
            while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
                let sleep_time = remaining.min(sleep_interval);
                std::thread::sleep(sleep_time);
                remaining = remaining.saturating_sub(sleep_time);
            }
        }
    }

    pub fn certificate_directory(&self) -> &Path {
        &self.certificate_directory
    }
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time)
        .format("%Y-%m-%d %H:%M:%S%.f %z")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFs;
    use std::cell::Cell;
    use std::fs;

    /// Counts reloads instead of signalling.
    struct Recorder {
        calls: Cell<usize>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Self {
            Self {
                calls: Cell::new(0),
                fail,
            }
        }
    }

    impl ReloadSignal for &Recorder {
        fn reload(&self) -> Result<usize, ReloadError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                Err(ReloadError::NoPostmaster)
            } else {
                Ok(1)
            }
        }
    }

    fn certificate_volume(root: &Path) -> PathBuf {
        let source = root.join("tls");
        fs::create_dir_all(source.join("replication")).unwrap();
        for name in ["tls.crt", "tls.key", "ca.crt"] {
            fs::write(source.join("replication").join(name), name).unwrap();
        }
        source
    }

    fn touch(dir: &Path, time: SystemTime) {
        fs::File::open(dir).unwrap().set_modified(time).unwrap();
    }

    #[test]
    fn test_unchanged_directory_does_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let source = certificate_volume(tmp.path());
        let scratch = tmp.path().join("scratch");
        let recorder = Recorder::new(false);

        let baseline = SystemTime::now();
        touch(&source, baseline - Duration::from_secs(60));
        let mut watcher = CertificateWatcher::new(
            &source,
            &scratch,
            &crate::layout::REPLICATION_FILES,
            &recorder,
        )
        .with_baseline(baseline);

        assert_eq!(watcher.poll().unwrap(), None);
        assert_eq!(recorder.calls.get(), 0);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_change_installs_and_signals() {
        let tmp = tempfile::tempdir().unwrap();
        let source = certificate_volume(tmp.path());
        let scratch = tmp.path().join("scratch");
        let recorder = Recorder::new(false);

        let baseline = SystemTime::now() - Duration::from_secs(60);
        let changed = baseline + Duration::from_secs(30);
        touch(&source, changed);
        let mut watcher = CertificateWatcher::new(
            &source,
            &scratch,
            &crate::layout::REPLICATION_FILES,
            &recorder,
        )
        .with_baseline(baseline);

        assert_eq!(watcher.poll().unwrap(), Some(changed));
        assert_eq!(recorder.calls.get(), 1);
        assert_eq!(fs::read_to_string(scratch.join("tls.key")).unwrap(), "tls.key");
        assert!(watcher.baseline() > changed);

        // The rebased baseline absorbs the change.
        assert_eq!(watcher.poll().unwrap(), None);
        assert_eq!(recorder.calls.get(), 1);
    }

    #[test]
    fn test_failed_signal_keeps_baseline() {
        let tmp = tempfile::tempdir().unwrap();
        let source = certificate_volume(tmp.path());
        let recorder = Recorder::new(true);

        let baseline = SystemTime::now() - Duration::from_secs(60);
        touch(&source, baseline + Duration::from_secs(1));
        let mut watcher = CertificateWatcher::new(
            &source,
            tmp.path().join("scratch"),
            &crate::layout::REPLICATION_FILES,
            &recorder,
        )
        .with_baseline(baseline);

        assert!(matches!(watcher.poll(), Err(ReloadError::NoPostmaster)));
        assert_eq!(watcher.baseline(), baseline);
        assert!(watcher.poll().is_err());
        assert_eq!(recorder.calls.get(), 2);
    }

    #[test]
    fn test_missing_certificate_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(false);
        let mut watcher =
            CertificateWatcher::new(tmp.path().join("missing"), tmp.path(), &[], &recorder);

        assert!(matches!(watcher.poll(), Err(ReloadError::Io(_))));
        assert_eq!(recorder.calls.get(), 0);
    }

    #[test]
    fn test_run_stops_when_flag_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(false);
        let mut watcher = CertificateWatcher::new(tmp.path(), tmp.path(), &[], &recorder);

        let running = AtomicBool::new(false);
        watcher.run(Duration::from_secs(5), &running);
        assert_eq!(recorder.calls.get(), 0);
    }

    #[test]
    fn test_postmasters_are_children_of_init() {
        let mut fs = MockFs::new();
        fs.add_process(1, "patroni", 0);
        fs.add_process(40, "postgres", 1);
        fs.add_process(41, "postgres", 40);
        fs.add_process(42, "postgres: checkpointer", 40);

        let signal = PostmasterSignal::new(fs, "/proc");
        let found = signal.postmasters().unwrap();
        assert_eq!(found.iter().map(|s| s.pid).collect::<Vec<_>>(), vec![40]);
    }

    #[test]
    fn test_no_postmaster_is_an_error() {
        let mut fs = MockFs::new();
        fs.add_process(1, "patroni", 0);

        let signal = PostmasterSignal::new(fs, "/proc");
        assert!(matches!(signal.reload(), Err(ReloadError::NoPostmaster)));
    }
}
