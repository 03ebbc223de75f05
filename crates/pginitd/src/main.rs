//! pginitd - certificate reload sidecar.
//!
//! Watches the mounted certificate volume and makes the running server
//! pick up renewed certificates without a restart.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use pginit_core::certs::{CertificateWatcher, PostmasterSignal};
use pginit_core::fs::RealFs;
use pginit_core::layout;

/// Certificate reload sidecar.
#[derive(Parser)]
#[command(name = "pginitd", about = "Reload PostgreSQL when certificates change", version)]
struct Args {
    /// Mounted certificate volume.
    #[arg(long, default_value = layout::CERT_MOUNT_PATH)]
    certificate_directory: String,

    /// Private copy of the replication certificates.
    #[arg(long, default_value = layout::REPLICATION_TMP)]
    scratch_directory: String,

    /// Poll interval in seconds.
    #[arg(short, long, default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("pginitd={}", level).parse().unwrap())
        .add_directive(format!("pginit_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("pginitd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={}s, certificates={}, scratch={}, proc={}",
        args.interval, args.certificate_directory, args.scratch_directory, args.proc_path
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Also fires on SIGTERM, which is how the kubelet stops the sidecar.
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let signal = PostmasterSignal::new(RealFs::new(), &args.proc_path);
    let mut watcher = CertificateWatcher::new(
        &args.certificate_directory,
        &args.scratch_directory,
        &layout::REPLICATION_FILES,
        signal,
    );

    watcher.run(Duration::from_secs(args.interval), &running);

    info!("Shutting down...");
}
