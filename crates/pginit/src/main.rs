//! pginit - one-shot preparation of a PostgreSQL instance container.
//!
//! `prepare` runs before the server starts and makes the data volumes
//! usable. `render` writes the generated configuration files for a cluster
//! description.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use pginit_core::cluster::{Cluster, ClusterError};
use pginit_core::config::{HBAs, Parameters};
use pginit_core::patroni;
use pginit_core::startup::{DirectoryPreparer, PostgresBinary, PrepareConfig, Prepared};

/// PostgreSQL instance bootstrap.
#[derive(Parser)]
#[command(name = "pginit", about = "PostgreSQL instance bootstrap", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Prepare data, WAL, tablespace, and log directories before the server starts.
    Prepare(PrepareArgs),
    /// Write pg_hba.conf, server parameters, and the Patroni dynamic configuration.
    Render {
        /// Cluster description (JSON).
        #[arg(long, value_name = "FILE")]
        cluster: PathBuf,

        /// Directory to write the files into.
        #[arg(long, value_name = "DIR", default_value = ".")]
        output_dir: PathBuf,
    },
}

#[derive(clap::Args)]
struct PrepareArgs {
    /// PostgreSQL major version the image and data must have.
    #[arg(long, env = "PGVERSION")]
    expected_version: u32,

    /// Data directory. Defaults to /pgdata/pg<version>.
    #[arg(long, env = "PGDATA")]
    pgdata: Option<PathBuf>,

    /// A dedicated WAL volume is mounted at /pgwal.
    #[arg(long)]
    wal_volume: bool,

    /// WAL directory. Defaults to pg<version>_wal on the WAL or data volume.
    #[arg(long)]
    wal_directory: Option<PathBuf>,

    #[arg(long, default_value = pginit_core::layout::PGBACKREST_LOG_PATH)]
    pgbackrest_log_directory: PathBuf,

    /// Tablespace name; may be repeated.
    #[arg(long = "tablespace", value_name = "NAME")]
    tablespaces: Vec<String>,

    /// Server log directory to create.
    #[arg(long)]
    log_directory: Option<PathBuf>,

    #[arg(long, default_value = pginit_core::layout::CERT_MOUNT_PATH)]
    certificate_directory: PathBuf,

    #[arg(long, default_value = pginit_core::layout::REPLICATION_TMP)]
    scratch_directory: PathBuf,

    /// Data encryption is configured; write the pg_rewind wrapper.
    #[arg(long)]
    tde: bool,

    #[arg(long, default_value = "postgres")]
    postgres_bin: String,
}

impl PrepareArgs {
    fn into_config(self) -> Result<PrepareConfig, ClusterError> {
        let cluster = Cluster {
            postgres_version: self.expected_version,
            wal_volume: self.wal_volume,
            tablespaces: self.tablespaces,
            ..Cluster::default()
        };
        cluster.validate()?;

        let mut config = PrepareConfig::for_cluster(&cluster);
        if let Some(pgdata) = self.pgdata {
            config.pgdata = pgdata;
        }
        if let Some(wal_directory) = self.wal_directory {
            config.wal_directory = wal_directory;
        }
        config.pgbackrest_log_directory = self.pgbackrest_log_directory;
        config.log_directory = self.log_directory;
        config.certificate_directory = self.certificate_directory;
        config.scratch_directory = self.scratch_directory;
        config.encryption_key_command = self.tde;
        config.postgres_bin = self.postgres_bin;
        Ok(config)
    }
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
        .add_directive(format!("pginit={}", level).parse().unwrap())
        .add_directive(format!("pginit_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Command::Prepare(args) => {
            let config = match args.into_config() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            let binary = PostgresBinary::new(config.postgres_bin.clone());
            match DirectoryPreparer::new(config, binary).run() {
                Ok(Prepared::Uninitialized { data_directory }) => {
                    info!("{} is ready for initdb", data_directory.display());
                }
                Ok(Prepared::Initialized {
                    data_directory,
                    wal_directory,
                }) => {
                    info!(
                        "{} is ready, WAL in {}",
                        data_directory.display(),
                        wal_directory.display()
                    );
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Command::Render {
            cluster,
            output_dir,
        } => {
            let cluster = match Cluster::from_file(&cluster) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error reading {}: {}", cluster.display(), e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = render(&cluster, &output_dir) {
                eprintln!("Error writing to {}: {}", output_dir.display(), e);
                std::process::exit(1);
            }
        }
    }
}

/// Writes every generated file for `cluster` into `dir`.
fn render(cluster: &Cluster, dir: &Path) -> io::Result<Vec<PathBuf>> {
    let hbas = HBAs::new();
    let parameters = Parameters::new();
    let instance = patroni::instance_configuration(cluster, &hbas, &parameters);
    let dynamic = patroni::dynamic_configuration(cluster, &hbas, &parameters);

    fs::create_dir_all(dir)?;
    let outputs = [
        ("pg_hba.conf", instance.hbas.to_string()),
        ("postgresql.parameters.conf", instance.parameters.to_string()),
        (
            "patroni-dynamic.json",
            serde_json::to_string_pretty(&dynamic)? + "\n",
        ),
    ];

    let mut written = Vec::new();
    for (name, content) in outputs {
        let path = dir.join(name);
        fs::write(&path, content)?;
        info!("wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}
