/// Command-line surface of sample-courier: argument definitions and the async
/// [`run`] entrypoint shared by `main` and the integration tests.
///
/// Everything beyond parsing and wiring lives in `sample-courier-core`; the
/// per-command handlers are in [`crate::commands`].
use crate::commands;
use crate::load_config::load_config;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use sample_courier_core::contract::ScanOptions;
use sample_courier_core::dispatch::{
    default_workers, DispatchConfig, FailurePolicy, PARALLEL_TASK_DELAY,
};
use std::path::PathBuf;
use std::time::Duration;

/// Move samples between disk, object storage and the analysis service.
#[derive(Parser, Debug)]
#[clap(
    name = "sample-courier",
    version,
    about = "Move malware samples between local disk, object storage and the analysis service without duplicate work"
)]
pub struct Cli {
    /// Path to the YAML config file
    #[clap(long, global = true, default_value = "config.yaml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit files for analysis; samples the service already has are skipped
    Scan {
        /// File or directory to submit
        #[clap(long)]
        path: PathBuf,
        /// Rescan samples the service already knows instead of skipping them
        #[clap(long)]
        force_rescan: bool,
        #[clap(flatten)]
        scan: ScanArgs,
        #[clap(flatten)]
        dispatch: DispatchArgs,
    },
    /// Re-run analysis for known samples
    Rescan {
        #[clap(flatten)]
        keys: KeyArgs,
        #[clap(flatten)]
        scan: ScanArgs,
        #[clap(flatten)]
        dispatch: DispatchArgs,
    },
    /// Copy files straight into the storage bucket under their content hash
    Store {
        #[clap(long)]
        path: PathBuf,
        #[clap(flatten)]
        dispatch: DispatchArgs,
    },
    /// Download samples (or a behaviour report) into a directory
    Download {
        #[clap(flatten)]
        keys: KeyArgs,
        /// Fetch the zipped sample from the web service instead of storage
        #[clap(long)]
        web: bool,
        #[clap(long, short, default_value = ".")]
        output: PathBuf,
        /// Download every artifact of this behaviour report id
        #[clap(long, conflicts_with_all = ["hash", "txt", "web"])]
        behavior_report: Option<String>,
        #[clap(flatten)]
        dispatch: DispatchArgs,
    },
    /// Delete samples from storage or from the web service
    Delete {
        #[clap(flatten)]
        keys: KeyArgs,
        #[clap(long)]
        web: bool,
        #[clap(flatten)]
        dispatch: DispatchArgs,
    },
    /// List what the service or the storage bucket holds
    List {
        #[clap(subcommand)]
        target: ListCommand,
    },
    /// Print the version
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ListCommand {
    /// Write every known sample hash to a file, one per line
    Files {
        /// List the samples bucket instead of the web service
        #[clap(long)]
        storage: bool,
        /// Defaults to db-all-sha256.txt (web) or s3-all-sha256.txt (storage)
        #[clap(long, short)]
        output: Option<PathBuf>,
        /// Print hashes from this listing that are missing from FILE
        #[clap(long, value_name = "FILE")]
        diff: Option<PathBuf>,
    },
    /// Print every registered user
    Users,
}

/// Which remote keys a command works on.
#[derive(Args, Debug, Clone, Default)]
pub struct KeyArgs {
    /// A single SHA-256
    #[clap(long, conflicts_with = "txt")]
    pub hash: Option<String>,
    /// A text file with one SHA-256 per line
    #[clap(long)]
    pub txt: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ScanArgs {
    /// Preferred detonation OS
    #[clap(long, default_value = "")]
    pub os: String,
    #[clap(long)]
    pub skip_detonation: bool,
    /// Detonation timeout in seconds (0 = service default)
    #[clap(long, default_value_t = 0)]
    pub timeout: u32,
}

impl ScanArgs {
    pub fn options(&self) -> ScanOptions {
        ScanOptions {
            os: self.os.clone(),
            skip_detonation: self.skip_detonation,
            timeout: self.timeout,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct DispatchArgs {
    /// Process targets concurrently through a bounded worker pool
    #[clap(long)]
    pub parallel: bool,
    /// Worker count for --parallel (default: available CPUs)
    #[clap(long, requires = "parallel")]
    pub workers: Option<usize>,
    /// Delay after each target, in seconds
    #[clap(long)]
    pub delay_secs: Option<u64>,
    /// Attempt every target and report all failures at the end
    #[clap(long)]
    pub keep_going: bool,
}

impl DispatchArgs {
    /// Build the dispatcher settings; `sequential_delay` is the command's
    /// default pause between targets.
    pub fn config(&self, sequential_delay: Duration) -> DispatchConfig {
        let explicit = self.delay_secs.map(Duration::from_secs);
        let config = if self.parallel {
            let default_delay = if sequential_delay.is_zero() {
                Duration::ZERO
            } else {
                PARALLEL_TASK_DELAY
            };
            DispatchConfig::parallel(
                self.workers.unwrap_or_else(default_workers),
                explicit.unwrap_or(default_delay),
            )
        } else {
            DispatchConfig::sequential(explicit.unwrap_or(sequential_delay))
        };
        let policy = if self.keep_going {
            FailurePolicy::Collect
        } else {
            FailurePolicy::FailFast
        };
        config.with_failure_policy(policy)
    }
}

/// Extracted async CLI entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    if let Commands::Version = cli.command {
        println!("sample-courier {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    commands::execute(cli.command, &config).await
}
