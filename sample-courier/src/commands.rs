//! Per-command handlers: wire config, storage and the web API client into the
//! core workflows and report the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::TryStreamExt;
use tracing::{error, info, warn};

use sample_courier_core::contract::{RemoteService, Session};
use sample_courier_core::dispatch::{
    Action, BatchReport, DispatchConfig, Dispatcher, RESCAN_DELAY, SUBMIT_DELAY,
};
use sample_courier_core::keylist::{difference, read_key_list, write_key_list};
use sample_courier_core::paginate;
use sample_courier_core::storage::{self, Storage};
use sample_courier_core::targets::{local_targets, remote_targets, Target};
use sample_courier_core::workflow::{
    download_behavior_report, storage_keys, DeleteWorkflow, DownloadWorkflow, RescanWorkflow,
    StoreWorkflow, SubmitWorkflow, Via,
};
use sample_courier_core::ObjectKey;

use crate::cli::{Commands, KeyArgs, ListCommand};
use crate::load_config::CliConfig;
use crate::webapi::WebApiClient;

pub const WEB_LISTING_FILE: &str = "db-all-sha256.txt";
pub const STORAGE_LISTING_FILE: &str = "s3-all-sha256.txt";

pub async fn execute(command: Commands, config: &CliConfig) -> Result<()> {
    match command {
        Commands::Scan {
            path,
            force_rescan,
            scan,
            dispatch,
        } => {
            let (remote, session) = login(config).await?;
            let targets = local_targets(&path)?;
            let workflow = SubmitWorkflow::new(remote, session, force_rescan, scan.options());
            run_batch(targets, Arc::new(workflow), dispatch.config(SUBMIT_DELAY)).await
        }
        Commands::Rescan {
            keys,
            scan,
            dispatch,
        } => {
            let targets = remote_targets(resolve_keys(&keys).await?);
            let (remote, session) = login(config).await?;
            let workflow = RescanWorkflow::new(remote, session, scan.options());
            run_batch(targets, Arc::new(workflow), dispatch.config(RESCAN_DELAY)).await
        }
        Commands::Store { path, dispatch } => {
            let targets = local_targets(&path)?;
            let storage = connect_storage(config).await?;
            let workflow =
                StoreWorkflow::snapshot(storage, config.storage.upload_bucket.clone()).await?;
            run_batch(targets, Arc::new(workflow), dispatch.config(Duration::ZERO)).await
        }
        Commands::Download {
            output,
            behavior_report: Some(guid),
            ..
        } => {
            let storage = connect_storage(config).await?;
            let written = download_behavior_report(
                storage.as_ref(),
                &config.storage.artifacts_bucket,
                &guid,
                &output,
            )
            .await?;
            println!("downloaded {} artifacts of {guid} to {}", written.len(), output.display());
            Ok(())
        }
        Commands::Download {
            keys,
            web,
            output,
            behavior_report: None,
            dispatch,
        } => {
            let targets = remote_targets(resolve_keys(&keys).await?);
            let (via, delay) = route(config, web).await?;
            let workflow = DownloadWorkflow::new(via, output);
            run_batch(targets, Arc::new(workflow), dispatch.config(delay)).await
        }
        Commands::Delete {
            keys,
            web,
            dispatch,
        } => {
            let targets = remote_targets(resolve_keys(&keys).await?);
            let (via, delay) = route(config, web).await?;
            run_batch(targets, Arc::new(DeleteWorkflow::new(via)), dispatch.config(delay)).await
        }
        Commands::List {
            target: ListCommand::Files {
                storage,
                output,
                diff,
            },
        } => list_files(config, storage, output, diff).await,
        Commands::List {
            target: ListCommand::Users,
        } => list_users(config).await,
        Commands::Version => Ok(()),
    }
}

async fn login(config: &CliConfig) -> Result<(Arc<dyn RemoteService>, Session)> {
    let credentials = config.credentials.require()?;
    let timeout = credentials.timeout_secs.map(Duration::from_secs);
    let client = WebApiClient::with_timeout(&credentials.url, timeout)?;
    let session = client
        .login(&credentials.username, &credentials.password)
        .await
        .with_context(|| format!("login to {} failed", credentials.url))?;
    let remote: Arc<dyn RemoteService> = Arc::new(client);
    Ok((remote, session))
}

async fn connect_storage(config: &CliConfig) -> Result<Arc<dyn Storage>> {
    storage::connect(config.storage.options.clone())
        .await
        .context("failed to initialise storage backend")
}

/// Download and delete go to storage unless `--web` is given. Web calls are
/// rate limited like rescans.
async fn route(config: &CliConfig, web: bool) -> Result<(Via, Duration)> {
    if web {
        let (remote, session) = login(config).await?;
        return Ok((Via::Remote { remote, session }, RESCAN_DELAY));
    }
    let storage = connect_storage(config).await?;
    let via = Via::Storage {
        storage,
        bucket: config.storage.options.bucket.clone(),
    };
    Ok((via, Duration::ZERO))
}

async fn resolve_keys(keys: &KeyArgs) -> Result<Vec<ObjectKey>> {
    match (&keys.hash, &keys.txt) {
        (Some(hash), _) => Ok(vec![hash.parse::<ObjectKey>().context("invalid --hash")?]),
        (None, Some(path)) => {
            let keys = read_key_list(path).await?;
            if keys.is_empty() {
                bail!("{} contains no hashes", path.display());
            }
            Ok(keys)
        }
        (None, None) => bail!("one of --hash or --txt is required"),
    }
}

async fn run_batch(
    targets: Vec<Target>,
    action: Arc<dyn Action>,
    config: DispatchConfig,
) -> Result<()> {
    if targets.is_empty() {
        info!("Nothing to do");
        println!("no targets");
        return Ok(());
    }
    let report = Dispatcher::new(config)
        .run(targets, action)
        .await
        .map_err(|e| {
            error!(error = %e, "Batch aborted");
            anyhow::Error::new(e)
        })?;
    summarise(&report)
}

/// Print per-target outcomes; fail when any target failed.
fn summarise(report: &BatchReport) -> Result<()> {
    for (_, outcome) in &report.completed {
        println!("{outcome}");
    }
    for failure in &report.failures {
        error!(item = %failure.target, error = %failure.error, "Target failed");
        println!("failed {}: {}", failure.target, failure.error);
    }
    println!(
        "{} succeeded, {} failed",
        report.completed.len(),
        report.failures.len()
    );
    if !report.failures.is_empty() {
        bail!(
            "{} of {} targets failed",
            report.failures.len(),
            report.completed.len() + report.failures.len()
        );
    }
    Ok(())
}

async fn list_files(
    config: &CliConfig,
    from_storage: bool,
    output: Option<PathBuf>,
    diff: Option<PathBuf>,
) -> Result<()> {
    let (keys, default_file) = if from_storage {
        let storage = connect_storage(config).await?;
        let raw = storage_keys(storage.as_ref(), &config.storage.options.bucket).await?;
        let keys: Vec<ObjectKey> = raw.iter().filter_map(|k| k.parse().ok()).collect();
        let dropped = raw.len() - keys.len();
        if dropped > 0 {
            warn!(
                bucket = %config.storage.options.bucket,
                dropped,
                "Skipping bucket keys that are not content hashes"
            );
        }
        (keys, STORAGE_LISTING_FILE)
    } else {
        let (remote, session) = login(config).await?;
        let keys = paginate::collect_keys(remote.as_ref(), &session)
            .await
            .context("listing files from the web service failed")?;
        (keys, WEB_LISTING_FILE)
    };

    let output = output.unwrap_or_else(|| PathBuf::from(default_file));
    let written = write_key_list(&output, &keys).await?;
    println!("wrote {written} hashes to {}", output.display());

    if let Some(other) = diff {
        print_missing(&keys, &other).await?;
    }
    Ok(())
}

async fn print_missing(keys: &[ObjectKey], other: &Path) -> Result<()> {
    let other_keys = read_key_list(other).await?;
    let missing = difference(keys, &other_keys);
    info!(missing = missing.len(), other = %other.display(), "Computed listing difference");
    for key in &missing {
        println!("{key}");
    }
    println!("{} hashes missing from {}", missing.len(), other.display());
    Ok(())
}

async fn list_users(config: &CliConfig) -> Result<()> {
    let (remote, session) = login(config).await?;
    let mut users = paginate::users(remote.as_ref(), &session);
    let mut count = 0usize;
    while let Some(user) = users.try_next().await? {
        println!("{}\t{}", user.username, user.email);
        count += 1;
    }
    println!("{count} users");
    Ok(())
}
