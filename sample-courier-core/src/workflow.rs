//! Per-target actions run by the [`Dispatcher`](crate::dispatch::Dispatcher),
//! plus the listing helpers that work on a whole bucket at once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use tracing::{debug, info, warn};

use crate::contract::{RemoteService, ScanOptions, Session};
use crate::dispatch::{Action, ActionKind, BatchJob, Outcome};
use crate::error::{Error, Result};
use crate::identity::{hash, hash_file, ObjectKey};
use crate::storage::{is_placeholder, validate_key, Storage};
use crate::targets::Target;

/// Where download and delete go.
#[derive(Clone)]
pub enum Via {
    Storage {
        storage: Arc<dyn Storage>,
        bucket: String,
    },
    Remote {
        remote: Arc<dyn RemoteService>,
        session: Session,
    },
}

impl Via {
    fn session(&self) -> Option<&Session> {
        match self {
            Via::Storage { .. } => None,
            Via::Remote { session, .. } => Some(session),
        }
    }
}

/// Key of a target: the content hash for files, the key itself otherwise.
async fn key_of(target: &Target) -> Result<ObjectKey> {
    match target {
        Target::Local(path) => hash_file(path).await,
        Target::Remote(key) => Ok(key.clone()),
    }
}

/// Session the dispatcher attached to `job`.
fn job_session(job: &BatchJob) -> Result<&Session> {
    job.session.as_ref().ok_or_else(|| {
        Error::AuthenticationFailure(format!("{} of {} has no session", job.action, job.target))
    })
}

fn remote_key(target: &Target, action: ActionKind) -> Result<&ObjectKey> {
    match target {
        Target::Remote(key) => Ok(key),
        Target::Local(path) => Err(Error::InvalidInput(format!(
            "{action} needs a content key, got path {}",
            path.display()
        ))),
    }
}

/// Upload unknown samples for analysis, rescan known ones only when forced.
pub struct SubmitWorkflow {
    remote: Arc<dyn RemoteService>,
    session: Session,
    force_rescan: bool,
    options: ScanOptions,
}

impl SubmitWorkflow {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        session: Session,
        force_rescan: bool,
        options: ScanOptions,
    ) -> Self {
        SubmitWorkflow {
            remote,
            session,
            force_rescan,
            options,
        }
    }
}

#[async_trait]
impl Action for SubmitWorkflow {
    fn kind(&self) -> ActionKind {
        ActionKind::Upload
    }

    fn session(&self) -> Option<&Session> {
        Some(&self.session)
    }

    async fn execute(&self, job: &BatchJob) -> Result<Outcome> {
        let session = job_session(job)?;
        let key = key_of(&job.target).await?;
        let exists = self.remote.exists(&key).await?;
        debug!(item = %job.target, key = %key, exists, "Checked remote existence");

        match (exists, self.force_rescan) {
            (true, true) => {
                self.remote.rescan(&key, session, &self.options).await?;
                Ok(Outcome::Rescanned(key))
            }
            (true, false) => Ok(Outcome::Skipped(key)),
            (false, _) => match &job.target {
                Target::Local(path) => {
                    let response = self
                        .remote
                        .submit(path, session, &self.options)
                        .await?;
                    debug!(key = %key, response = %response, "Submit accepted");
                    Ok(Outcome::Uploaded(key))
                }
                // Nothing to upload from a bare key.
                Target::Remote(_) => Err(Error::NotFound(format!(
                    "{key} is unknown to the analysis service"
                ))),
            },
        }
    }
}

/// Re-run analysis for every target.
pub struct RescanWorkflow {
    remote: Arc<dyn RemoteService>,
    session: Session,
    options: ScanOptions,
}

impl RescanWorkflow {
    pub fn new(remote: Arc<dyn RemoteService>, session: Session, options: ScanOptions) -> Self {
        RescanWorkflow {
            remote,
            session,
            options,
        }
    }
}

#[async_trait]
impl Action for RescanWorkflow {
    fn kind(&self) -> ActionKind {
        ActionKind::Rescan
    }

    fn session(&self) -> Option<&Session> {
        Some(&self.session)
    }

    async fn execute(&self, job: &BatchJob) -> Result<Outcome> {
        let session = job_session(job)?;
        let key = key_of(&job.target).await?;
        self.remote.rescan(&key, session, &self.options).await?;
        Ok(Outcome::Rescanned(key))
    }
}

/// Copy files into a bucket under their content key, skipping keys the
/// bucket already held when the workflow was created.
pub struct StoreWorkflow {
    storage: Arc<dyn Storage>,
    bucket: String,
    known: HashSet<ObjectKey>,
}

impl StoreWorkflow {
    /// Snapshot the bucket's keys once; the batch checks against this set.
    pub async fn snapshot(storage: Arc<dyn Storage>, bucket: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        let known = known_keys(storage.as_ref(), &bucket).await?;
        info!(bucket = %bucket, known = known.len(), "Snapshotted bucket keys");
        Ok(StoreWorkflow {
            storage,
            bucket,
            known,
        })
    }
}

#[async_trait]
impl Action for StoreWorkflow {
    fn kind(&self) -> ActionKind {
        ActionKind::Upload
    }

    async fn execute(&self, job: &BatchJob) -> Result<Outcome> {
        let path = match &job.target {
            Target::Local(path) => path,
            Target::Remote(key) => {
                return Err(Error::InvalidInput(format!(
                    "cannot store {key} without its file"
                )))
            }
        };
        // One read feeds both the key and the upload, so the stored bytes
        // always match their key.
        let bytes = tokio::fs::read(path).await?;
        let key = hash(&bytes);
        if self.known.contains(&key) {
            return Ok(Outcome::Skipped(key));
        }

        let mut reader: &[u8] = &bytes;
        self.storage
            .upload(&self.bucket, key.as_str(), &mut reader)
            .await?;
        Ok(Outcome::Stored(key))
    }
}

/// Fetch samples into `out_dir`: `<key>` from storage, `<key>.zip` from the
/// analysis service.
pub struct DownloadWorkflow {
    via: Via,
    out_dir: PathBuf,
}

impl DownloadWorkflow {
    pub fn new(via: Via, out_dir: impl Into<PathBuf>) -> Self {
        DownloadWorkflow {
            via,
            out_dir: out_dir.into(),
        }
    }
}

#[async_trait]
impl Action for DownloadWorkflow {
    fn kind(&self) -> ActionKind {
        ActionKind::Download
    }

    fn session(&self) -> Option<&Session> {
        self.via.session()
    }

    async fn execute(&self, job: &BatchJob) -> Result<Outcome> {
        let key = remote_key(&job.target, job.action)?;
        tokio::fs::create_dir_all(&self.out_dir).await?;

        let path = match &self.via {
            Via::Storage { storage, bucket } => {
                let path = self.out_dir.join(key.as_str());
                fetch_object(storage.as_ref(), bucket, key.as_str(), &path).await?;
                path
            }
            Via::Remote { remote, .. } => {
                let archive = remote.download(key, job_session(job)?).await?;
                let path = self.out_dir.join(format!("{key}.zip"));
                tokio::fs::write(&path, &archive).await?;
                path
            }
        };
        Ok(Outcome::Downloaded {
            key: key.clone(),
            path,
        })
    }
}

pub struct DeleteWorkflow {
    via: Via,
}

impl DeleteWorkflow {
    pub fn new(via: Via) -> Self {
        DeleteWorkflow { via }
    }
}

#[async_trait]
impl Action for DeleteWorkflow {
    fn kind(&self) -> ActionKind {
        ActionKind::Delete
    }

    fn session(&self) -> Option<&Session> {
        self.via.session()
    }

    async fn execute(&self, job: &BatchJob) -> Result<Outcome> {
        let key = remote_key(&job.target, job.action)?;
        match &self.via {
            Via::Storage { storage, bucket } => storage.delete(bucket, key.as_str()).await?,
            Via::Remote { remote, .. } => remote.delete(key, job_session(job)?).await?,
        }
        Ok(Outcome::Deleted(key.clone()))
    }
}

/// Write one object to `path`. A partially written file is removed again.
async fn fetch_object(storage: &dyn Storage, bucket: &str, key: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    if let Err(e) = storage.download(bucket, key, &mut file).await {
        drop(file);
        if let Err(cleanup) = tokio::fs::remove_file(path).await {
            warn!(error = %cleanup, path = %path.display(), "Failed to remove partial download");
        }
        return Err(e);
    }
    Ok(())
}

/// Every key in `bucket`, placeholders removed, in backend order.
pub async fn storage_keys(storage: &dyn Storage, bucket: &str) -> Result<Vec<String>> {
    let keys: Vec<String> = storage
        .list(bucket, "")
        .try_filter(|key| futures::future::ready(!is_placeholder(key)))
        .try_collect()
        .await?;
    info!(bucket, count = keys.len(), "Listed storage keys");
    Ok(keys)
}

/// Content keys present in `bucket`. Entries that are not content hashes
/// (artifacts, stray files) are ignored.
pub async fn known_keys(storage: &dyn Storage, bucket: &str) -> Result<HashSet<ObjectKey>> {
    let mut known = HashSet::new();
    for key in storage_keys(storage, bucket).await? {
        match key.parse::<ObjectKey>() {
            Ok(k) => {
                known.insert(k);
            }
            Err(_) => debug!(bucket, key = %key, "Ignoring non-content key"),
        }
    }
    Ok(known)
}

/// Download every artifact stored under `guid` in `bucket` to
/// `out_dir/<object key>`. Returns the written paths.
pub async fn download_behavior_report(
    storage: &dyn Storage,
    bucket: &str,
    guid: &str,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let guid = guid.trim();
    if guid.is_empty() || guid.contains('/') {
        return Err(Error::InvalidInput(format!("invalid behaviour report id {guid:?}")));
    }

    let prefix = format!("{guid}/");
    let keys: Vec<String> = storage
        .list(bucket, &prefix)
        .try_filter(|key| futures::future::ready(!is_placeholder(key)))
        .try_collect()
        .await?;
    if keys.is_empty() {
        return Err(Error::NotFound(format!("no artifacts under {bucket}/{guid}")));
    }

    let mut written = Vec::with_capacity(keys.len());
    for key in keys {
        validate_key(&key)?;
        let path = out_dir.join(&key);
        fetch_object(storage, bucket, &key, &path).await?;
        debug!(key = %key, path = %path.display(), "Saved artifact");
        written.push(path);
    }
    info!(guid, bucket, files = written.len(), "Downloaded behaviour report");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockRemoteService;
    use crate::storage::LocalStorage;
    use tempfile::tempdir;

    async fn local(root: &Path) -> Arc<dyn Storage> {
        Arc::new(LocalStorage::new(root.to_path_buf()).await.unwrap())
    }

    fn job(target: Target, action: ActionKind) -> BatchJob {
        BatchJob {
            target,
            action,
            session: None,
        }
    }

    #[tokio::test]
    async fn store_skips_keys_already_in_the_snapshot() {
        let root = tempdir().unwrap();
        let files = tempdir().unwrap();
        let storage = local(root.path()).await;

        let known = files.path().join("known.bin");
        let fresh = files.path().join("fresh.bin");
        std::fs::write(&known, b"known").unwrap();
        std::fs::write(&fresh, b"fresh").unwrap();
        let mut data: &[u8] = b"known";
        storage
            .upload("samples", hash(b"known").as_str(), &mut data)
            .await
            .unwrap();

        let workflow = StoreWorkflow::snapshot(storage.clone(), "samples").await.unwrap();
        let skipped = workflow
            .execute(&job(Target::Local(known), ActionKind::Upload))
            .await
            .unwrap();
        let stored = workflow
            .execute(&job(Target::Local(fresh), ActionKind::Upload))
            .await
            .unwrap();

        assert_eq!(skipped, Outcome::Skipped(hash(b"known")));
        assert_eq!(stored, Outcome::Stored(hash(b"fresh")));
        let keys = storage_keys(storage.as_ref(), "samples").await.unwrap();
        assert_eq!(keys.len(), 2);

        let mut stored_bytes = Vec::new();
        storage
            .download("samples", hash(b"fresh").as_str(), &mut stored_bytes)
            .await
            .unwrap();
        assert_eq!(hash(&stored_bytes), hash(b"fresh"));
    }

    #[tokio::test]
    async fn storage_download_writes_key_named_file() {
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        let storage = local(root.path()).await;
        let key = hash(b"payload");
        let mut data: &[u8] = b"payload";
        storage.upload("samples", key.as_str(), &mut data).await.unwrap();

        let workflow = DownloadWorkflow::new(
            Via::Storage {
                storage,
                bucket: "samples".into(),
            },
            out.path(),
        );
        let outcome = workflow
            .execute(&job(Target::Remote(key.clone()), ActionKind::Download))
            .await
            .unwrap();

        let expected = out.path().join(key.as_str());
        assert_eq!(
            outcome,
            Outcome::Downloaded {
                key,
                path: expected.clone()
            }
        );
        assert_eq!(std::fs::read(expected).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn failed_download_leaves_no_partial_file() {
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        let key = hash(b"missing");
        let workflow = DownloadWorkflow::new(
            Via::Storage {
                storage: local(root.path()).await,
                bucket: "samples".into(),
            },
            out.path(),
        );
        let err = workflow
            .execute(&job(Target::Remote(key.clone()), ActionKind::Download))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!out.path().join(key.as_str()).exists());
    }

    #[tokio::test]
    async fn behavior_report_skips_placeholders_and_nests_files() {
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        let storage = local(root.path()).await;
        for (key, body) in [
            ("3f2a/api-trace.json", "[]"),
            ("3f2a/screenshots/1.png", "png"),
            ("3f2ab/api-trace.json", "[1]"),
            ("9999/other.json", "{}"),
        ] {
            let mut data = body.as_bytes();
            storage.upload("artifacts", key, &mut data).await.unwrap();
        }

        let written = download_behavior_report(storage.as_ref(), "artifacts", "3f2a", out.path())
            .await
            .unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(
            std::fs::read_to_string(out.path().join("3f2a/screenshots/1.png")).unwrap(),
            "png"
        );
        assert!(!out.path().join("9999").exists());
        assert!(!out.path().join("3f2ab").exists());
    }

    #[tokio::test]
    async fn unknown_behavior_report_is_not_found() {
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        let storage = local(root.path()).await;
        let err = download_behavior_report(storage.as_ref(), "artifacts", "nope", out.path())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn storage_delete_reports_missing_keys() {
        let root = tempdir().unwrap();
        let workflow = DeleteWorkflow::new(Via::Storage {
            storage: local(root.path()).await,
            bucket: "samples".into(),
        });
        let err = workflow
            .execute(&job(Target::Remote(hash(b"gone")), ActionKind::Delete))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn remote_actions_use_the_session_attached_to_the_job() {
        let key = hash(b"sample");
        let mut remote = MockRemoteService::new();
        remote
            .expect_rescan()
            .withf(|_, session, _| session.token() == "job-token")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let workflow = RescanWorkflow::new(
            Arc::new(remote),
            Session::new("workflow-token"),
            ScanOptions::default(),
        );

        let job = BatchJob {
            target: Target::Remote(key.clone()),
            action: ActionKind::Rescan,
            session: Some(Session::new("job-token")),
        };
        assert_eq!(workflow.execute(&job).await.unwrap(), Outcome::Rescanned(key));
    }

    #[tokio::test]
    async fn remote_jobs_without_a_session_fail_before_any_call() {
        let remote: Arc<dyn RemoteService> = Arc::new(MockRemoteService::new());
        let key = hash(b"sample");

        let submit = SubmitWorkflow::new(
            remote.clone(),
            Session::new("t"),
            false,
            ScanOptions::default(),
        );
        let err = submit
            .execute(&job(Target::Remote(key.clone()), ActionKind::Upload))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(_)), "got {err:?}");

        let delete = DeleteWorkflow::new(Via::Remote {
            remote,
            session: Session::new("t"),
        });
        let err = delete
            .execute(&job(Target::Remote(key), ActionKind::Delete))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(_)), "got {err:?}");
    }
}
