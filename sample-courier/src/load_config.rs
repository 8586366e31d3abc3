/// `load_config` module: reads the YAML config file, applies environment
/// overrides for credentials and validates the storage section into the core's
/// tagged [`StorageOptions`].
///
/// # Schema
/// ```yaml
/// credentials:
///   url: https://api.example.com
///   username: analyst
///   password: secret
///   timeout_secs: 60              # optional
/// storage:
///   deployment_kind: minio        # aws | minio | local
///   samples_bucket: samples
///   artifacts_bucket: artifacts   # optional
///   bucket: uploads                # optional, used by `store`
///   minio:
///     endpoint: http://127.0.0.1:9000
///     region: us-east-1
///     access_key: minio
///     secret_key: minio123
/// ```
///
/// Only the block matching `deployment_kind` is read; a missing block is an
/// error. `SAMPLE_COURIER_USERNAME` and `SAMPLE_COURIER_PASSWORD` override the
/// file's credentials.
use anyhow::{anyhow, bail, Context, Result};
use sample_courier_core::storage::{Deployment, DeploymentKind, StorageOptions};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const USERNAME_ENV: &str = "SAMPLE_COURIER_USERNAME";
pub const PASSWORD_ENV: &str = "SAMPLE_COURIER_PASSWORD";

const DEFAULT_ARTIFACTS_BUCKET: &str = "artifacts";

#[derive(Debug)]
pub struct CliConfig {
    pub credentials: Credentials,
    pub storage: StorageConfig,
}

#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Deadline for every web API request; none when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Credentials {
    /// Fails unless url, username and password are all present.
    pub fn require(&self) -> Result<&Self> {
        let missing: Vec<&str> = [
            ("credentials.url", self.url.is_empty()),
            ("credentials.username", self.username.is_empty()),
            ("credentials.password", self.password.is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, empty)| empty.then_some(name))
        .collect();
        if !missing.is_empty() {
            bail!("missing web API credentials: {}", missing.join(", "));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Backend options; `options.bucket` is the samples bucket.
    pub options: StorageOptions,
    pub artifacts_bucket: String,
    /// Target of `store`; falls back to the samples bucket.
    pub upload_bucket: String,
}

impl CliConfig {
    /// Log what was loaded, without secrets.
    pub fn trace_loaded(&self) {
        info!(
            url = %self.credentials.url,
            username_set = !self.credentials.username.is_empty(),
            password_set = !self.credentials.password.is_empty(),
            deployment_kind = %self.storage.options.kind(),
            samples_bucket = %self.storage.options.bucket,
            artifacts_bucket = %self.storage.artifacts_bucket,
            upload_bucket = %self.storage.upload_bucket,
            "trace_loaded"
        );
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    credentials: Credentials,
    storage: RawStorage,
}

#[derive(Debug, Deserialize)]
struct RawStorage {
    deployment_kind: String,
    samples_bucket: String,
    #[serde(default)]
    artifacts_bucket: Option<String>,
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    s3: Option<RawS3>,
    #[serde(default)]
    minio: Option<RawMinio>,
    #[serde(default)]
    local: Option<RawLocal>,
}

#[derive(Debug, Deserialize)]
struct RawS3 {
    region: String,
    access_key: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct RawMinio {
    endpoint: String,
    #[serde(default = "default_region")]
    region: String,
    access_key: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct RawLocal {
    root_dir: PathBuf,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn deployment(raw: &mut RawStorage) -> Result<Deployment> {
    let kind: DeploymentKind = raw.deployment_kind.parse()?;
    let missing = |block: &str| anyhow!("deployment_kind is {kind} but storage.{block} is missing");
    let deployment = match kind {
        DeploymentKind::Aws => {
            let s3 = raw.s3.take().ok_or_else(|| missing("s3"))?;
            Deployment::Aws {
                region: s3.region,
                access_key: s3.access_key,
                secret_key: s3.secret_key,
            }
        }
        DeploymentKind::Minio => {
            let minio = raw.minio.take().ok_or_else(|| missing("minio"))?;
            Deployment::Minio {
                endpoint: minio.endpoint,
                region: minio.region,
                access_key: minio.access_key,
                secret_key: minio.secret_key,
            }
        }
        DeploymentKind::Local => {
            let local = raw.local.take().ok_or_else(|| missing("local"))?;
            Deployment::Local {
                root_dir: local.root_dir,
            }
        }
    };
    Ok(deployment)
}

fn env_override(name: &str, target: &mut String) {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => {
            info!(env = name, "Credential overridden from environment");
            *target = value;
        }
        Ok(_) => {}
        Err(std::env::VarError::NotPresent) => {}
        Err(e) => warn!(env = name, error = %e, "Ignoring unreadable environment variable"),
    }
}

/// Loads the YAML config at `path` and applies environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let mut raw: RawConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    let deployment = deployment(&mut raw.storage)
        .with_context(|| format!("invalid storage section in {}", path_ref.display()))?;

    let mut credentials = raw.credentials;
    env_override(USERNAME_ENV, &mut credentials.username);
    env_override(PASSWORD_ENV, &mut credentials.password);

    let samples_bucket = raw.storage.samples_bucket;
    if samples_bucket.trim().is_empty() {
        bail!("storage.samples_bucket must not be empty");
    }
    let config = CliConfig {
        credentials,
        storage: StorageConfig {
            upload_bucket: raw
                .storage
                .bucket
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| samples_bucket.clone()),
            artifacts_bucket: raw
                .storage
                .artifacts_bucket
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| DEFAULT_ARTIFACTS_BUCKET.to_string()),
            options: StorageOptions {
                bucket: samples_bucket,
                deployment,
            },
        },
    };
    config.trace_loaded();
    Ok(config)
}
