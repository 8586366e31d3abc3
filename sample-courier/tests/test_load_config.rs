use sample_courier::load_config::{load_config, PASSWORD_ENV, USERNAME_ENV};
use sample_courier_core::storage::{Deployment, DeploymentKind};
use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn config_file(yaml: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), yaml).expect("write config");
    file
}

fn clear_credential_env() {
    env::remove_var(USERNAME_ENV);
    env::remove_var(PASSWORD_ENV);
}

#[test]
#[serial]
fn loads_a_minio_deployment() {
    clear_credential_env();
    let file = config_file(
        r#"
credentials:
  url: https://api.example.com
  username: analyst
  password: from-file
storage:
  deployment_kind: minio
  samples_bucket: samples
  artifacts_bucket: artifacts
  minio:
    endpoint: http://127.0.0.1:9000
    region: us-east-1
    access_key: minio
    secret_key: minio123
"#,
    );

    let config = load_config(file.path()).expect("Config should load");
    assert_eq!(config.credentials.url, "https://api.example.com");
    assert_eq!(config.credentials.password, "from-file");
    assert_eq!(config.storage.options.kind(), DeploymentKind::Minio);
    assert_eq!(config.storage.options.bucket, "samples");
    assert_eq!(config.storage.artifacts_bucket, "artifacts");
    assert_eq!(config.storage.upload_bucket, "samples", "store falls back to the samples bucket");
    match &config.storage.options.deployment {
        Deployment::Minio { endpoint, .. } => assert_eq!(endpoint, "http://127.0.0.1:9000"),
        other => panic!("unexpected deployment {other:?}"),
    }
}

#[test]
#[serial]
fn environment_overrides_file_credentials() {
    clear_credential_env();
    let file = config_file(
        r#"
credentials:
  url: https://api.example.com
  username: file-user
  password: file-pass
storage:
  deployment_kind: local
  samples_bucket: samples
  local:
    root_dir: /tmp/courier
"#,
    );
    env::set_var(USERNAME_ENV, "env-user");
    env::set_var(PASSWORD_ENV, "env-pass");

    let config = load_config(file.path()).expect("Config should load");
    clear_credential_env();

    assert_eq!(config.credentials.username, "env-user");
    assert_eq!(config.credentials.password, "env-pass");
    assert_eq!(
        config.storage.options.deployment,
        Deployment::Local {
            root_dir: PathBuf::from("/tmp/courier")
        }
    );
    assert_eq!(config.storage.artifacts_bucket, "artifacts");
}

#[test]
#[serial]
fn missing_credential_block_for_the_kind_is_an_error() {
    clear_credential_env();
    let file = config_file(
        r#"
storage:
  deployment_kind: aws
  samples_bucket: samples
  minio:
    endpoint: http://127.0.0.1:9000
    access_key: a
    secret_key: b
"#,
    );
    let err = load_config(file.path()).expect_err("aws without s3 block");
    assert!(format!("{err:#}").contains("storage.s3 is missing"), "got: {err:#}");
}

#[test]
#[serial]
fn unknown_deployment_kind_is_rejected() {
    clear_credential_env();
    let file = config_file(
        r#"
storage:
  deployment_kind: azure
  samples_bucket: samples
"#,
    );
    let err = load_config(file.path()).expect_err("azure is unsupported");
    assert!(format!("{err:#}").contains("unsupported deployment kind"), "got: {err:#}");
}

#[test]
#[serial]
fn credentials_are_optional_until_required() {
    clear_credential_env();
    let file = config_file(
        r#"
storage:
  deployment_kind: local
  samples_bucket: samples
  bucket: uploads
  local:
    root_dir: ./store
"#,
    );
    let config = load_config(file.path()).expect("storage-only config loads");
    assert_eq!(config.storage.upload_bucket, "uploads");
    let err = config.credentials.require().expect_err("no credentials");
    assert!(err.to_string().contains("credentials.url"), "got: {err}");
    assert!(format!("{:?}", config.credentials).contains("<redacted>"));
}

#[test]
fn missing_file_is_reported() {
    let err = load_config("/definitely/not/config.yaml").expect_err("missing file");
    assert!(err.to_string().contains("Failed to read config file"));
}
