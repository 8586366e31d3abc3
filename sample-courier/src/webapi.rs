#![doc = "HTTP client for the analysis service: the reqwest implementation of the core RemoteService contract."]
//
//! # Web API client
//!
//! [`WebApiClient`] speaks the service's `/v1` REST surface. Authenticated
//! calls carry the session token as the `JWTCookie` cookie.
//!
//! Status mapping (shared by every call):
//! - 401 / 403 → [`Error::AuthenticationFailure`]
//! - 404 → [`Error::NotFound`]
//! - any other non-2xx, and transport failures → [`Error::BackendUnavailable`]
//!
//! When an error body is JSON with a `message` field, that message is used in
//! the error text.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::COOKIE;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use sample_courier_core::contract::{FileEntry, Page, RemoteService, ScanOptions, Session, User};
use sample_courier_core::{Error, ObjectKey, Result};

/// Login is the only call with a fixed deadline.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const FILES_PER_PAGE: u32 = 1000;
pub const USERS_PER_PAGE: u32 = 100;

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct ScanConfig<'a> {
    os: &'a str,
    timeout: u32,
}

#[derive(Serialize)]
struct ScanRequest<'a> {
    skip_detonation: bool,
    scan_cfg: ScanConfig<'a>,
}

impl<'a> From<&'a ScanOptions> for ScanRequest<'a> {
    fn from(options: &'a ScanOptions) -> Self {
        ScanRequest {
            skip_detonation: options.skip_detonation,
            scan_cfg: ScanConfig {
                os: &options.os,
                timeout: options.timeout,
            },
        }
    }
}

pub struct WebApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl WebApiClient {
    /// `base_url` is the service root, e.g. `https://api.example.com`.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, None)
    }

    /// Same as [`new`](Self::new) with an overall deadline for every request.
    pub fn with_timeout(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::InvalidInput("web API url is empty".into()));
        }
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(|e| {
            error!(error = %e, "Failed to build HTTP client");
            Error::BackendUnavailable(e.to_string())
        })?;
        info!(base_url = %base_url, "Initialised web API client");
        Ok(WebApiClient { base_url, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
        request.header(COOKIE, format!("JWTCookie={}", session.token()))
    }
}

fn transport(what: &str, e: reqwest::Error) -> Error {
    error!(error = %e, call = what, "Web API request failed");
    Error::BackendUnavailable(format!("{what}: {e}"))
}

/// Pass 2xx responses through; map everything else onto the error taxonomy.
async fn expect_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .map(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(body);
    error!(call = what, status = %status, message = %message, "Web API returned an error");

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::AuthenticationFailure(format!("{what}: {message}"))
        }
        StatusCode::NOT_FOUND => Error::NotFound(format!("{what}: {message}")),
        _ => Error::BackendUnavailable(format!("{what}: {status} {message}")),
    })
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    response.json::<T>().await.map_err(|e| {
        error!(error = %e, call = what, "Malformed web API response");
        Error::BackendUnavailable(format!("{what}: malformed response: {e}"))
    })
}

#[async_trait]
impl RemoteService for WebApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<Session> {
        info!(username, "Logging in");
        let response = self
            .http
            .post(self.url("auth/login/"))
            .timeout(LOGIN_TIMEOUT)
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| transport("login", e))?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, "Login rejected");
            return Err(Error::AuthenticationFailure(format!("login returned {status}: {body}")));
        }
        let LoginResponse { token } = decode(response, "login").await?;
        info!(username, "Login successful");
        Ok(Session::new(token))
    }

    async fn exists(&self, key: &ObjectKey) -> Result<bool> {
        let response = self
            .http
            .get(self.url(&format!("files/{key}")))
            .query(&[("fields", "status")])
            .send()
            .await
            .map_err(|e| transport("exists", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(key = %key, "Sample unknown to the service");
            return Ok(false);
        }
        expect_success(response, "exists").await?;
        Ok(true)
    }

    async fn submit(&self, path: &Path, session: &Session, options: &ScanOptions) -> Result<String> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sample".to_string());
        let scan_cfg = serde_json::to_string(&ScanRequest::from(options).scan_cfg)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let form = Form::new()
            .text("skip_detonation", options.skip_detonation.to_string())
            .text("scan_cfg", scan_cfg)
            .part("file", Part::bytes(data).file_name(file_name.clone()));

        info!(file = %file_name, "Submitting sample");
        let response = self
            .authed(self.http.post(self.url("files/")), session)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport("submit", e))?;
        let response = expect_success(response, "submit").await?;
        response.text().await.map_err(|e| transport("submit", e))
    }

    async fn rescan(&self, key: &ObjectKey, session: &Session, options: &ScanOptions) -> Result<()> {
        info!(key = %key, "Requesting rescan");
        let response = self
            .authed(self.http.post(self.url(&format!("files/{key}/rescan"))), session)
            .json(&ScanRequest::from(options))
            .send()
            .await
            .map_err(|e| transport("rescan", e))?;
        expect_success(response, "rescan").await?;
        Ok(())
    }

    async fn list_files(&self, session: &Session, page: u32) -> Result<Page<FileEntry>> {
        let response = self
            .authed(self.http.get(self.url("files/")), session)
            .query(&[
                ("per_page", FILES_PER_PAGE.to_string()),
                ("page", page.to_string()),
                ("fields", "sha256".to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport("list files", e))?;
        let response = expect_success(response, "list files").await?;
        decode(response, "list files").await
    }

    async fn list_users(&self, session: &Session, page: u32) -> Result<Page<User>> {
        let response = self
            .authed(self.http.get(self.url("users/")), session)
            .query(&[
                ("page", page.to_string()),
                ("per_page", USERS_PER_PAGE.to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport("list users", e))?;
        let response = expect_success(response, "list users").await?;
        decode(response, "list users").await
    }

    async fn download(&self, key: &ObjectKey, session: &Session) -> Result<Bytes> {
        let response = self
            .authed(self.http.get(self.url(&format!("files/{key}/download"))), session)
            .send()
            .await
            .map_err(|e| transport("download", e))?;
        let response = expect_success(response, "download").await?;
        let bytes = response.bytes().await.map_err(|e| transport("download", e))?;
        info!(key = %key, size_bytes = bytes.len(), "Downloaded sample archive");
        Ok(bytes)
    }

    async fn delete(&self, key: &ObjectKey, session: &Session) -> Result<()> {
        let response = self
            .authed(self.http.delete(self.url(&format!("files/{key}"))), session)
            .send()
            .await
            .map_err(|e| transport("delete", e))?;
        expect_success(response, "delete").await?;
        info!(key = %key, "Deleted sample from the service");
        Ok(())
    }
}
