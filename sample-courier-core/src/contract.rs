//! # contract: the remote analysis service as seen by the dispatch engine
//!
//! This module defines the [`RemoteService`] trait and the plain data types that
//! cross it. The real HTTP client lives in the CLI crate; tests use the
//! `mockall`-generated `MockRemoteService`, exported behind the
//! `test-export-mocks` feature so dependent crates can mock it too.
//!
//! All authenticated calls take the [`Session`] obtained from a single
//! [`RemoteService::login`] per command invocation. The session is never
//! refreshed; an expired token surfaces as an ordinary failed call.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[allow(unused_imports)]
use mockall::{automock, predicate::*};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::ObjectKey;

/// Opaque authentication token, shared read-only by every job of a run.
#[derive(Clone, PartialEq, Eq)]
pub struct Session(Arc<str>);

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Session(Arc::from(token.into()))
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Session(<redacted>)")
    }
}

/// Scan configuration forwarded with submit and rescan requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Preferred detonation OS (e.g. "win-10"); empty lets the service choose.
    pub os: String,
    pub skip_detonation: bool,
    /// Detonation timeout in seconds; 0 uses the service default.
    pub timeout: u32,
}

/// One page of a remote paginated collection.
///
/// `page_count` and `total_count` are only trusted on the first page fetched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Page<T> {
    pub page: u32,
    pub per_page: u32,
    pub page_count: u32,
    pub total_count: u64,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// Item of the file listing endpoint (requested with `fields=sha256`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileEntry {
    pub sha256: String,
}

/// Item of the user listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "name")]
    pub full_name: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub member_since: i64,
    #[serde(default)]
    pub submissions_count: u64,
}

/// Operations the dispatcher needs from the remote analysis service.
///
/// Implementors map transport and status failures onto [`crate::Error`]:
/// 401/403 become `AuthenticationFailure`, 404 `NotFound`, everything else
/// `BackendUnavailable`.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Exchange credentials for a session token.
    async fn login(&self, username: &str, password: &str) -> Result<Session>;

    /// Whether the service already knows a sample with this key.
    async fn exists(&self, key: &ObjectKey) -> Result<bool>;

    /// Upload a local file; the service schedules analysis on receipt.
    /// Returns the raw response body.
    async fn submit(&self, path: &Path, session: &Session, options: &ScanOptions)
        -> Result<String>;

    /// Re-run analysis for a sample the service already has.
    async fn rescan(&self, key: &ObjectKey, session: &Session, options: &ScanOptions)
        -> Result<()>;

    /// Fetch one page (1-based) of the file collection.
    async fn list_files(&self, session: &Session, page: u32) -> Result<Page<FileEntry>>;

    /// Fetch one page (1-based) of the user collection.
    async fn list_users(&self, session: &Session, page: u32) -> Result<Page<User>>;

    /// Download the sample archive.
    async fn download(&self, key: &ObjectKey, session: &Session) -> Result<Bytes>;

    async fn delete(&self, key: &ObjectKey, session: &Session) -> Result<()>;
}
