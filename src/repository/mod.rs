// src/repository/mod.rs

//! Repository management and metadata synchronization
//!
//! This module provides functionality for:
//! - Managing package repositories (stored in the database)
//! - Synchronizing repository metadata over HTTP or from a local directory
//! - Downloading files with retry support
//! - Verifying archive checksums

mod fetcher;

pub use fetcher::{ArchiveFetcher, HttpFetcher, LocalFetcher};

use crate::db;
use crate::db::models::{Repository, RepositoryPackage};
use crate::error::{Error, Result};
use crate::filesystem;
use crate::index::{ConflictDecl, DependencyConstraint, ManifestEntry};
use crate::version::PackageVersion;
use reqwest::blocking::Client;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Metadata file expected at the root of every repository
const METADATA_FILE: &str = "metadata.json";

/// Repository metadata format (simple JSON index)
#[derive(Debug, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub packages: Vec<PackageMetadata>,
}

/// Package metadata in repository index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub checksum: String,
    #[serde(default)]
    pub size: i64,
    pub download_url: String,
    #[serde(default)]
    pub dependencies: Vec<DependencyConstraint>,
    #[serde(default)]
    pub conflicts: Vec<ConflictDecl>,
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
}

/// HTTP client wrapper with retry support
pub struct RepositoryClient {
    client: Client,
    max_retries: u32,
}

impl RepositoryClient {
    /// Create a new repository client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Fetch repository metadata from URL with retry support
    pub fn fetch_metadata(&self, url: &str) -> Result<RepositoryMetadata> {
        let metadata_url = join_url(url, METADATA_FILE);
        info!("Fetching repository metadata from {}", metadata_url);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(&metadata_url).send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            metadata_url
                        )));
                    }

                    let metadata: RepositoryMetadata = response.json().map_err(|e| {
                        Error::DownloadError(format!("Failed to parse metadata JSON: {}", e))
                    })?;

                    info!("Fetched metadata for {} packages", metadata.packages.len());
                    return Ok(metadata);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch metadata after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Metadata fetch attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    /// Download a file to the specified path with retry support
    ///
    /// The body is written to a temporary file next to `dest_path` and
    /// renamed into place once complete.
    pub fn download_file(&self, url: &str, dest_path: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest_path.display());

        let parent = dest_path
            .parent()
            .ok_or_else(|| Error::InitError(format!("no parent directory for {}", dest_path.display())))?;
        fs::create_dir_all(parent)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    let mut temp = NamedTempFile::new_in(parent)?;
                    io::copy(&mut response, temp.as_file_mut()).map_err(|e| {
                        Error::DownloadError(format!("Failed to write downloaded data: {}", e))
                    })?;
                    temp.as_file().sync_all()?;
                    temp.persist(dest_path).map_err(|e| Error::Io(e.error))?;

                    debug!("Downloaded {}", dest_path.display());
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to download after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

/// True for `http://` and `https://` URLs
pub fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Local filesystem path for a `file://` URL or plain path
pub fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

fn join_url(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Resolve a package's download location against its repository URL
///
/// Absolute URLs and absolute paths are kept; anything else is relative to
/// the repository.
pub fn resolve_location(repo_url: &str, download_url: &str) -> String {
    if download_url.contains("://") || download_url.starts_with('/') {
        download_url.to_string()
    } else {
        join_url(repo_url, download_url)
    }
}

/// Read repository metadata from any supported source
pub fn fetch_metadata(url: &str) -> Result<RepositoryMetadata> {
    if is_remote(url) {
        return RepositoryClient::new()?.fetch_metadata(url);
    }

    let path = local_path(url).join(METADATA_FILE);
    debug!("Reading repository metadata from {}", path.display());
    let data = fs::read(&path)
        .map_err(|e| Error::DownloadError(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::DownloadError(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Synchronize repository metadata with the database
///
/// The repository's package rows are replaced in a single SQLite
/// transaction. Entries with an unparseable version are skipped.
pub fn sync_repository(conn: &mut Connection, repo: &mut Repository) -> Result<usize> {
    info!("Synchronizing repository: {}", repo.name);

    let repo_id = repo
        .id
        .ok_or_else(|| Error::NotFound(format!("Repository '{}' has no id", repo.name)))?;
    let metadata = fetch_metadata(&repo.url)?;
    if metadata.name != repo.name {
        debug!(
            "Repository {} publishes metadata named {}",
            repo.name, metadata.name
        );
    }

    let mut rows = Vec::with_capacity(metadata.packages.len());
    for pkg_meta in metadata.packages {
        if let Err(e) = PackageVersion::parse(&pkg_meta.version) {
            warn!("Skipping {} {}: {}", pkg_meta.name, pkg_meta.version, e);
            continue;
        }

        let mut row = RepositoryPackage::new(
            repo_id,
            pkg_meta.name,
            pkg_meta.version,
            pkg_meta.checksum,
            pkg_meta.size,
            resolve_location(&repo.url, &pkg_meta.download_url),
        );
        row.description = pkg_meta.description;
        row.dependencies = serde_json::to_string(&pkg_meta.dependencies)?;
        row.conflicts = serde_json::to_string(&pkg_meta.conflicts)?;
        row.files = serde_json::to_string(&pkg_meta.files)?;
        rows.push(row);
    }

    repo.last_sync = Some(db::models::current_timestamp());
    let count = db::transaction(conn, |tx| {
        RepositoryPackage::delete_by_repository(tx, repo_id)?;
        for row in rows.iter_mut() {
            row.insert(tx)?;
        }
        repo.update(tx)?;
        Ok(rows.len())
    })?;

    info!("Synchronized {} packages from repository {}", count, repo.name);
    Ok(count)
}

/// Outcome of syncing one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced { repository: String, packages: usize },
    UpToDate { repository: String },
    Failed { repository: String, error: String },
}

/// Sync every enabled repository (or only `name`)
///
/// Repositories whose metadata has not expired are skipped unless `force`.
/// A failing repository is reported and the others are still synced.
pub fn sync_repositories(
    conn: &mut Connection,
    name: Option<&str>,
    force: bool,
) -> Result<Vec<SyncOutcome>> {
    let repos = match name {
        Some(name) => vec![
            Repository::find_by_name(conn, name)?
                .ok_or_else(|| Error::NotFound(format!("Repository '{}' not found", name)))?,
        ],
        None => Repository::list_enabled(conn)?,
    };

    let mut outcomes = Vec::with_capacity(repos.len());
    for mut repo in repos {
        if !force && !needs_sync(&repo) {
            debug!("Repository {} is up to date", repo.name);
            outcomes.push(SyncOutcome::UpToDate {
                repository: repo.name,
            });
            continue;
        }

        match sync_repository(conn, &mut repo) {
            Ok(packages) => outcomes.push(SyncOutcome::Synced {
                repository: repo.name,
                packages,
            }),
            Err(e) => {
                warn!("Failed to sync repository {}: {}", repo.name, e);
                outcomes.push(SyncOutcome::Failed {
                    repository: repo.name,
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(outcomes)
}

/// Check if repository metadata needs refresh
pub fn needs_sync(repo: &Repository) -> bool {
    match &repo.last_sync {
        None => true,
        Some(last_sync) => match parse_timestamp(last_sync) {
            Ok(last_sync_time) => {
                let age_seconds = chrono::Utc::now().timestamp().saturating_sub(last_sync_time);
                age_seconds > i64::from(repo.metadata_expire)
            }
            // Unparseable timestamp: force a sync
            Err(_) => true,
        },
    }
}

/// Verify file checksum matches expected value
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    debug!("Verifying checksum for {}", path.display());

    let actual = filesystem::sha256_file(path)?;

    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }

    debug!("Checksum verified: {}", expected);
    Ok(())
}

/// Parse RFC 3339 timestamp to Unix seconds
fn parse_timestamp(timestamp: &str) -> Result<i64> {
    let dt = chrono::DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| Error::ParseError(format!("Invalid timestamp: {}", e)))?;
    Ok(dt.timestamp())
}

/// Add a new repository to the database
pub fn add_repository(
    conn: &Connection,
    name: String,
    url: String,
    enabled: bool,
    priority: i32,
) -> Result<Repository> {
    if Repository::find_by_name(conn, &name)?.is_some() {
        return Err(Error::InvalidRequest(format!(
            "Repository '{}' already exists",
            name
        )));
    }

    let mut repo = Repository::new(name, url);
    repo.enabled = enabled;
    repo.priority = priority;

    repo.insert(conn)?;

    info!("Added repository: {} ({})", repo.name, repo.url);
    Ok(repo)
}

/// Remove a repository and its synced packages from the database
pub fn remove_repository(conn: &Connection, name: &str) -> Result<()> {
    let repo = Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFound(format!("Repository '{}' not found", name)))?;
    let id = repo
        .id
        .ok_or_else(|| Error::NotFound(format!("Repository '{}' has no id", name)))?;

    Repository::delete(conn, id)?;
    info!("Removed repository: {}", name);
    Ok(())
}

/// Enable or disable a repository
pub fn set_repository_enabled(conn: &Connection, name: &str, enabled: bool) -> Result<()> {
    let mut repo = Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFound(format!("Repository '{}' not found", name)))?;

    repo.enabled = enabled;
    repo.update(conn)?;

    info!(
        "Repository '{}' {}",
        name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Search for packages across all repositories by name or description
pub fn search_packages(conn: &Connection, pattern: &str) -> Result<Vec<RepositoryPackage>> {
    RepositoryPackage::search(conn, pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::{NamedTempFile, TempDir};

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn write_metadata(dir: &Path, body: &str) {
        fs::write(dir.join(METADATA_FILE), body).unwrap();
    }

    #[test]
    fn test_add_repository() {
        let (_temp, conn) = create_test_db();

        let repo = add_repository(
            &conn,
            "test-repo".to_string(),
            "https://example.com/repo".to_string(),
            true,
            10,
        )
        .unwrap();

        assert_eq!(repo.name, "test-repo");
        assert_eq!(repo.url, "https://example.com/repo");
        assert!(repo.enabled);
        assert_eq!(repo.priority, 10);
    }

    #[test]
    fn test_add_duplicate_repository() {
        let (_temp, conn) = create_test_db();

        add_repository(&conn, "test-repo".to_string(), "https://example.com/repo".to_string(), true, 10)
            .unwrap();

        let result = add_repository(
            &conn,
            "test-repo".to_string(),
            "https://example.com/other".to_string(),
            true,
            10,
        );

        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_remove_repository() {
        let (_temp, conn) = create_test_db();

        add_repository(&conn, "test-repo".to_string(), "https://example.com/repo".to_string(), true, 10)
            .unwrap();

        remove_repository(&conn, "test-repo").unwrap();

        let found = Repository::find_by_name(&conn, "test-repo").unwrap();
        assert!(found.is_none());
        assert!(matches!(
            remove_repository(&conn, "test-repo"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_enable_disable_repository() {
        let (_temp, conn) = create_test_db();

        add_repository(&conn, "test-repo".to_string(), "https://example.com/repo".to_string(), true, 10)
            .unwrap();

        set_repository_enabled(&conn, "test-repo", false).unwrap();
        let repo = Repository::find_by_name(&conn, "test-repo").unwrap().unwrap();
        assert!(!repo.enabled);

        set_repository_enabled(&conn, "test-repo", true).unwrap();
        let repo = Repository::find_by_name(&conn, "test-repo").unwrap().unwrap();
        assert!(repo.enabled);
    }

    #[test]
    fn test_needs_sync() {
        let repo_never_synced = Repository::new("test".to_string(), "url".to_string());
        assert!(needs_sync(&repo_never_synced));

        let mut repo_recently_synced = Repository::new("test".to_string(), "url".to_string());
        repo_recently_synced.last_sync = Some(db::models::current_timestamp());
        repo_recently_synced.metadata_expire = 3600;
        assert!(!needs_sync(&repo_recently_synced));

        let mut garbage = Repository::new("test".to_string(), "url".to_string());
        garbage.last_sync = Some("yesterday".to_string());
        assert!(needs_sync(&garbage));
    }

    #[test]
    fn test_resolve_location() {
        assert_eq!(
            resolve_location("https://example.com/repo", "a-1.0.tar.gz"),
            "https://example.com/repo/a-1.0.tar.gz"
        );
        assert_eq!(
            resolve_location("https://example.com/repo/", "pool/a.tar.gz"),
            "https://example.com/repo/pool/a.tar.gz"
        );
        assert_eq!(
            resolve_location("file:///srv/repo", "https://mirror/a.tar.gz"),
            "https://mirror/a.tar.gz"
        );
        assert_eq!(resolve_location("/srv/repo", "/abs/a.tar.gz"), "/abs/a.tar.gz");
    }

    #[test]
    fn test_sync_local_repository() {
        let (_temp, mut conn) = create_test_db();
        let dir = TempDir::new().unwrap();
        write_metadata(
            dir.path(),
            r#"{
                "name": "local",
                "packages": [
                    { "name": "a", "version": "1.0", "checksum": "aa", "size": 10,
                      "download_url": "a-1.0.tar.gz",
                      "files": [ { "path": "usr/bin/a", "sha256": "ff", "mode": 493 } ] },
                    { "name": "b", "version": "2.0", "checksum": "bb",
                      "download_url": "b-2.0.tar.gz",
                      "dependencies": [ { "name": "a", "constraint": ">=1.0" } ] },
                    { "name": "broken", "version": "not.a.version", "checksum": "cc",
                      "download_url": "broken.tar.gz" }
                ]
            }"#,
        );

        let url = format!("file://{}", dir.path().display());
        let mut repo = add_repository(&conn, "local".to_string(), url.clone(), true, 0).unwrap();
        assert!(needs_sync(&repo));

        let count = sync_repository(&mut conn, &mut repo).unwrap();
        assert_eq!(count, 2);
        assert!(!needs_sync(&repo));

        let rows = RepositoryPackage::find_by_name(&conn, "a").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].download_url, format!("{}/a-1.0.tar.gz", url));

        // Second sync replaces rows instead of duplicating them
        let outcomes = sync_repositories(&mut conn, None, true).unwrap();
        assert_eq!(
            outcomes,
            vec![SyncOutcome::Synced {
                repository: "local".to_string(),
                packages: 2
            }]
        );
        assert_eq!(RepositoryPackage::find_by_name(&conn, "a").unwrap().len(), 1);

        let outcomes = sync_repositories(&mut conn, None, false).unwrap();
        assert!(matches!(outcomes[0], SyncOutcome::UpToDate { .. }));
    }

    #[test]
    fn test_sync_failure_is_reported_per_repository() {
        let (_temp, mut conn) = create_test_db();
        let dir = TempDir::new().unwrap();
        let url = format!("file://{}", dir.path().join("missing").display());
        add_repository(&conn, "gone".to_string(), url, true, 0).unwrap();

        let outcomes = sync_repositories(&mut conn, None, true).unwrap();
        assert!(matches!(outcomes[0], SyncOutcome::Failed { .. }));
        assert!(matches!(
            sync_repositories(&mut conn, Some("nope"), true),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_verify_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tar.gz");
        fs::write(&path, b"archive").unwrap();

        verify_checksum(&path, &filesystem::sha256_bytes(b"archive")).unwrap();
        assert!(matches!(
            verify_checksum(&path, "00"),
            Err(Error::ChecksumMismatch { .. })
        ));
    }
}
