// src/db/models.rs

//! Data models for pkgmgr database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.
//! Domain conversions (`InstalledRecord`, `Package`) live in `state` and
//! `index`; the types here are plain rows.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// Map a textual enum column into a rusqlite conversion error
fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Current RFC 3339 timestamp
pub fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// An installed package row
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub id: Option<i64>,
    pub name: String,
    pub version: String,
    pub repository: Option<String>,
    pub explicit: bool,
    /// JSON array of conflict declarations
    pub conflicts: String,
    pub installed_at: String,
    pub installed_by_journal_id: Option<i64>,
}

impl InstalledPackage {
    /// Create a new InstalledPackage stamped with the current time
    pub fn new(name: String, version: String, explicit: bool) -> Self {
        Self {
            id: None,
            name,
            version,
            repository: None,
            explicit,
            conflicts: "[]".to_string(),
            installed_at: current_timestamp(),
            installed_by_journal_id: None,
        }
    }

    /// Insert this package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO packages (name, version, repository, explicit, conflicts, installed_at, installed_by_journal_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &self.name,
                &self.version,
                &self.repository,
                self.explicit as i32,
                &self.conflicts,
                &self.installed_at,
                &self.installed_by_journal_id,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find an installed package by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, repository, explicit, conflicts, installed_at, installed_by_journal_id
             FROM packages WHERE name = ?1",
        )?;

        let package = stmt.query_row([name], Self::from_row).optional()?;

        Ok(package)
    }

    /// Find installed packages whose name contains `pattern`
    pub fn search(conn: &Connection, pattern: &str) -> Result<Vec<Self>> {
        let search_pattern = format!("%{}%", pattern);
        let mut stmt = conn.prepare(
            "SELECT id, name, version, repository, explicit, conflicts, installed_at, installed_by_journal_id
             FROM packages WHERE name LIKE ?1 ORDER BY name",
        )?;

        let packages = stmt
            .query_map([&search_pattern], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// List all installed packages
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, repository, explicit, conflicts, installed_at, installed_by_journal_id
             FROM packages ORDER BY name",
        )?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Delete a package by name (files and dependencies cascade)
    pub fn delete_by_name(conn: &Connection, name: &str) -> Result<()> {
        conn.execute("DELETE FROM packages WHERE name = ?1", [name])?;
        Ok(())
    }

    /// Convert a database row to an InstalledPackage
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            version: row.get(2)?,
            repository: row.get(3)?,
            explicit: row.get::<_, i32>(4)? != 0,
            conflicts: row.get(5)?,
            installed_at: row.get(6)?,
            installed_by_journal_id: row.get(7)?,
        })
    }
}

/// A File represents a tracked file in the filesystem
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub id: Option<i64>,
    /// Path relative to the install root
    pub path: String,
    pub sha256_hash: String,
    pub mode: u32,
    pub package_id: i64,
}

impl FileEntry {
    /// Create a new FileEntry
    pub fn new(path: String, sha256_hash: String, mode: u32, package_id: i64) -> Self {
        Self {
            id: None,
            path,
            sha256_hash,
            mode,
            package_id,
        }
    }

    /// Insert this file into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO files (path, sha256_hash, mode, package_id) VALUES (?1, ?2, ?3, ?4)",
            params![&self.path, &self.sha256_hash, &self.mode, &self.package_id],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a file by path
    pub fn find_by_path(conn: &Connection, path: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, path, sha256_hash, mode, package_id FROM files WHERE path = ?1",
        )?;

        let file = stmt.query_row([path], Self::from_row).optional()?;

        Ok(file)
    }

    /// Find all files belonging to a package
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, path, sha256_hash, mode, package_id FROM files WHERE package_id = ?1 ORDER BY path",
        )?;

        let files = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(files)
    }

    /// Convert a database row to a FileEntry
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            path: row.get(1)?,
            sha256_hash: row.get(2)?,
            mode: row.get(3)?,
            package_id: row.get(4)?,
        })
    }
}

/// Dependency entry linking an installed package to its dependencies
#[derive(Debug, Clone)]
pub struct DependencyEntry {
    pub id: Option<i64>,
    pub package_id: i64,
    pub depends_on_name: String,
    pub version_constraint: String,
    pub optional: bool,
}

impl DependencyEntry {
    /// Create a new DependencyEntry
    pub fn new(
        package_id: i64,
        depends_on_name: String,
        version_constraint: String,
        optional: bool,
    ) -> Self {
        Self {
            id: None,
            package_id,
            depends_on_name,
            version_constraint,
            optional,
        }
    }

    /// Insert this dependency into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO dependencies (package_id, depends_on_name, version_constraint, optional)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.package_id,
                &self.depends_on_name,
                &self.version_constraint,
                self.optional as i32,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find all dependencies for a package, in declaration order
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, depends_on_name, version_constraint, optional
             FROM dependencies WHERE package_id = ?1 ORDER BY id",
        )?;

        let deps = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(deps)
    }

    /// Find all entries that depend on a given package name (reverse dependencies)
    pub fn find_dependents(conn: &Connection, package_name: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, depends_on_name, version_constraint, optional
             FROM dependencies WHERE depends_on_name = ?1 ORDER BY id",
        )?;

        let deps = stmt
            .query_map([package_name], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(deps)
    }

    /// Convert a database row to a DependencyEntry
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            depends_on_name: row.get(2)?,
            version_constraint: row.get(3)?,
            optional: row.get::<_, i32>(4)? != 0,
        })
    }
}

/// Read the installed-state generation counter
pub fn state_generation(conn: &Connection) -> Result<i64> {
    let generation = conn.query_row(
        "SELECT value FROM state_meta WHERE key = 'generation'",
        [],
        |row| row.get(0),
    )?;
    Ok(generation)
}

/// Bump the generation counter; called inside every record mutation
pub fn bump_state_generation(conn: &Connection) -> Result<i64> {
    conn.execute(
        "UPDATE state_meta SET value = value + 1 WHERE key = 'generation'",
        [],
    )?;
    state_generation(conn)
}

/// Journal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalStatus {
    Active,
    Committed,
    RolledBack,
    RollbackFailed,
    /// A failed rollback acknowledged by an operator
    Cleared,
}

impl JournalStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JournalStatus::Active => "active",
            JournalStatus::Committed => "committed",
            JournalStatus::RolledBack => "rolled_back",
            JournalStatus::RollbackFailed => "rollback_failed",
            JournalStatus::Cleared => "cleared",
        }
    }

    /// True once the journal needs no further processing
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JournalStatus::Committed | JournalStatus::RolledBack | JournalStatus::Cleared
        )
    }
}

impl FromStr for JournalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(JournalStatus::Active),
            "committed" => Ok(JournalStatus::Committed),
            "rolled_back" => Ok(JournalStatus::RolledBack),
            "rollback_failed" => Ok(JournalStatus::RollbackFailed),
            "cleared" => Ok(JournalStatus::Cleared),
            _ => Err(format!("Invalid journal status: {}", s)),
        }
    }
}

/// A Journal is the durable record of one transaction
#[derive(Debug, Clone)]
pub struct Journal {
    pub id: Option<i64>,
    pub description: String,
    pub status: JournalStatus,
    pub state_generation: i64,
    pub created_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

impl Journal {
    /// Create a new active Journal
    pub fn new(description: String, state_generation: i64) -> Self {
        Self {
            id: None,
            description,
            status: JournalStatus::Active,
            state_generation,
            created_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Insert this journal into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO journals (description, status, state_generation) VALUES (?1, ?2, ?3)",
            params![&self.description, self.status.as_str(), &self.state_generation],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a journal by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, status, state_generation, created_at, finished_at, error
             FROM journals WHERE id = ?1",
        )?;

        let journal = stmt.query_row([id], Self::from_row).optional()?;

        Ok(journal)
    }

    /// Journals in a given status, oldest first
    pub fn find_by_status(conn: &Connection, status: JournalStatus) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, status, state_generation, created_at, finished_at, error
             FROM journals WHERE status = ?1 ORDER BY id",
        )?;

        let journals = stmt
            .query_map([status.as_str()], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(journals)
    }

    /// List all journals, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, status, state_generation, created_at, finished_at, error
             FROM journals ORDER BY id DESC",
        )?;

        let journals = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(journals)
    }

    /// Update journal status; terminal statuses stamp `finished_at`
    pub fn update_status(
        &mut self,
        conn: &Connection,
        new_status: JournalStatus,
        error: Option<String>,
    ) -> Result<()> {
        let id = self.id.ok_or_else(|| {
            Error::InitError("Cannot update journal without ID".to_string())
        })?;

        if new_status == JournalStatus::Active {
            conn.execute(
                "UPDATE journals SET status = ?1, error = ?2 WHERE id = ?3",
                params![new_status.as_str(), &error, id],
            )?;
        } else {
            conn.execute(
                "UPDATE journals SET status = ?1, error = ?2, finished_at = CURRENT_TIMESTAMP WHERE id = ?3",
                params![new_status.as_str(), &error, id],
            )?;
        }

        self.status = new_status;
        self.error = error;
        Ok(())
    }

    /// Convert a database row to a Journal
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(2)?;
        let status = status_str
            .parse::<JournalStatus>()
            .map_err(|e| conversion_error(2, e))?;

        Ok(Self {
            id: Some(row.get(0)?),
            description: row.get(1)?,
            status,
            state_generation: row.get(3)?,
            created_at: row.get(4)?,
            finished_at: row.get(5)?,
            error: row.get(6)?,
        })
    }
}

/// Per-step journal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    InProgress,
    Committed,
    Failed,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    pub fn as_str(&self) -> &str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Committed => "committed",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
            StepStatus::CompensationFailed => "compensation_failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "in_progress" => Ok(StepStatus::InProgress),
            "committed" => Ok(StepStatus::Committed),
            "failed" => Ok(StepStatus::Failed),
            "compensated" => Ok(StepStatus::Compensated),
            "compensation_failed" => Ok(StepStatus::CompensationFailed),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// One step of a journal; `payload` is the serialized step
#[derive(Debug, Clone)]
pub struct JournalStep {
    pub id: Option<i64>,
    pub journal_id: i64,
    pub seq: i64,
    pub kind: String,
    pub package_name: String,
    pub package_version: String,
    pub payload: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub updated_at: Option<String>,
}

impl JournalStep {
    /// Create a new pending JournalStep
    pub fn new(
        journal_id: i64,
        seq: i64,
        kind: String,
        package_name: String,
        package_version: String,
        payload: String,
    ) -> Self {
        Self {
            id: None,
            journal_id,
            seq,
            kind,
            package_name,
            package_version,
            payload,
            status: StepStatus::Pending,
            error: None,
            updated_at: None,
        }
    }

    /// Insert this step into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO journal_steps (journal_id, seq, kind, package_name, package_version, payload, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CURRENT_TIMESTAMP)",
            params![
                &self.journal_id,
                &self.seq,
                &self.kind,
                &self.package_name,
                &self.package_version,
                &self.payload,
                self.status.as_str(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// All steps of a journal in plan order
    pub fn find_by_journal(conn: &Connection, journal_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, journal_id, seq, kind, package_name, package_version, payload, status, error, updated_at
             FROM journal_steps WHERE journal_id = ?1 ORDER BY seq",
        )?;

        let steps = stmt
            .query_map([journal_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(steps)
    }

    /// Persist a status change for this step
    pub fn update_status(
        &mut self,
        conn: &Connection,
        new_status: StepStatus,
        error: Option<String>,
    ) -> Result<()> {
        let id = self.id.ok_or_else(|| {
            Error::InitError("Cannot update journal step without ID".to_string())
        })?;

        conn.execute(
            "UPDATE journal_steps SET status = ?1, error = ?2, updated_at = CURRENT_TIMESTAMP WHERE id = ?3",
            params![new_status.as_str(), &error, id],
        )?;

        self.status = new_status;
        self.error = error;
        Ok(())
    }

    /// Convert a database row to a JournalStep
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(7)?;
        let status = status_str
            .parse::<StepStatus>()
            .map_err(|e| conversion_error(7, e))?;

        Ok(Self {
            id: Some(row.get(0)?),
            journal_id: row.get(1)?,
            seq: row.get(2)?,
            kind: row.get(3)?,
            package_name: row.get(4)?,
            package_version: row.get(5)?,
            payload: row.get(6)?,
            status,
            error: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

/// Repository represents a remote package source
#[derive(Debug, Clone)]
pub struct Repository {
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub priority: i32,
    pub metadata_expire: i32,
    pub last_sync: Option<String>,
    pub created_at: Option<String>,
}

impl Repository {
    /// Create a new Repository
    pub fn new(name: String, url: String) -> Self {
        Self {
            id: None,
            name,
            url,
            enabled: true,
            priority: 0,
            metadata_expire: 3600, // Default: 1 hour
            last_sync: None,
            created_at: None,
        }
    }

    /// Insert this repository into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO repositories (name, url, enabled, priority, metadata_expire)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &self.name,
                &self.url,
                self.enabled as i32,
                &self.priority,
                &self.metadata_expire,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a repository by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, metadata_expire, last_sync, created_at
             FROM repositories WHERE name = ?1",
        )?;

        let repo = stmt.query_row([name], Self::from_row).optional()?;

        Ok(repo)
    }

    /// List all repositories in declaration order
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, metadata_expire, last_sync, created_at
             FROM repositories ORDER BY id",
        )?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// List enabled repositories in declaration order
    pub fn list_enabled(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, metadata_expire, last_sync, created_at
             FROM repositories WHERE enabled = 1 ORDER BY id",
        )?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// Update repository metadata
    pub fn update(&self, conn: &Connection) -> Result<()> {
        let id = self.id.ok_or_else(|| {
            Error::InitError("Cannot update repository without ID".to_string())
        })?;

        conn.execute(
            "UPDATE repositories SET name = ?1, url = ?2, enabled = ?3, priority = ?4,
             metadata_expire = ?5, last_sync = ?6 WHERE id = ?7",
            params![
                &self.name,
                &self.url,
                self.enabled as i32,
                &self.priority,
                &self.metadata_expire,
                &self.last_sync,
                id,
            ],
        )?;

        Ok(())
    }

    /// Delete a repository by ID
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM repositories WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to a Repository
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            url: row.get(2)?,
            enabled: row.get::<_, i32>(3)? != 0,
            priority: row.get(4)?,
            metadata_expire: row.get(5)?,
            last_sync: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

/// RepositoryPackage represents a package available from a repository
///
/// `dependencies`, `conflicts` and `files` hold JSON arrays.
#[derive(Debug, Clone)]
pub struct RepositoryPackage {
    pub id: Option<i64>,
    pub repository_id: i64,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub checksum: String,
    pub size: i64,
    pub download_url: String,
    pub dependencies: String,
    pub conflicts: String,
    pub files: String,
    pub synced_at: Option<String>,
}

impl RepositoryPackage {
    /// Create a new RepositoryPackage
    pub fn new(
        repository_id: i64,
        name: String,
        version: String,
        checksum: String,
        size: i64,
        download_url: String,
    ) -> Self {
        Self {
            id: None,
            repository_id,
            name,
            version,
            description: None,
            checksum,
            size,
            download_url,
            dependencies: "[]".to_string(),
            conflicts: "[]".to_string(),
            files: "[]".to_string(),
            synced_at: None,
        }
    }

    /// Insert this repository package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO repository_packages
             (repository_id, name, version, description, checksum, size, download_url, dependencies, conflicts, files)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &self.repository_id,
                &self.name,
                &self.version,
                &self.description,
                &self.checksum,
                &self.size,
                &self.download_url,
                &self.dependencies,
                &self.conflicts,
                &self.files,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find repository packages by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, repository_id, name, version, description, checksum, size,
                    download_url, dependencies, conflicts, files, synced_at
             FROM repository_packages WHERE name = ?1 ORDER BY repository_id, id",
        )?;

        let packages = stmt
            .query_map([name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Find repository packages by repository ID
    pub fn find_by_repository(conn: &Connection, repository_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, repository_id, name, version, description, checksum, size,
                    download_url, dependencies, conflicts, files, synced_at
             FROM repository_packages WHERE repository_id = ?1 ORDER BY id",
        )?;

        let packages = stmt
            .query_map([repository_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Search repository packages by pattern (name or description)
    pub fn search(conn: &Connection, pattern: &str) -> Result<Vec<Self>> {
        let search_pattern = format!("%{}%", pattern);
        let mut stmt = conn.prepare(
            "SELECT id, repository_id, name, version, description, checksum, size,
                    download_url, dependencies, conflicts, files, synced_at
             FROM repository_packages
             WHERE name LIKE ?1 OR description LIKE ?1
             ORDER BY name, version",
        )?;

        let packages = stmt
            .query_map([&search_pattern], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Delete all packages for a repository (used when syncing)
    pub fn delete_by_repository(conn: &Connection, repository_id: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM repository_packages WHERE repository_id = ?1",
            [repository_id],
        )?;
        Ok(())
    }

    /// Convert a database row to a RepositoryPackage
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            repository_id: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            description: row.get(4)?,
            checksum: row.get(5)?,
            size: row.get(6)?,
            download_url: row.get(7)?,
            dependencies: row.get(8)?,
            conflicts: row.get(9)?,
            files: row.get(10)?,
            synced_at: row.get(11)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_installed_package_crud() {
        let (_temp, conn) = create_test_db();

        let mut package = InstalledPackage::new("nginx".to_string(), "1.21.0".to_string(), true);
        package.repository = Some("core".to_string());
        let id = package.insert(&conn).unwrap();
        assert!(id > 0);
        assert_eq!(package.id, Some(id));

        let found = InstalledPackage::find_by_name(&conn, "nginx").unwrap().unwrap();
        assert_eq!(found.version, "1.21.0");
        assert!(found.explicit);
        assert_eq!(found.repository.as_deref(), Some("core"));

        assert_eq!(InstalledPackage::search(&conn, "gin").unwrap().len(), 1);
        assert_eq!(InstalledPackage::list_all(&conn).unwrap().len(), 1);

        InstalledPackage::delete_by_name(&conn, "nginx").unwrap();
        assert!(InstalledPackage::find_by_name(&conn, "nginx").unwrap().is_none());
    }

    #[test]
    fn test_files_and_dependencies_cascade() {
        let (_temp, conn) = create_test_db();

        let mut package = InstalledPackage::new("b".to_string(), "2.0".to_string(), false);
        let package_id = package.insert(&conn).unwrap();

        let mut file = FileEntry::new("usr/bin/b".to_string(), "abc".to_string(), 0o755, package_id);
        file.insert(&conn).unwrap();
        let mut dep = DependencyEntry::new(package_id, "a".to_string(), ">=1.0".to_string(), false);
        dep.insert(&conn).unwrap();

        assert_eq!(FileEntry::find_by_package(&conn, package_id).unwrap().len(), 1);
        assert_eq!(DependencyEntry::find_dependents(&conn, "a").unwrap().len(), 1);

        InstalledPackage::delete_by_name(&conn, "b").unwrap();

        assert!(FileEntry::find_by_path(&conn, "usr/bin/b").unwrap().is_none());
        assert!(DependencyEntry::find_by_package(&conn, package_id).unwrap().is_empty());
    }

    #[test]
    fn test_state_generation_bumps() {
        let (_temp, conn) = create_test_db();
        assert_eq!(state_generation(&conn).unwrap(), 0);
        assert_eq!(bump_state_generation(&conn).unwrap(), 1);
        assert_eq!(bump_state_generation(&conn).unwrap(), 2);
    }

    #[test]
    fn test_journal_lifecycle() {
        let (_temp, conn) = create_test_db();

        let mut journal = Journal::new("Install b".to_string(), 0);
        let journal_id = journal.insert(&conn).unwrap();
        assert_eq!(journal.status, JournalStatus::Active);

        let mut step = JournalStep::new(
            journal_id,
            0,
            "fetch".to_string(),
            "b".to_string(),
            "2.0".to_string(),
            "{}".to_string(),
        );
        step.insert(&conn).unwrap();
        step.update_status(&conn, StepStatus::InProgress, None).unwrap();
        step.update_status(&conn, StepStatus::Committed, None).unwrap();

        let steps = JournalStep::find_by_journal(&conn, journal_id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Committed);

        assert_eq!(Journal::find_by_status(&conn, JournalStatus::Active).unwrap().len(), 1);

        journal
            .update_status(&conn, JournalStatus::Committed, None)
            .unwrap();
        let reloaded = Journal::find_by_id(&conn, journal_id).unwrap().unwrap();
        assert_eq!(reloaded.status, JournalStatus::Committed);
        assert!(reloaded.finished_at.is_some());
        assert!(reloaded.status.is_terminal());
    }

    #[test]
    fn test_repository_crud() {
        let (_temp, conn) = create_test_db();

        let mut repo = Repository::new("core".to_string(), "https://example.com/core".to_string());
        repo.priority = 5;
        let repo_id = repo.insert(&conn).unwrap();

        let mut pkg = RepositoryPackage::new(
            repo_id,
            "a".to_string(),
            "1.0".to_string(),
            "deadbeef".to_string(),
            10,
            "a-1.0.tar.gz".to_string(),
        );
        pkg.description = Some("the letter a".to_string());
        pkg.insert(&conn).unwrap();

        assert_eq!(RepositoryPackage::find_by_name(&conn, "a").unwrap().len(), 1);
        assert_eq!(RepositoryPackage::search(&conn, "letter").unwrap().len(), 1);

        repo.enabled = false;
        repo.update(&conn).unwrap();
        assert!(Repository::list_enabled(&conn).unwrap().is_empty());
        assert_eq!(Repository::list_all(&conn).unwrap().len(), 1);

        Repository::delete(&conn, repo_id).unwrap();
        assert!(RepositoryPackage::find_by_repository(&conn, repo_id).unwrap().is_empty());
    }
}
