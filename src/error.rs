// src/error.rs

use crate::version::{PackageVersion, VersionConstraint};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Core error types for pkgmgr
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of journal payloads or repository metadata failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Named entity (repository, package) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed version, constraint, timestamp or metadata
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Repository metadata could not be downloaded
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// No assignment of versions satisfies the requested changes
    #[error(transparent)]
    Unsatisfiable(#[from] Unsatisfiable),

    /// The dependency relation among resolved packages is cyclic
    #[error("Dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// Two resolved packages declare a conflict with each other
    #[error("Package {package} conflicts with {conflicts_with}")]
    Conflict {
        package: String,
        conflicts_with: String,
    },

    /// Removal refused because installed packages still depend on the target
    #[error("Cannot remove {package}: required by {}", .dependents.join(", "))]
    RemovalBlocked {
        package: String,
        dependents: Vec<String>,
    },

    /// Package is not installed
    #[error("Package '{0}' is not installed")]
    NotInstalled(String),

    /// Contradictory or malformed request set
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Archive could not be fetched
    #[error("Failed to fetch {package}: {reason}")]
    Fetch { package: String, reason: String },

    /// Archive is unreadable or its contents do not match the manifest
    #[error("Corrupt archive for {package}: {reason}")]
    CorruptArchive { package: String, reason: String },

    /// A filesystem step failed (permissions, disk full, checksum after link)
    #[error("Step '{step}' failed: {reason}")]
    StepExecution { step: String, reason: String },

    /// Persisted journal is unreadable, inconsistent, or a rollback failed
    #[error("Transaction journal requires manual intervention: {0}")]
    JournalCorruption(String),

    /// Installed state changed after the plan was computed
    #[error("Installed state changed since resolution (planned against generation {expected}, found {found})")]
    StaleState { expected: i64, found: i64 },

    /// Another process holds the state lock
    #[error("State store is locked by another process: {0}")]
    Locked(String),

    /// Transaction was cancelled between steps
    #[error("Transaction cancelled")]
    Cancelled,
}

impl Error {
    /// Stable short name of the error class, for structured reports
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::InitError(_) => "init",
            Error::DatabaseNotFound(_) => "database_not_found",
            Error::NotFound(_) => "not_found",
            Error::ParseError(_) => "parse",
            Error::DownloadError(_) => "download",
            Error::ChecksumMismatch { .. } => "checksum_mismatch",
            Error::Unsatisfiable(_) => "unsatisfiable",
            Error::CyclicDependency { .. } => "cyclic_dependency",
            Error::Conflict { .. } => "conflict",
            Error::RemovalBlocked { .. } => "removal_blocked",
            Error::NotInstalled(_) => "not_installed",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Fetch { .. } => "fetch",
            Error::CorruptArchive { .. } => "corrupt_archive",
            Error::StepExecution { .. } => "step_execution",
            Error::JournalCorruption(_) => "journal_corruption",
            Error::StaleState { .. } => "stale_state",
            Error::Locked(_) => "locked",
            Error::Cancelled => "cancelled",
        }
    }
}

/// One constraint imposed on a package during resolution.
///
/// `chain` is the path of resolved packages leading to the constraint,
/// outermost first. An empty chain means the constraint came directly from
/// a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    pub chain: Vec<String>,
    pub name: String,
    pub constraint: VersionConstraint,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.chain.is_empty() {
            write!(f, "request")?;
        } else {
            write!(f, "{}", self.chain.join(" -> "))?;
        }
        write!(f, " -> {} {}", self.name, self.constraint)
    }
}

/// Resolution failure with the constraint chain that could not be met
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error(
    "Unsatisfiable dependency on {package}: {} (available: {})",
    render_requirements(.requirements),
    render_versions(.available)
)]
pub struct Unsatisfiable {
    pub package: String,
    pub requirements: Vec<Requirement>,
    pub available: Vec<PackageVersion>,
}

fn render_requirements(requirements: &[Requirement]) -> String {
    if requirements.is_empty() {
        return "no constraints".to_string();
    }
    requirements
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn render_versions(versions: &[PackageVersion]) -> String {
    if versions.is_empty() {
        return "none".to_string();
    }
    versions
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using pkgmgr's Error type
pub type Result<T> = std::result::Result<T, Error>;
