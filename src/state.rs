// src/state.rs

//! The installed-state store
//!
//! `InstalledState` is a snapshot of the `packages`, `files` and
//! `dependencies` tables. The resolver and planner only ever see snapshots;
//! the store itself is mutated through [`write_record`] and [`delete_record`],
//! which the transaction executor calls from inside a committed record step.
//! Every mutation bumps the state generation so a plan computed against an
//! older snapshot can be detected and refused.

use crate::db::models::{
    DependencyEntry, FileEntry, InstalledPackage, bump_state_generation, current_timestamp,
    state_generation,
};
use crate::error::{Error, Result};
use crate::index::{ConflictDecl, DependencyConstraint, ManifestEntry, Package, PackageId};
use crate::version::{PackageVersion, VersionConstraint};
use fs4::FileExt;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What the store knows about one installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub name: String,
    pub version: PackageVersion,
    #[serde(default)]
    pub repository: Option<String>,
    pub explicit: bool,
    pub installed_at: String,
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
    #[serde(default)]
    pub dependencies: Vec<DependencyConstraint>,
    #[serde(default)]
    pub conflicts: Vec<ConflictDecl>,
}

impl InstalledRecord {
    /// Record for a package about to be installed
    pub fn from_package(package: &Package, explicit: bool) -> Self {
        Self {
            name: package.name.clone(),
            version: package.version.clone(),
            repository: Some(package.repository.clone()),
            explicit,
            installed_at: current_timestamp(),
            files: package.files.clone(),
            dependencies: package.dependencies.clone(),
            conflicts: package.conflicts.clone(),
        }
    }

    pub fn id(&self) -> PackageId {
        PackageId::new(self.name.clone(), self.version.clone())
    }

    /// True if this record has a non-optional dependency on `name`
    pub fn requires(&self, name: &str) -> bool {
        self.dependencies
            .iter()
            .any(|d| d.name == name && !d.optional)
    }
}

/// Snapshot of everything installed
#[derive(Debug, Clone, Default)]
pub struct InstalledState {
    records: BTreeMap<String, InstalledRecord>,
    generation: i64,
}

impl InstalledState {
    /// Build a snapshot from records, mainly for callers that do not use
    /// the SQLite store directly
    pub fn from_records(records: impl IntoIterator<Item = InstalledRecord>, generation: i64) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.name.clone(), r)).collect(),
            generation,
        }
    }

    /// Read the full installed state
    pub fn load(conn: &Connection) -> Result<Self> {
        let generation = state_generation(conn)?;
        let mut records = BTreeMap::new();
        for row in InstalledPackage::list_all(conn)? {
            let record = record_from_row(conn, row)?;
            records.insert(record.name.clone(), record);
        }
        debug!(
            "Loaded installed state: {} packages at generation {}",
            records.len(),
            generation
        );
        Ok(Self {
            records,
            generation,
        })
    }

    pub fn get(&self, name: &str) -> Option<&InstalledRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Records in name order
    pub fn records(&self) -> impl Iterator<Item = &InstalledRecord> {
        self.records.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Installed packages with a non-optional dependency on `name`
    pub fn dependents(&self, name: &str) -> Vec<&InstalledRecord> {
        self.records.values().filter(|r| r.requires(name)).collect()
    }
}

fn record_from_row(conn: &Connection, row: InstalledPackage) -> Result<InstalledRecord> {
    let package_id = row
        .id
        .ok_or_else(|| Error::InitError(format!("package {} has no id", row.name)))?;

    let files = FileEntry::find_by_package(conn, package_id)?
        .into_iter()
        .map(|f| ManifestEntry::new(f.path, f.sha256_hash, f.mode))
        .collect();

    let dependencies = DependencyEntry::find_by_package(conn, package_id)?
        .into_iter()
        .map(|d| -> Result<DependencyConstraint> {
            Ok(DependencyConstraint {
                name: d.depends_on_name,
                constraint: VersionConstraint::parse(&d.version_constraint)?,
                optional: d.optional,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let conflicts: Vec<ConflictDecl> = serde_json::from_str(&row.conflicts)?;

    Ok(InstalledRecord {
        version: PackageVersion::parse(&row.version)?,
        name: row.name,
        repository: row.repository,
        explicit: row.explicit,
        installed_at: row.installed_at,
        files,
        dependencies,
        conflicts,
    })
}

/// Read one record
pub fn load_record(conn: &Connection, name: &str) -> Result<Option<InstalledRecord>> {
    match InstalledPackage::find_by_name(conn, name)? {
        Some(row) => Ok(Some(record_from_row(conn, row)?)),
        None => Ok(None),
    }
}

/// Current state generation
pub fn current_generation(conn: &Connection) -> Result<i64> {
    state_generation(conn)
}

/// Insert or replace a record
///
/// Call inside a SQLite transaction; the old record, its files and its
/// dependencies are replaced as one unit.
pub fn write_record(
    conn: &Connection,
    record: &InstalledRecord,
    journal_id: Option<i64>,
) -> Result<i64> {
    InstalledPackage::delete_by_name(conn, &record.name)?;

    let mut row = InstalledPackage::new(
        record.name.clone(),
        record.version.to_string(),
        record.explicit,
    );
    row.repository = record.repository.clone();
    row.conflicts = serde_json::to_string(&record.conflicts)?;
    row.installed_at = record.installed_at.clone();
    row.installed_by_journal_id = journal_id;
    let package_id = row.insert(conn)?;

    for file in &record.files {
        FileEntry::new(file.path.clone(), file.sha256.clone(), file.mode, package_id)
            .insert(conn)?;
    }
    for dep in &record.dependencies {
        DependencyEntry::new(
            package_id,
            dep.name.clone(),
            dep.constraint.to_string(),
            dep.optional,
        )
        .insert(conn)?;
    }

    let generation = bump_state_generation(conn)?;
    debug!(
        "Recorded {}@{} (generation {})",
        record.name, record.version, generation
    );
    Ok(package_id)
}

/// Delete a record; returns whether it existed
pub fn delete_record(conn: &Connection, name: &str) -> Result<bool> {
    let existed = InstalledPackage::find_by_name(conn, name)?.is_some();
    if existed {
        InstalledPackage::delete_by_name(conn, name)?;
        let generation = bump_state_generation(conn)?;
        debug!("Deleted record {} (generation {})", name, generation);
    }
    Ok(existed)
}

/// Exclusive advisory lock on the state store
///
/// Held by a session for its whole lifetime; dropped with the file handle.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
    path: PathBuf,
}

impl StateLock {
    /// Take the lock or fail immediately with `Error::Locked`
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("Acquired state lock {}", path.display());
                Ok(Self {
                    _file: file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                Err(Error::Locked(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
