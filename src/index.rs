// src/index.rs

//! In-memory view of the packages offered by repositories
//!
//! A `PackageIndex` is built once (from synced repository metadata or
//! directly by a caller) and then only read. Candidates for a name are kept
//! highest version first; equal versions keep repository order, which is how
//! the resolver breaks ties between repositories.

use crate::config::RepositoryOrder;
use crate::db::models::{Repository, RepositoryPackage};
use crate::error::{Error, Result};
use crate::version::{PackageVersion, VersionConstraint};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Identity of a package: name plus version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId {
    pub name: String,
    pub version: PackageVersion,
}

impl PackageId {
    pub fn new(name: impl Into<String>, version: PackageVersion) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A dependency of one package on another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConstraint {
    pub name: String,
    #[serde(default)]
    pub constraint: VersionConstraint,
    #[serde(default)]
    pub optional: bool,
}

impl DependencyConstraint {
    pub fn new(name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            constraint,
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A declared conflict; `Any` names every version of the package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDecl {
    pub name: String,
    #[serde(default)]
    pub constraint: VersionConstraint,
}

impl ConflictDecl {
    pub fn new(name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            constraint,
        }
    }

    pub fn matches(&self, name: &str, version: &PackageVersion) -> bool {
        self.name == name && self.constraint.matches(version)
    }
}

fn default_mode() -> u32 {
    0o644
}

/// One file shipped by a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the install root
    pub path: String,
    pub sha256: String,
    #[serde(default = "default_mode")]
    pub mode: u32,
}

impl ManifestEntry {
    pub fn new(path: impl Into<String>, sha256: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            sha256: sha256.into(),
            mode,
        }
    }
}

/// Where a package archive lives and what it must hash to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRef {
    /// URL, `file://` URL or local path
    pub location: String,
    /// SHA-256 of the archive file
    pub checksum: String,
}

/// A package version available from a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: PackageVersion,
    pub repository: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyConstraint>,
    #[serde(default)]
    pub conflicts: Vec<ConflictDecl>,
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
    #[serde(default)]
    pub size: u64,
    pub archive: ArchiveRef,
}

impl Package {
    pub fn id(&self) -> PackageId {
        PackageId::new(self.name.clone(), self.version.clone())
    }

    /// Build from a synced repository row
    pub fn from_repository_row(row: &RepositoryPackage, repository: &str) -> Result<Self> {
        let version = PackageVersion::parse(&row.version)?;
        let dependencies: Vec<DependencyConstraint> = serde_json::from_str(&row.dependencies)?;
        let conflicts: Vec<ConflictDecl> = serde_json::from_str(&row.conflicts)?;
        let mut files: Vec<ManifestEntry> = serde_json::from_str(&row.files)?;
        // Hashes are compared as lowercase hex everywhere
        for file in &mut files {
            file.sha256.make_ascii_lowercase();
        }

        Ok(Self {
            name: row.name.clone(),
            version,
            repository: repository.to_string(),
            description: row.description.clone(),
            dependencies,
            conflicts,
            files,
            size: u64::try_from(row.size).unwrap_or(0),
            archive: ArchiveRef {
                location: row.download_url.clone(),
                checksum: row.checksum.to_ascii_lowercase(),
            },
        })
    }
}

/// Available packages, grouped by name
#[derive(Debug, Clone, Default)]
pub struct PackageIndex {
    packages: BTreeMap<String, Vec<Package>>,
    repositories: Vec<String>,
}

impl PackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the packages of one repository
    ///
    /// Repositories added earlier win ties between equal versions.
    pub fn add_repository(&mut self, name: &str, packages: Vec<Package>) {
        if !self.repositories.iter().any(|r| r == name) {
            self.repositories.push(name.to_string());
        }

        for mut package in packages {
            package.repository = name.to_string();
            let candidates = self.packages.entry(package.name.clone()).or_default();
            // Same identity from the same repository is listed once
            if candidates
                .iter()
                .any(|c| c.repository == package.repository && c.version == package.version)
            {
                continue;
            }
            candidates.push(package);
        }

        let repositories = self.repositories.clone();
        let rank = |name: &str| {
            repositories
                .iter()
                .position(|r| r == name)
                .unwrap_or(usize::MAX)
        };
        for candidates in self.packages.values_mut() {
            candidates.sort_by(|a, b| {
                b.version
                    .cmp(&a.version)
                    .then_with(|| rank(&a.repository).cmp(&rank(&b.repository)))
            });
        }
    }

    /// Load every enabled repository's synced packages
    pub fn load(conn: &Connection, order: RepositoryOrder) -> Result<Self> {
        let mut repos = Repository::list_enabled(conn)?;
        if order == RepositoryOrder::Priority {
            // Stable: equal priorities keep declaration order
            repos.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        let mut index = Self::new();
        for repo in &repos {
            let repo_id = repo
                .id
                .ok_or_else(|| Error::InitError(format!("repository {} has no id", repo.name)))?;

            let mut packages = Vec::new();
            for row in RepositoryPackage::find_by_repository(conn, repo_id)? {
                match Package::from_repository_row(&row, &repo.name) {
                    Ok(package) => packages.push(package),
                    Err(e) => warn!(
                        "Skipping {} {} from repository {}: {}",
                        row.name, row.version, repo.name, e
                    ),
                }
            }
            debug!("Loaded {} packages from repository {}", packages.len(), repo.name);
            index.add_repository(&repo.name, packages);
        }

        Ok(index)
    }

    /// All candidates for a name, best first
    pub fn candidates(&self, name: &str) -> &[Package] {
        self.packages.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct versions offered for a name, highest first
    pub fn versions(&self, name: &str) -> Vec<PackageVersion> {
        let mut versions: Vec<PackageVersion> = Vec::new();
        for package in self.candidates(name) {
            if versions.last() != Some(&package.version) {
                versions.push(package.version.clone());
            }
        }
        versions
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Package names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn repositories(&self) -> &[String] {
        &self.repositories
    }

    /// Number of distinct package names
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn package(name: &str, version: &str) -> Package {
        Package {
            name: name.to_string(),
            version: PackageVersion::parse(version).unwrap(),
            repository: String::new(),
            description: None,
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            files: Vec::new(),
            size: 0,
            archive: ArchiveRef {
                location: format!("{}-{}.tar.gz", name, version),
                checksum: String::new(),
            },
        }
    }

    #[test]
    fn test_candidates_sorted_highest_first() {
        let mut index = PackageIndex::new();
        index.add_repository(
            "core",
            vec![package("a", "1.0"), package("a", "2.0"), package("a", "1.5")],
        );

        let versions: Vec<String> = index.versions("a").iter().map(|v| v.to_string()).collect();
        assert_eq!(versions, vec!["2.0", "1.5", "1.0"]);
        assert!(index.candidates("missing").is_empty());
    }

    #[test]
    fn test_equal_versions_keep_repository_order() {
        let mut index = PackageIndex::new();
        index.add_repository("first", vec![package("a", "1.0")]);
        index.add_repository("second", vec![package("a", "1.0"), package("a", "1.1")]);

        let candidates = index.candidates("a");
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].repository, "second");
        assert_eq!(candidates[1].repository, "first");
        assert_eq!(candidates[2].repository, "second");

        assert_eq!(index.versions("a").len(), 2);
    }

    #[test]
    fn test_conflict_matching() {
        let any = ConflictDecl::new("c", VersionConstraint::Any);
        let exact = ConflictDecl::new("c", VersionConstraint::parse("=1.0").unwrap());
        let v1 = PackageVersion::parse("1.0").unwrap();
        let v2 = PackageVersion::parse("2.0").unwrap();

        assert!(any.matches("c", &v2));
        assert!(exact.matches("c", &v1));
        assert!(!exact.matches("c", &v2));
        assert!(!any.matches("d", &v1));
    }

    #[test]
    fn test_load_from_database_honours_priority() {
        let temp = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();

        let mut low = Repository::new("low".to_string(), "file:///low".to_string());
        let low_id = low.insert(&conn).unwrap();
        let mut high = Repository::new("high".to_string(), "file:///high".to_string());
        high.priority = 10;
        let high_id = high.insert(&conn).unwrap();

        for repo_id in [low_id, high_id] {
            let mut row = RepositoryPackage::new(
                repo_id,
                "a".to_string(),
                "1.0".to_string(),
                "SUM".to_string(),
                1,
                "a-1.0.tar.gz".to_string(),
            );
            row.dependencies = r#"[{"name": "b", "constraint": ">=1.0"}]"#.to_string();
            row.files = r#"[{"path": "usr/bin/a", "sha256": "ABCdef", "mode": 493}]"#.to_string();
            row.insert(&conn).unwrap();
        }

        let declared = PackageIndex::load(&conn, RepositoryOrder::Declaration).unwrap();
        assert_eq!(declared.candidates("a")[0].repository, "low");

        let prioritized = PackageIndex::load(&conn, RepositoryOrder::Priority).unwrap();
        let best = &prioritized.candidates("a")[0];
        assert_eq!(best.repository, "high");
        assert_eq!(best.dependencies[0].name, "b");
        assert!(!best.dependencies[0].optional);
        assert_eq!(best.files[0].mode, 0o755);
        assert_eq!(best.files[0].sha256, "abcdef");
        assert_eq!(best.archive.checksum, "sum");
    }
}
