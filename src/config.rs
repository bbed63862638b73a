// src/config.rs

//! Explicit configuration for a pkgmgr session
//!
//! There is no process-wide configuration: a `Config` value is built by the
//! caller (the CLI fills it from flags) and passed into `Session`, which hands
//! the relevant pieces to the resolver, planner and executor.

use std::path::{Path, PathBuf};

/// Default database location
pub const DEFAULT_DB_PATH: &str = "/var/lib/pkgmgr/pkgmgr.db";

/// Default install root
pub const DEFAULT_ROOT: &str = "/";

/// Default cache directory (archives, staging, backups)
pub const DEFAULT_CACHE_DIR: &str = "/var/cache/pkgmgr";

/// Default number of concurrent archive prefetches
pub const DEFAULT_FETCH_WORKERS: usize = 4;

/// How repositories are ordered when equal versions of a package are
/// offered by more than one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepositoryOrder {
    /// Order in which repositories were added
    #[default]
    Declaration,
    /// Higher priority first, then declaration order
    Priority,
}

impl std::str::FromStr for RepositoryOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "declaration" => Ok(RepositoryOrder::Declaration),
            "priority" => Ok(RepositoryOrder::Priority),
            _ => Err(format!("Invalid repository order: {}", s)),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding installed state, journals and repositories
    pub db_path: PathBuf,
    /// Filesystem root that package paths are relative to
    pub root: PathBuf,
    /// Archive cache and transaction staging area
    pub cache_dir: PathBuf,
    /// Upper bound on concurrent archive fetches
    pub fetch_workers: usize,
    /// Tie-break policy between repositories
    pub repository_order: RepositoryOrder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            root: PathBuf::from(DEFAULT_ROOT),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            fetch_workers: DEFAULT_FETCH_WORKERS,
            repository_order: RepositoryOrder::Declaration,
        }
    }
}

impl Config {
    /// Configuration with database, root and cache all under one directory
    ///
    /// Handy for chroot-style installs and tests.
    pub fn rooted(base: &Path) -> Self {
        Self {
            db_path: base.join("var/lib/pkgmgr/pkgmgr.db"),
            root: base.to_path_buf(),
            cache_dir: base.join("var/cache/pkgmgr"),
            ..Self::default()
        }
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_fetch_workers(mut self, workers: usize) -> Self {
        self.fetch_workers = workers.max(1);
        self
    }

    pub fn with_repository_order(mut self, order: RepositoryOrder) -> Self {
        self.repository_order = order;
        self
    }

    /// Advisory lock file guarding the state store
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .db_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "pkgmgr.db".into());
        name.push(".lock");
        self.db_path.with_file_name(name)
    }

    /// Root of per-transaction staging directories
    pub fn transactions_dir(&self) -> PathBuf {
        self.cache_dir.join("transactions")
    }

    /// Staging directory for one journal
    pub fn staging_dir(&self, journal_id: i64) -> PathBuf {
        self.transactions_dir().join(journal_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = Config::default();
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.lock_path(), PathBuf::from("/var/lib/pkgmgr/pkgmgr.db.lock"));
        assert_eq!(config.staging_dir(7), PathBuf::from("/var/cache/pkgmgr/transactions/7"));
    }

    #[test]
    fn test_rooted_config() {
        let config = Config::rooted(Path::new("/tmp/chroot")).with_fetch_workers(0);
        assert_eq!(config.root, PathBuf::from("/tmp/chroot"));
        assert_eq!(config.db_path, PathBuf::from("/tmp/chroot/var/lib/pkgmgr/pkgmgr.db"));
        assert_eq!(config.fetch_workers, 1);
    }

    #[test]
    fn test_repository_order_from_str() {
        assert_eq!("priority".parse::<RepositoryOrder>().unwrap(), RepositoryOrder::Priority);
        assert_eq!(
            "declaration".parse::<RepositoryOrder>().unwrap(),
            RepositoryOrder::Declaration
        );
        assert!("random".parse::<RepositoryOrder>().is_err());
    }
}
