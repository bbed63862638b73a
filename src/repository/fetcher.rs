// src/repository/fetcher.rs

//! Archive fetchers used by transaction `Fetch` steps

use super::{RepositoryClient, is_remote, local_path};
use crate::error::{Error, Result};
use crate::filesystem;
use crate::index::ArchiveRef;
use std::path::Path;
use tracing::debug;

/// Places a package archive at a local path
///
/// Implementations only transfer bytes; the caller verifies the checksum.
/// Fetchers are shared across the prefetch thread pool.
pub trait ArchiveFetcher: Send + Sync {
    /// Write the archive to `dest`, replacing anything already there
    fn fetch(&self, archive: &ArchiveRef, dest: &Path) -> Result<()>;
}

/// Copies archives from local paths and `file://` URLs
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFetcher;

impl ArchiveFetcher for LocalFetcher {
    fn fetch(&self, archive: &ArchiveRef, dest: &Path) -> Result<()> {
        if is_remote(&archive.location) {
            return Err(Error::DownloadError(format!(
                "{} is not a local archive",
                archive.location
            )));
        }

        let src = local_path(&archive.location);
        if !src.is_file() {
            return Err(Error::DownloadError(format!(
                "archive {} does not exist",
                src.display()
            )));
        }
        debug!("Copying {} to {}", src.display(), dest.display());
        filesystem::deploy_file(&src, dest, 0o644)
    }
}

/// Downloads over HTTP(S) with retries; local locations fall back to
/// [`LocalFetcher`]
pub struct HttpFetcher {
    client: RepositoryClient,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: RepositoryClient::new()?,
        })
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, archive: &ArchiveRef, dest: &Path) -> Result<()> {
        if is_remote(&archive.location) {
            self.client.download_file(&archive.location, dest)
        } else {
            LocalFetcher.fetch(archive, dest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_local_fetcher_copies_file_url() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a-1.0.tar.gz");
        fs::write(&src, b"archive bytes").unwrap();

        let archive = ArchiveRef {
            location: format!("file://{}", src.display()),
            checksum: filesystem::sha256_bytes(b"archive bytes"),
        };
        let dest = dir.path().join("staging/archives/a-1.0");
        LocalFetcher.fetch(&archive, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"archive bytes");
    }

    #[test]
    fn test_local_fetcher_rejects_missing_and_remote() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out");

        let missing = ArchiveRef {
            location: dir.path().join("nope.tar.gz").display().to_string(),
            checksum: String::new(),
        };
        assert!(LocalFetcher.fetch(&missing, &dest).is_err());

        let remote = ArchiveRef {
            location: "https://example.com/a.tar.gz".to_string(),
            checksum: String::new(),
        };
        assert!(LocalFetcher.fetch(&remote, &dest).is_err());
    }
}
