// src/transaction/steps.rs

//! How each step kind is applied, checked and compensated
//!
//! File steps work in two phases: every destination that already exists is
//! backed up under `backup/<seq>/` before the first file is touched. A
//! destination without a backup therefore did not exist when the step
//! started, which is what compensation relies on.

use crate::archive;
use crate::error::{Error, Result};
use crate::filesystem;
use crate::index::{ArchiveRef, ManifestEntry, PackageId};
use crate::planner::Step;
use crate::repository::{self, ArchiveFetcher};
use crate::state::{self, InstalledRecord};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-transaction working directory
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_path(&self, package: &PackageId) -> PathBuf {
        self.dir
            .join("archives")
            .join(format!("{}-{}.archive", package.name, package.version))
    }

    pub fn unpack_dir(&self, package: &PackageId) -> PathBuf {
        self.dir
            .join("unpacked")
            .join(format!("{}-{}", package.name, package.version))
    }

    pub fn backup_dir(&self, seq: i64) -> PathBuf {
        self.dir.join("backup").join(seq.to_string())
    }

    /// Delete the staging directory and everything in it
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Everything a step needs besides its payload
pub struct StepContext<'a> {
    pub root: &'a Path,
    pub staging: &'a Staging,
    pub fetcher: &'a dyn ArchiveFetcher,
    pub seq: i64,
}

fn step_error(step: &Step, reason: impl std::fmt::Display) -> Error {
    Error::StepExecution {
        step: step.describe(),
        reason: reason.to_string(),
    }
}

/// Fold low-level failures of a file step into `StepExecution`
fn file_step_error(step: &Step, err: Error) -> Error {
    match err {
        Error::StepExecution { .. } | Error::CorruptArchive { .. } | Error::Fetch { .. } => err,
        other => step_error(step, other),
    }
}

/// Fetch an archive into staging and verify its checksum
///
/// Used both by the prefetch pool and by the `Fetch` step itself.
pub fn fetch_archive(
    fetcher: &dyn ArchiveFetcher,
    staging: &Staging,
    package: &PackageId,
    archive: &ArchiveRef,
) -> Result<()> {
    let dest = staging.archive_path(package);
    fetcher.fetch(archive, &dest).map_err(|e| Error::Fetch {
        package: package.to_string(),
        reason: e.to_string(),
    })?;

    if let Err(e) = repository::verify_checksum(&dest, &archive.checksum) {
        let _ = filesystem::remove_file_if_exists(&dest);
        return Err(Error::CorruptArchive {
            package: package.to_string(),
            reason: e.to_string(),
        });
    }
    debug!("Fetched {} into staging", package);
    Ok(())
}

fn archive_is_staged(staging: &Staging, package: &PackageId, archive: &ArchiveRef) -> Result<bool> {
    filesystem::file_matches(&staging.archive_path(package), &archive.checksum)
}

fn files_linked(root: &Path, files: &[ManifestEntry]) -> Result<bool> {
    for file in files {
        if !filesystem::file_matches(&filesystem::join_relative(root, &file.path)?, &file.sha256)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn files_absent(root: &Path, files: &[ManifestEntry]) -> Result<bool> {
    for file in files {
        if fs::symlink_metadata(filesystem::join_relative(root, &file.path)?).is_ok() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn same_paths(a: &[ManifestEntry], b: &[ManifestEntry]) -> bool {
    let mut left: Vec<(&str, &str)> = a.iter().map(|f| (f.path.as_str(), f.sha256.as_str())).collect();
    let mut right: Vec<(&str, &str)> = b.iter().map(|f| (f.path.as_str(), f.sha256.as_str())).collect();
    left.sort_unstable();
    right.sort_unstable();
    left == right
}

fn record_matches(stored: &InstalledRecord, wanted: &InstalledRecord) -> bool {
    stored.version == wanted.version
        && stored.explicit == wanted.explicit
        && same_paths(&stored.files, &wanted.files)
}

/// Whether the step's post-state already holds
pub fn is_applied(conn: &Connection, ctx: &StepContext<'_>, step: &Step) -> Result<bool> {
    match step {
        Step::Fetch { package, archive } => archive_is_staged(ctx.staging, package, archive),
        Step::Unpack { package, files } => Ok(archive::is_unpacked(&ctx.staging.unpack_dir(package), files)),
        Step::LinkFiles { files, .. } => files_linked(ctx.root, files),
        Step::RemoveFiles { files, .. } => files_absent(ctx.root, files),
        Step::RecordInstall { record, .. } => Ok(state::load_record(conn, &record.name)?
            .map(|stored| record_matches(&stored, record))
            .unwrap_or(false)),
        Step::RecordRemoval { record } => Ok(state::load_record(conn, &record.name)?.is_none()),
    }
}

/// Apply a filesystem step
///
/// Record steps are applied by the executor inside the SQLite transaction
/// that also commits them; see [`apply_record`].
pub fn apply_files(ctx: &StepContext<'_>, step: &Step) -> Result<()> {
    match step {
        Step::Fetch { package, archive } => fetch_archive(ctx.fetcher, ctx.staging, package, archive),
        Step::Unpack { package, files } => {
            let dest = ctx.staging.unpack_dir(package);
            if dest.exists() {
                fs::remove_dir_all(&dest).map_err(|e| step_error(step, e))?;
            }
            let archive_path = ctx.staging.archive_path(package);
            if !archive_path.is_file() {
                return Err(step_error(step, "archive is not staged"));
            }
            archive::unpack(&archive_path, &dest, &package.to_string(), files)
        }
        Step::LinkFiles { package, files } => {
            link_files(ctx, package, files).map_err(|e| file_step_error(step, e))
        }
        Step::RemoveFiles { files, .. } => remove_files(ctx, files).map_err(|e| file_step_error(step, e)),
        Step::RecordInstall { record, previous } => {
            // A flag-only change touches no files
            if previous.as_ref().is_some_and(|p| p.files == record.files) {
                return Ok(());
            }
            // Records are only written over linked, verified files
            for file in &record.files {
                let path = filesystem::join_relative(ctx.root, &file.path)?;
                if !filesystem::file_matches(&path, &file.sha256)? {
                    return Err(step_error(step, format!("{} is missing or modified", file.path)));
                }
            }
            Ok(())
        }
        Step::RecordRemoval { .. } => Ok(()),
    }
}

fn backup_existing(ctx: &StepContext<'_>, files: &[ManifestEntry]) -> Result<()> {
    let backup_dir = ctx.staging.backup_dir(ctx.seq);
    for file in files {
        let dest = filesystem::join_relative(ctx.root, &file.path)?;
        filesystem::backup_file(&dest, &filesystem::join_relative(&backup_dir, &file.path)?)?;
    }
    Ok(())
}

fn link_files(ctx: &StepContext<'_>, package: &PackageId, files: &[ManifestEntry]) -> Result<()> {
    backup_existing(ctx, files)?;

    let unpacked = ctx.staging.unpack_dir(package);
    for file in files {
        let src = filesystem::join_relative(&unpacked, &file.path)?;
        let dest = filesystem::join_relative(ctx.root, &file.path)?;
        filesystem::deploy_file(&src, &dest, file.mode)?;
        if !filesystem::file_matches(&dest, &file.sha256)? {
            return Err(Error::ChecksumMismatch {
                expected: file.sha256.clone(),
                actual: filesystem::sha256_file(&dest)?,
            });
        }
    }
    debug!("Linked {} file(s) for {}", files.len(), package);
    Ok(())
}

fn remove_files(ctx: &StepContext<'_>, files: &[ManifestEntry]) -> Result<()> {
    backup_existing(ctx, files)?;

    for file in files {
        let dest = filesystem::join_relative(ctx.root, &file.path)?;
        if filesystem::remove_file_if_exists(&dest)? {
            filesystem::prune_empty_dirs(ctx.root, &dest);
        }
    }
    Ok(())
}

/// The store mutation of a record step; run inside a SQLite transaction
pub fn apply_record(conn: &Connection, step: &Step, journal_id: i64) -> Result<()> {
    match step {
        Step::RecordInstall { record, .. } => {
            state::write_record(conn, record, Some(journal_id))?;
        }
        Step::RecordRemoval { record } => {
            state::delete_record(conn, &record.name)?;
        }
        _ => {}
    }
    Ok(())
}

/// Undo a filesystem step; safe to run more than once
pub fn compensate_files(ctx: &StepContext<'_>, step: &Step) -> Result<()> {
    let backup_dir = ctx.staging.backup_dir(ctx.seq);
    match step {
        Step::LinkFiles { files, .. } => {
            for file in files.iter().rev() {
                let dest = filesystem::join_relative(ctx.root, &file.path)?;
                let backup = filesystem::join_relative(&backup_dir, &file.path)?;
                if backup.is_file() {
                    filesystem::restore_file(&backup, &dest)?;
                } else if filesystem::file_matches(&dest, &file.sha256)? {
                    filesystem::remove_file_if_exists(&dest)?;
                    filesystem::prune_empty_dirs(ctx.root, &dest);
                }
            }
            Ok(())
        }
        Step::RemoveFiles { files, .. } => {
            for file in files.iter().rev() {
                let backup = filesystem::join_relative(&backup_dir, &file.path)?;
                if backup.is_file() {
                    let dest = filesystem::join_relative(ctx.root, &file.path)?;
                    filesystem::restore_file(&backup, &dest)?;
                } else {
                    warn!("No backup of {} to restore", file.path);
                }
            }
            Ok(())
        }
        // Staging is discarded with the transaction
        Step::Fetch { .. } | Step::Unpack { .. } => Ok(()),
        Step::RecordInstall { .. } | Step::RecordRemoval { .. } => Ok(()),
    }
}

/// Undo a committed record step; run inside a SQLite transaction
pub fn compensate_record(conn: &Connection, step: &Step) -> Result<()> {
    match step {
        Step::RecordInstall { record, previous } => match previous {
            Some(previous) => {
                state::write_record(conn, previous, None)?;
            }
            None => {
                state::delete_record(conn, &record.name)?;
            }
        },
        Step::RecordRemoval { record } => {
            state::write_record(conn, record, None)?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::LocalFetcher;
    use crate::version::PackageVersion;
    use tempfile::TempDir;

    fn id(name: &str) -> PackageId {
        PackageId::new(name, PackageVersion::parse("1.0").unwrap())
    }

    fn entry(path: &str, data: &[u8]) -> ManifestEntry {
        ManifestEntry::new(path, filesystem::sha256_bytes(data), 0o644)
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        staging: Staging,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let staging = Staging::new(dir.path().join("staging"));
        Fixture {
            _dir: dir,
            root,
            staging,
        }
    }

    fn stage_unpacked(fx: &Fixture, package: &PackageId, files: &[(&str, &[u8])]) {
        let dir = fx.staging.unpack_dir(package);
        for (path, data) in files {
            let path = dir.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
    }

    #[test]
    fn test_link_then_compensate_restores_previous_content() {
        let fx = fixture();
        let package = id("a");
        stage_unpacked(&fx, &package, &[("etc/a.conf", b"new"), ("usr/bin/a", b"bin")]);

        fs::create_dir_all(fx.root.join("etc")).unwrap();
        fs::write(fx.root.join("etc/a.conf"), b"old").unwrap();

        let step = Step::LinkFiles {
            package: package.clone(),
            files: vec![entry("etc/a.conf", b"new"), entry("usr/bin/a", b"bin")],
        };
        let ctx = StepContext {
            root: &fx.root,
            staging: &fx.staging,
            fetcher: &LocalFetcher,
            seq: 3,
        };

        apply_files(&ctx, &step).unwrap();
        assert_eq!(fs::read(fx.root.join("etc/a.conf")).unwrap(), b"new");

        compensate_files(&ctx, &step).unwrap();
        assert_eq!(fs::read(fx.root.join("etc/a.conf")).unwrap(), b"old");
        assert!(!fx.root.join("usr/bin/a").exists());
        assert!(!fx.root.join("usr").exists());

        // Running compensation again changes nothing
        compensate_files(&ctx, &step).unwrap();
        assert_eq!(fs::read(fx.root.join("etc/a.conf")).unwrap(), b"old");
    }

    #[test]
    fn test_remove_then_compensate() {
        let fx = fixture();
        fs::create_dir_all(fx.root.join("usr/bin")).unwrap();
        fs::write(fx.root.join("usr/bin/a"), b"bin").unwrap();

        let files = vec![entry("usr/bin/a", b"bin")];
        let step = Step::RemoveFiles {
            package: id("a"),
            files: files.clone(),
        };
        let ctx = StepContext {
            root: &fx.root,
            staging: &fx.staging,
            fetcher: &LocalFetcher,
            seq: 0,
        };

        assert!(!files_absent(&fx.root, &files).unwrap());
        apply_files(&ctx, &step).unwrap();
        assert!(files_absent(&fx.root, &files).unwrap());

        compensate_files(&ctx, &step).unwrap();
        assert_eq!(fs::read(fx.root.join("usr/bin/a")).unwrap(), b"bin");
    }

    #[test]
    fn test_fetch_rejects_checksum_mismatch() {
        let fx = fixture();
        let src = fx.root.join("a.tar.gz");
        fs::write(&src, b"payload").unwrap();

        let package = id("a");
        let archive = ArchiveRef {
            location: src.display().to_string(),
            checksum: filesystem::sha256_bytes(b"something else"),
        };
        let result = fetch_archive(&LocalFetcher, &fx.staging, &package, &archive);
        assert!(matches!(result, Err(Error::CorruptArchive { .. })));
        assert!(!fx.staging.archive_path(&package).exists());

        let good = ArchiveRef {
            location: src.display().to_string(),
            checksum: filesystem::sha256_bytes(b"payload"),
        };
        fetch_archive(&LocalFetcher, &fx.staging, &package, &good).unwrap();
        assert!(archive_is_staged(&fx.staging, &package, &good).unwrap());
    }

    #[test]
    fn test_missing_archive_is_a_fetch_error() {
        let fx = fixture();
        let archive = ArchiveRef {
            location: fx.root.join("absent.tar.gz").display().to_string(),
            checksum: String::new(),
        };
        let result = fetch_archive(&LocalFetcher, &fx.staging, &id("a"), &archive);
        assert!(matches!(result, Err(Error::Fetch { .. })));
    }
}
