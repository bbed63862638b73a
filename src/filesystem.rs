// src/filesystem.rs

//! Filesystem primitives used by transaction steps
//!
//! Files are deployed atomically (write to a temporary file in the target
//! directory, then rename over the destination), so an interrupted step never
//! leaves a half-written file behind. Every path that comes from package
//! metadata goes through [`relative_path`] before it touches the disk.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// SHA-256 of an in-memory buffer, lowercase hex
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a file's contents, lowercase hex
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// True if `path` is a regular file whose hash equals `expected`
pub fn file_matches(path: &Path, expected: &str) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => Ok(sha256_file(path)? == expected),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Validate a manifest path and return it as a relative path
///
/// A single leading `/` is accepted and stripped; empty paths and any `..`
/// component are rejected.
pub fn relative_path(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::ParseError(format!("empty file path '{}'", path)));
    }

    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::ParseError(format!("unsafe file path '{}'", path)));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(Error::ParseError(format!("empty file path '{}'", path)));
    }
    Ok(out)
}

/// Join a manifest path onto `base` after validating it
pub fn join_relative(base: &Path, path: &str) -> Result<PathBuf> {
    Ok(base.join(relative_path(path)?))
}

/// Atomically place a copy of `src` at `dest` with the given mode
///
/// The temporary file is created next to `dest` so the final rename never
/// crosses a filesystem boundary.
pub fn deploy_file(src: &Path, dest: &Path, mode: u32) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| Error::InitError(format!("no parent directory for {}", dest.display())))?;
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    {
        let mut source = File::open(src)?;
        io::copy(&mut source, temp.as_file_mut())?;
        temp.as_file_mut().flush()?;
        temp.as_file().sync_all()?;
    }
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))?;

    temp.persist(dest).map_err(|e| Error::Io(e.error))?;
    debug!("Deployed {} (mode {:o})", dest.display(), mode);
    Ok(())
}

/// Copy `src` to `backup` unless a backup already exists
///
/// Returns `true` when a backup is present afterwards. Keeping the first
/// backup means a re-run of a half-finished step never replaces the original
/// content with the new one.
pub fn backup_file(src: &Path, backup: &Path) -> Result<bool> {
    if backup.exists() {
        return Ok(true);
    }
    let meta = match fs::symlink_metadata(src) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Ok(false);
    }

    deploy_file(src, backup, meta.permissions().mode() & 0o7777)?;
    debug!("Backed up {} to {}", src.display(), backup.display());
    Ok(true)
}

/// Put a backup back in place, keeping the backup's mode
pub fn restore_file(backup: &Path, dest: &Path) -> Result<()> {
    let mode = fs::metadata(backup)?.permissions().mode() & 0o7777;
    deploy_file(backup, dest, mode)
}

/// Remove a file; a missing file is not an error
///
/// Returns whether something was removed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove directories left empty below `root`, walking up from `path`'s parent
pub fn prune_empty_dirs(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails on non-empty directories, which ends the walk
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Mode bits of a file, if it exists
pub fn file_mode(path: &Path) -> Result<Option<u32>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.permissions().mode() & 0o7777)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
