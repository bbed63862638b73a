// src/archive.rs

//! Package archive unpacking
//!
//! Archives are tarballs compressed with gzip, xz or zstd (plain tar is also
//! accepted). The compression is detected from the file's magic bytes, so a
//! staged archive does not need to keep its original extension.

use crate::error::{Error, Result};
use crate::filesystem;
use crate::index::ManifestEntry;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tar::{Archive, EntryType};
use tracing::{debug, warn};
use xz2::read::XzDecoder;

/// Compression wrapped around the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
    None,
}

impl Compression {
    /// Detect the compression from the first bytes of a file
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&[0x1f, 0x8b]) {
            Compression::Gzip
        } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Compression::Xz
        } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

fn corrupt(package: &str, reason: impl Into<String>) -> Error {
    Error::CorruptArchive {
        package: package.to_string(),
        reason: reason.into(),
    }
}

/// Open and decompress an archive
fn open_archive(path: &Path, package: &str) -> Result<Archive<Box<dyn Read>>> {
    let mut file = File::open(path)
        .map_err(|e| corrupt(package, format!("cannot open {}: {}", path.display(), e)))?;

    let mut header = [0u8; 6];
    let read = file.read(&mut header)?;
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = match Compression::detect(&header[..read]) {
        Compression::Zstd => {
            let decoder = zstd::Decoder::new(file)
                .map_err(|e| corrupt(package, format!("failed to create zstd decoder: {}", e)))?;
            Box::new(decoder)
        }
        Compression::Xz => Box::new(XzDecoder::new(file)),
        Compression::Gzip => Box::new(GzDecoder::new(file)),
        Compression::None => Box::new(file),
    };

    Ok(Archive::new(reader))
}

/// Unpack `archive` into `dest` and verify the result against `manifest`
///
/// Only regular files and directories are extracted. Entries outside the
/// manifest are extracted but ignored; every manifest entry must be present
/// afterwards with the declared checksum.
pub fn unpack(archive: &Path, dest: &Path, package: &str, manifest: &[ManifestEntry]) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut tar = open_archive(archive, package)?;

    let entries = tar
        .entries()
        .map_err(|e| corrupt(package, format!("unreadable archive: {}", e)))?;

    let mut extracted = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(package, format!("unreadable entry: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| corrupt(package, format!("bad entry path: {}", e)))?
            .to_string_lossy()
            .into_owned();

        match entry.header().entry_type() {
            EntryType::Directory => continue,
            EntryType::Regular | EntryType::Continuous => {}
            other => {
                warn!("Skipping {:?} entry {} in {}", other, raw_path, package);
                continue;
            }
        }

        let relative = filesystem::relative_path(&raw_path).map_err(|e| corrupt(package, e.to_string()))?;
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|e| corrupt(package, format!("failed to extract {}: {}", raw_path, e)))?;
        extracted += 1;
    }

    debug!("Extracted {} file(s) from {}", extracted, archive.display());
    verify_tree(dest, package, manifest)
}

/// Check that every manifest entry exists below `dest` with its checksum
pub fn verify_tree(dest: &Path, package: &str, manifest: &[ManifestEntry]) -> Result<()> {
    for entry in manifest {
        let path = filesystem::join_relative(dest, &entry.path)
            .map_err(|e| corrupt(package, e.to_string()))?;
        if !path.is_file() {
            return Err(corrupt(package, format!("manifest entry {} missing from archive", entry.path)));
        }
        let actual = filesystem::sha256_file(&path)?;
        if actual != entry.sha256 {
            return Err(corrupt(
                package,
                format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    entry.path, entry.sha256, actual
                ),
            ));
        }
    }
    Ok(())
}

/// Whether `dest` already holds a verified unpack of `manifest`
pub fn is_unpacked(dest: &Path, manifest: &[ManifestEntry]) -> bool {
    dest.is_dir() && verify_tree(dest, "", manifest).is_ok()
}
