//! Content-hash gate for input files.
//!
//! The manifest is a JSON document:
//!
//! ```json
//! { "algorithm": "sha256",
//!   "files": [ { "filename": "tt.txt", "path": "data/tt.txt", "size": 1234, "hash": "<hex>" } ] }
//! ```
//!
//! `path` is resolved relative to the manifest's directory. The digest is the
//! lowercase hex SHA-256 of the raw file bytes. A mismatch is fatal and is
//! never retried.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use comb_core::errors::{AuditError, ErrorInfo};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

/// Only supported digest algorithm.
pub const HASH_ALGORITHM: &str = "sha256";

fn default_algorithm() -> String {
    HASH_ALGORITHM.to_string()
}

fn io_error(code: &str, path: &Path, err: impl ToString) -> AuditError {
    AuditError::Format(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

/// Single manifest record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Bare filename, informational.
    pub filename: String,
    /// Path relative to the manifest directory (or absolute).
    pub path: PathBuf,
    /// Expected size in bytes.
    pub size: u64,
    /// Expected lowercase hex digest.
    pub hash: String,
}

/// Manifest of trusted input files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Digest algorithm, must be `sha256`.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Records in declaration order.
    pub files: Vec<ManifestEntry>,
    /// Directory the manifest was loaded from (ignored when serializing).
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Outcome of hashing one file against an expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheck {
    /// Path that was hashed.
    pub path: String,
    /// Whether the digest (and size, when known) matched.
    pub ok: bool,
    /// Digest computed from the bytes on disk.
    pub actual_hash: String,
    /// Digest the manifest expected, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    /// Size of the file in bytes.
    pub size: u64,
}

/// Streams a file through SHA-256, returning the hex digest and byte count.
pub fn hash_file(path: &Path) -> Result<(String, u64), AuditError> {
    let file = File::open(path).map_err(|err| io_error("provenance_open", path, err))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = reader
            .read(&mut buf)
            .map_err(|err| io_error("provenance_read", path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Hashes `path` and compares it against `expected_hash`.
///
/// Returns `Ok` only on a match; a mismatch is a [`AuditError::Provenance`].
pub fn validate(path: &Path, expected_hash: &str) -> Result<FileCheck, AuditError> {
    let (actual_hash, size) = hash_file(path)?;
    let expected = expected_hash.trim().to_ascii_lowercase();
    if actual_hash != expected {
        error!(
            path = %path.display(),
            expected = %expected,
            actual = %actual_hash,
            "content hash mismatch"
        );
        return Err(AuditError::Provenance(
            ErrorInfo::new("provenance_hash_mismatch", "input file does not match manifest hash")
                .with_context("path", path.display().to_string())
                .with_context("expected", expected)
                .with_context("actual", actual_hash)
                .with_hint("re-fetch the input or issue a new manifest; never edit hashes to fit"),
        ));
    }
    Ok(FileCheck {
        path: path.display().to_string(),
        ok: true,
        actual_hash,
        expected_hash: Some(expected),
        size,
    })
}

/// Hashes a file without an expectation, for audit bookkeeping.
pub fn fingerprint(path: &Path) -> Result<FileCheck, AuditError> {
    let (actual_hash, size) = hash_file(path)?;
    Ok(FileCheck {
        path: path.display().to_string(),
        ok: true,
        actual_hash,
        expected_hash: None,
        size,
    })
}

/// Loads a manifest from disk.
pub fn load_manifest(path: &Path) -> Result<Manifest, AuditError> {
    let bytes = fs::read(path).map_err(|err| io_error("manifest_read", path, err))?;
    let mut manifest: Manifest = serde_json::from_slice(&bytes).map_err(|err| {
        AuditError::Format(
            ErrorInfo::new("manifest_parse", err.to_string())
                .with_context("path", path.display().to_string()),
        )
    })?;
    if manifest.algorithm.to_ascii_lowercase() != HASH_ALGORITHM {
        return Err(AuditError::Format(
            ErrorInfo::new("manifest_algorithm", "unsupported manifest hash algorithm")
                .with_context("algorithm", manifest.algorithm.clone())
                .with_hint("manifests must use sha256"),
        ));
    }
    manifest.base_dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    Ok(manifest)
}

impl Manifest {
    /// Builds a manifest describing the given files, with paths relative to `base_dir`
    /// whenever they live below it.
    pub fn build(paths: &[PathBuf], base_dir: &Path) -> Result<Self, AuditError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let (hash, size) = hash_file(path)?;
            let relative = path
                .strip_prefix(base_dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.clone());
            files.push(ManifestEntry {
                filename: path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default(),
                path: relative,
                size,
                hash,
            });
        }
        Ok(Self {
            algorithm: default_algorithm(),
            files,
            base_dir: base_dir.to_path_buf(),
        })
    }

    /// Resolved on-disk location of an entry.
    pub fn resolve(&self, entry: &ManifestEntry) -> PathBuf {
        if entry.path.is_absolute() {
            entry.path.clone()
        } else {
            self.base_dir.join(&entry.path)
        }
    }

    /// Finds the entry describing `path`, comparing canonicalised locations.
    pub fn entry_for(&self, path: &Path) -> Option<&ManifestEntry> {
        let target = fs::canonicalize(path).ok()?;
        self.files.iter().find(|entry| {
            fs::canonicalize(self.resolve(entry))
                .map(|resolved| resolved == target)
                .unwrap_or(false)
        })
    }

    /// Checks one input file against its manifest record.
    ///
    /// Files absent from the manifest are a provenance failure: an unlisted
    /// input is unverified input.
    pub fn verify_input(&self, path: &Path) -> Result<FileCheck, AuditError> {
        let entry = self.entry_for(path).ok_or_else(|| {
            AuditError::Provenance(
                ErrorInfo::new("provenance_unlisted", "input file is not listed in the manifest")
                    .with_context("path", path.display().to_string()),
            )
        })?;
        let check = check_entry(path, entry)?;
        info!(path = %path.display(), hash = %check.actual_hash, "input verified");
        Ok(check)
    }

    /// Verifies every file listed in the manifest, stopping at the first failure.
    pub fn validate_all(&self) -> Result<Vec<FileCheck>, AuditError> {
        self.files
            .iter()
            .map(|entry| check_entry(&self.resolve(entry), entry))
            .collect()
    }
}

fn check_entry(path: &Path, entry: &ManifestEntry) -> Result<FileCheck, AuditError> {
    let check = validate(path, &entry.hash)?;
    if check.size != entry.size {
        return Err(AuditError::Provenance(
            ErrorInfo::new("provenance_size_mismatch", "file size differs from manifest")
                .with_context("path", path.display().to_string())
                .with_context("expected", entry.size.to_string())
                .with_context("actual", check.size.to_string()),
        ));
    }
    Ok(check)
}
