//! File-object store
//!
//! The dispatch core only ever talks to the [`Storage`] trait; the disk
//! implementation keeps one directory per user containing raw payload
//! files and serialized metadata sidecars (`<name>.meta`), plus a per-user
//! quota record at the storage root. Payloads are stored as the exact
//! bytes received on the wire.
//!
//! Callers are expected to hold the file lock for the `(user, name)` key
//! around every mutating call; quota accounting, which spans files, is
//! serialized by a store-internal mutex instead.

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const META_SUFFIX: &str = ".meta";
const QUOTA_SUFFIX: &str = ".quota";

/// Default per-user quota: 100 MiB.
pub const DEFAULT_QUOTA_BYTES: u64 = 100 * 1024 * 1024;

/// Storage failure, surfaced to the client inside `ERROR: …` lines.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No such file for this user.
    #[error("file not found")]
    NotFound,
    /// The write would push the user past their byte quota.
    #[error("upload would exceed quota limit")]
    QuotaExceeded,
    /// Underlying filesystem failure.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    /// A sidecar on disk could not be decoded.
    #[error("corrupt metadata: {0}")]
    Corrupt(#[from] bincode::Error),
}

/// Per-file metadata kept alongside each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Sanitized filename.
    pub name: String,
    /// Payload size in bytes.
    pub size: u64,
    /// Creation time, seconds since the epoch. Preserved across overwrites.
    pub created_secs: u64,
    /// Last modification time, seconds since the epoch.
    pub modified_secs: u64,
    /// Lowercase hex SHA-256 digest of the payload.
    pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuotaRecord {
    limit: u64,
    used: u64,
}

/// Byte-level put/get/remove/list interface the workers run against.
pub trait Storage: Send + Sync {
    /// Store `data` under `(user, name)`, creating the user's directory if
    /// needed, and record fresh metadata.
    fn save(&self, user: &str, name: &str, data: &[u8]) -> Result<FileMetadata, StorageError>;

    /// Return the full payload of `(user, name)`.
    fn load(&self, user: &str, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Remove the payload and its metadata.
    fn remove(&self, user: &str, name: &str) -> Result<(), StorageError>;

    /// Render the user's file listing as human-readable text.
    fn list(&self, user: &str) -> Result<String, StorageError>;

    /// Fetch the metadata for `(user, name)`, if the file exists.
    fn load_metadata(&self, user: &str, name: &str)
    -> Result<Option<FileMetadata>, StorageError>;
}

/// Disk-backed [`Storage`] implementation.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
    quota_limit: u64,
    // Quota accounting is a read-modify-write across files of one user;
    // a single lock covers the whole commit.
    quota: Mutex<()>,
}

impl DiskStorage {
    /// Open (and create if absent) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, quota_limit: u64) -> io::Result<DiskStorage> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DiskStorage {
            root,
            quota_limit,
            quota: Mutex::new(()),
        })
    }

    fn user_dir(&self, user: &str) -> PathBuf {
        self.root.join(user)
    }

    fn payload_path(&self, user: &str, name: &str) -> PathBuf {
        self.user_dir(user).join(name)
    }

    fn meta_path(&self, user: &str, name: &str) -> PathBuf {
        self.user_dir(user).join(format!("{name}{META_SUFFIX}"))
    }

    fn quota_path(&self, user: &str) -> PathBuf {
        self.root.join(format!("{user}{QUOTA_SUFFIX}"))
    }

    fn read_meta(&self, user: &str, name: &str) -> Result<Option<FileMetadata>, StorageError> {
        let file = match File::open(self.meta_path(user, name)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(bincode::deserialize_from(file)?))
    }

    fn write_meta(&self, user: &str, meta: &FileMetadata) -> Result<(), StorageError> {
        let file = File::create(self.meta_path(user, &meta.name))?;
        bincode::serialize_into(file, meta)?;
        Ok(())
    }

    fn read_quota(&self, user: &str) -> Result<QuotaRecord, StorageError> {
        let file = match File::open(self.quota_path(user)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(QuotaRecord {
                    limit: self.quota_limit,
                    used: 0,
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(bincode::deserialize_from(file)?)
    }

    fn write_quota(&self, user: &str, record: &QuotaRecord) -> Result<(), StorageError> {
        let file = File::create(self.quota_path(user))?;
        bincode::serialize_into(file, record)?;
        Ok(())
    }

    /// Size of the existing payload under this name, 0 if absent.
    fn existing_size(&self, user: &str, name: &str) -> Result<u64, StorageError> {
        if let Some(meta) = self.read_meta(user, name)? {
            return Ok(meta.size);
        }
        match fs::metadata(self.payload_path(user, name)) {
            Ok(stat) => Ok(stat.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl Storage for DiskStorage {
    fn save(&self, user: &str, name: &str, data: &[u8]) -> Result<FileMetadata, StorageError> {
        let _quota_held = self.quota.lock();

        let old_size = self.existing_size(user, name)?;
        let mut quota = self.read_quota(user)?;
        let projected = quota.used.saturating_sub(old_size) + data.len() as u64;
        if projected > quota.limit {
            return Err(StorageError::QuotaExceeded);
        }

        fs::create_dir_all(self.user_dir(user))?;
        fs::write(self.payload_path(user, name), data)?;

        let now = epoch_secs();
        let created_secs = self
            .read_meta(user, name)?
            .map(|m| m.created_secs)
            .unwrap_or(now);
        let meta = FileMetadata {
            name: name.to_string(),
            size: data.len() as u64,
            created_secs,
            modified_secs: now,
            sha256: sha256_hex(data),
        };
        self.write_meta(user, &meta)?;

        quota.used = projected;
        self.write_quota(user, &quota)?;
        debug!(
            "saved {}/{} ({} bytes, quota {}/{})",
            user, name, meta.size, quota.used, quota.limit
        );
        Ok(meta)
    }

    fn load(&self, user: &str, name: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.payload_path(user, name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, user: &str, name: &str) -> Result<(), StorageError> {
        let _quota_held = self.quota.lock();

        let freed = self.existing_size(user, name)?;
        match fs::remove_file(self.payload_path(user, name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) => return Err(e.into()),
        }
        // The sidecar may legitimately be missing.
        match fs::remove_file(self.meta_path(user, name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut quota = self.read_quota(user)?;
        quota.used = quota.used.saturating_sub(freed);
        self.write_quota(user, &quota)?;
        debug!("removed {}/{} (freed {} bytes)", user, name, freed);
        Ok(())
    }

    fn list(&self, user: &str) -> Result<String, StorageError> {
        let entries = match fs::read_dir(self.user_dir(user)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok("No files found.\n".to_string());
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(META_SUFFIX) || !entry.file_type()?.is_file() {
                continue;
            }
            let (size, modified_secs) = match self.read_meta(user, &name)? {
                Some(meta) => (meta.size, meta.modified_secs),
                None => {
                    let stat = entry.metadata()?;
                    let modified = stat
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    (stat.len(), modified)
                }
            };
            files.push((name, size, modified_secs));
        }

        if files.is_empty() {
            return Ok("No files found.\n".to_string());
        }
        files.sort();

        let mut out = format!(
            "=== File Listing for {user} ===\n\n{:<30} {:<10} {:<20}\n{:<30} {:<10} {:<20}\n",
            "Filename", "Size", "Modified", "--------", "----", "--------"
        );
        for (name, size, modified_secs) in files {
            let when = DateTime::from_timestamp(modified_secs as i64, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!("{name:<30} {size:<10} {when:<20}\n"));
        }
        Ok(out)
    }

    fn load_metadata(
        &self,
        user: &str,
        name: &str,
    ) -> Result<Option<FileMetadata>, StorageError> {
        self.read_meta(user, name)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
