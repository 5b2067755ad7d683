//! Credential store
//!
//! A deliberately small key-value interface: look a user up, or create one.
//! The disk implementation keeps one serialized record per user; duplicate
//! signups are rejected race-free by an exclusive create. Password hashing
//! is left to the store by contract, and this store keeps them plain, as
//! the service always has.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Credential store failure.
#[derive(Debug, Error)]
pub enum UserStoreError {
    /// Signup for a username that is already taken.
    #[error("username already exists")]
    AlreadyExists,
    /// Underlying persistence failure.
    #[error("user store I/O error: {0}")]
    Io(#[from] io::Error),
    /// A record on disk could not be decoded.
    #[error("corrupt user record: {0}")]
    Corrupt(#[from] bincode::Error),
}

/// Lookup/create interface the authenticator runs against.
pub trait UserStore: Send + Sync {
    /// Return the stored password for `username`, if the user exists.
    fn lookup(&self, username: &str) -> Result<Option<String>, UserStoreError>;

    /// Create a new user. Fails with [`UserStoreError::AlreadyExists`] if
    /// the username is taken.
    fn create(&self, username: &str, password: &str) -> Result<(), UserStoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRecord {
    username: String,
    password: String,
    created_secs: u64,
}

/// Disk-backed credential store: one bincode record per user.
#[derive(Debug)]
pub struct DiskUserStore {
    dir: PathBuf,
}

impl DiskUserStore {
    /// Open (and create if absent) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<DiskUserStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(DiskUserStore { dir })
    }

    fn record_path(&self, username: &str) -> PathBuf {
        // Callers validate usernames at signup; this is the storage key.
        self.dir.join(format!("{username}.user"))
    }
}

impl UserStore for DiskUserStore {
    fn lookup(&self, username: &str) -> Result<Option<String>, UserStoreError> {
        let file = match File::open(self.record_path(username)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: UserRecord = bincode::deserialize_from(file)?;
        Ok(Some(record.password))
    }

    fn create(&self, username: &str, password: &str) -> Result<(), UserStoreError> {
        // create_new makes the duplicate check atomic with the creation, so
        // two racing signups cannot both win.
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.record_path(username))
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(UserStoreError::AlreadyExists);
            }
            Err(e) => return Err(e.into()),
        };

        let created_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let record = UserRecord {
            username: username.to_string(),
            password: password.to_string(),
            created_secs,
        };
        bincode::serialize_into(file, &record)?;
        info!("created user '{username}'");
        Ok(())
    }
}
