//! The credential store. A trait so the server connection/acceptor
//! code depends on behavior, not on `rusqlite` directly, plus the one
//! real implementation backed by a SQLite users table.
//!
//! Grounded on `Database.cpp`: `isUserRegistered` (password compared as a
//! hash, inside the query in the original, as a post-fetch compare here)
//! and `registerUser` (existence check, then insert, user-already-exists
//! is a normal `false` return, not an error).

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DirsyncError;
use crate::hash::hash_bytes;

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// `true` if `user` exists and `pass` hashes to the stored password.
    async fn authenticate(&self, user: &str, pass: &str) -> Result<bool, DirsyncError>;

    /// Create a new user. `false` (not an error) if the username is taken.
    async fn register(&self, user: &str, pass: &str) -> Result<bool, DirsyncError>;
}

pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Opens (creating if needed) the database at `path`, creating the
    /// `users` table on first use.
    pub fn open(path: &Path) -> Result<Self, DirsyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                username TEXT NOT NULL PRIMARY KEY,
                password TEXT NOT NULL
            )",
            (),
        )?;
        Ok(SqliteCredentialStore { conn: Mutex::new(conn) })
    }

    /// The conventional location: `<storage_dir>/../Database/users.sqlite`.
    pub fn default_path(storage_dir: &Path) -> PathBuf {
        storage_dir
            .parent()
            .unwrap_or(storage_dir)
            .join("Database")
            .join("users.sqlite")
    }
}

#[async_trait::async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn authenticate(&self, user: &str, pass: &str) -> Result<bool, DirsyncError> {
        let conn = self.conn.lock().await;
        let stored: Option<String> = conn
            .query_row(
                "SELECT password FROM users WHERE username = ?1",
                [user],
                |row| row.get(0),
            )
            .ok();
        let Some(stored) = stored else {
            debug!("authenticate: no such user {user}");
            return Ok(false);
        };
        let ok = stored == hash_bytes(pass.as_bytes());
        if ok {
            info!("password matches for {user}");
        } else {
            warn!("password mismatch for {user}");
        }
        Ok(ok)
    }

    async fn register(&self, user: &str, pass: &str) -> Result<bool, DirsyncError> {
        let conn = self.conn.lock().await;
        let exists: i64 = conn.query_row(
            "SELECT count(*) FROM users WHERE username = ?1",
            [user],
            |row| row.get(0),
        )?;
        if exists > 0 {
            info!("user {user} already exists on the database");
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO users (username, password) VALUES (?1, ?2)",
            rusqlite::params![user, hash_bytes(pass.as_bytes())],
        )?;
        info!("registered user {user}");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_authenticate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCredentialStore::open(&dir.path().join("users.sqlite")).unwrap();
        assert!(store.register("alice", "hunter2").await.unwrap());
        assert!(store.authenticate("alice", "hunter2").await.unwrap());
        assert!(!store.authenticate("alice", "wrong").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_not_errored() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCredentialStore::open(&dir.path().join("users.sqlite")).unwrap();
        assert!(store.register("bob", "pw").await.unwrap());
        assert!(!store.register("bob", "other").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_user_does_not_authenticate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCredentialStore::open(&dir.path().join("users.sqlite")).unwrap();
        assert!(!store.authenticate("nobody", "pw").await.unwrap());
    }

    #[tokio::test]
    async fn default_path_is_storage_sibling() {
        let storage = Path::new("/srv/dirsync/storage");
        let p = SqliteCredentialStore::default_path(storage);
        assert_eq!(p, Path::new("/srv/dirsync/Database/users.sqlite"));
    }
}
