//! The server half: the acceptor loop and the per-connection
//! state machine it spawns.

pub mod acceptor;
pub mod connection;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::auth::CredentialStore;
use crate::config::Runtime;

/// Everything a connection task needs that outlives any single socket:
/// where user trees live, the credential backend, the tunables, and the
/// two process-wide shared structures (at-most-one live connection per
/// user, and the connection cap).
pub struct SharedState {
    pub storage_dir: PathBuf,
    pub config: Runtime,
    pub credentials: Arc<dyn CredentialStore>,
    pub connected_users: Mutex<HashSet<String>>,
    pub connection_count: AtomicUsize,
}

impl SharedState {
    pub fn new(storage_dir: PathBuf, config: Runtime, credentials: Arc<dyn CredentialStore>) -> Arc<Self> {
        Arc::new(SharedState {
            storage_dir,
            config,
            credentials,
            connected_users: Mutex::new(HashSet::new()),
            connection_count: AtomicUsize::new(0),
        })
    }

    pub fn user_root(&self, user: &str) -> PathBuf {
        self.storage_dir.join(user)
    }
}
