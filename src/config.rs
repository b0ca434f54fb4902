//! Runtime tunables that were originally hardcoded as constants
//! (`CHUNK_SIZE`, the watcher delay, the deadline budgets, the connection
//! cap). Each can be overridden by an environment variable so tests can
//! shrink them without touching the call sites.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Runtime {
    pub chunk_size: usize,
    pub watcher_delay: Duration,
    pub frame_read_timeout: Duration,
    pub restore_read_timeout: Duration,
    pub checksync_timeout: Duration,
    pub server_read_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub connection_limit: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime {
            chunk_size: 4096,
            watcher_delay: Duration::from_secs(4),
            frame_read_timeout: Duration::from_secs(30),
            restore_read_timeout: Duration::from_secs(30),
            checksync_timeout: Duration::from_secs(300),
            server_read_timeout: Duration::from_secs(60),
            reconnect_backoff: Duration::from_secs(5),
            connection_limit: 50,
        }
    }
}

impl Runtime {
    /// Apply `DIRSYNC_*` environment overrides on top of the defaults.
    pub fn from_env() -> Self {
        let mut r = Runtime::default();
        if let Some(v) = env_u64("DIRSYNC_CHUNK_SIZE") {
            r.chunk_size = v as usize;
        }
        if let Some(v) = env_u64("DIRSYNC_WATCHER_DELAY_MS") {
            r.watcher_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("DIRSYNC_CONN_LIMIT") {
            r.connection_limit = v as usize;
        }
        if let Some(v) = env_u64("DIRSYNC_FRAME_TIMEOUT_MS") {
            r.frame_read_timeout = Duration::from_millis(v);
        }
        r
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
