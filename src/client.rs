//! The client engine. Connects, authenticates, then either streams a
//! `FileEvent` queue to the server (monitor), pulls the whole tree down
//! (restore), or reconciles against a manifest (checksync).
//!
//! Grounded on `ClientEngine.cpp`: `connect_handler` (auth/signup
//! handshake), `startSync`/`sendFile`/`sendFileData` (the monitor loop and
//! its reconnect-and-retry policy), `restore`/`checkSync` (the other two
//! startup modes). The original's boost `deadline_timer` per read becomes
//! a `tokio::time::timeout` around each `read_frame`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::codec::{decode, encode, FrameReader, SyncFrame};
use crate::config::Runtime;
use crate::error::DirsyncError;
use crate::hash::hash_file;
use crate::queue::EventQueue;
use crate::types::{ChangeKind, Credentials, FileEvent, ManifestDir, ManifestFile};
use crate::watcher::Watcher;

pub struct AuthOutcome {
    pub ok: bool,
    pub message: String,
}

pub struct Client {
    addr: SocketAddr,
    root: PathBuf,
    config: Runtime,
    queue: Arc<EventQueue>,
    watcher: Arc<Watcher>,
}

impl Client {
    pub fn new(root: PathBuf, addr: SocketAddr, config: Runtime) -> Self {
        let watcher = Arc::new(Watcher::new(root.clone(), config.watcher_delay));
        Client { addr, root, config, queue: Arc::new(EventQueue::new()), watcher }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    pub fn watcher(&self) -> Arc<Watcher> {
        self.watcher.clone()
    }

    /// Stop the watcher and close the event queue, unblocking the monitor
    /// loop's next `pop`.
    pub fn stop(&self) {
        self.watcher.stop();
        self.queue.close();
    }

    /// Connect, retrying with the configured backoff until the socket is
    /// up. Mirrors `ClientEngine::connect`'s infinite retry loop.
    pub async fn connect(&self) -> TcpStream {
        loop {
            match TcpStream::connect(self.addr).await {
                Ok(stream) => return stream,
                Err(err) => {
                    warn!("connection to {} failed: {err}, retrying", self.addr);
                    tokio::time::sleep(self.config.reconnect_backoff).await;
                }
            }
        }
    }

    /// One authentication (or signup) attempt over an already-connected
    /// socket. Does not retry or prompt; the caller decides what to do
    /// with a failed attempt.
    pub async fn try_authenticate(&self, stream: &mut TcpStream, creds: &Credentials) -> Result<AuthOutcome, DirsyncError> {
        let frame = if creds.is_new_user {
            SyncFrame::SignUp { user: creds.user.clone(), pass: creds.pass.clone() }
        } else {
            SyncFrame::Authenticate { user: creds.user.clone(), pass: creds.pass.clone() }
        };
        stream.write_all(&encode(&frame)).await.map_err(DirsyncError::from)?;

        let mut reader = FrameReader::new(&mut *stream);
        let bytes = tokio::time::timeout(self.config.frame_read_timeout, reader.read_frame())
            .await
            .map_err(|_| DirsyncError::Transport("authentication response timed out".into()))?
            .map_err(DirsyncError::from)?;
        match decode(&bytes)? {
            SyncFrame::AuthResponse { ok, message } => Ok(AuthOutcome { ok, message }),
            other => Err(DirsyncError::Protocol(format!("expected authentication_response, got {}", other.service_name()))),
        }
    }

    /// Enqueue every existing entry under the root as `Created`, so a
    /// freshly signed-up user's whole tree gets pushed on first connect.
    pub fn seed_existing_tree(&self) {
        for entry in walkdir::WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if entry.path() == self.root {
                continue;
            }
            self.queue.push(FileEvent::new(entry.path().to_path_buf(), ChangeKind::Created));
        }
    }

    /// Pull `queue` events and send them to the server until the queue is
    /// closed. Transport failures trigger a reconnect-and-retry of the same
    /// event. A vanished path resets the connection too (the server may
    /// already be mid-`ReceivingFile` expecting bytes that will never come)
    /// but drops the event instead of retrying it.
    pub async fn run_monitor(&self, mut stream: TcpStream, creds: &Credentials) -> Result<(), DirsyncError> {
        let mut pending: Option<FileEvent> = None;
        loop {
            let event = match pending.take() {
                Some(e) => e,
                None => match self.queue.pop().await {
                    Some(e) => e,
                    None => return Ok(()),
                },
            };

            match self.send_event(&mut stream, &event).await {
                Ok(()) => {}
                Err(err) if err.is_filesystem_race() => {
                    warn!("{} vanished mid-send, resetting connection and dropping", event.rel_path.display());
                    stream = self.reconnect(creds).await;
                }
                Err(err) => {
                    warn!("transport error sending {}: {err}, reconnecting", event.rel_path.display());
                    pending = Some(event);
                    stream = self.reconnect(creds).await;
                }
            }
        }
    }

    /// Reconnect with the given credentials, retrying with the configured
    /// backoff until both the socket and the re-authentication succeed.
    /// Used by the monitor loop after a transport error, and by the
    /// restore/checksync retry loops in the client binary.
    pub async fn reconnect(&self, creds: &Credentials) -> TcpStream {
        loop {
            tokio::time::sleep(self.config.reconnect_backoff).await;
            let mut stream = match TcpStream::connect(self.addr).await {
                Ok(s) => s,
                Err(err) => {
                    warn!("reconnect to {} failed: {err}", self.addr);
                    continue;
                }
            };
            match self.try_authenticate(&mut stream, creds).await {
                Ok(outcome) if outcome.ok => {
                    info!("reconnected and re-authenticated");
                    return stream;
                }
                Ok(outcome) => warn!("reconnect authentication rejected: {}", outcome.message),
                Err(err) => warn!("reconnect authentication error: {err}"),
            }
        }
    }

    /// Send one change event and wait for its ack. `run_monitor` drives this
    /// in a loop; callers that manage their own connection (tests, one-off
    /// pushes) can call it directly.
    pub async fn send_event(&self, stream: &mut TcpStream, event: &FileEvent) -> Result<(), DirsyncError> {
        let abs = &event.rel_path;
        let rel = abs.strip_prefix(&self.root).unwrap_or(abs);
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        let size_code: i64 = match event.kind {
            ChangeKind::Erased => -2,
            _ if abs.is_dir() => -1,
            _ => std::fs::metadata(abs)?.len() as i64,
        };

        stream
            .write_all(&encode(&SyncFrame::Sync { rel_path: rel_str, size_code }))
            .await
            .map_err(DirsyncError::from)?;

        if size_code >= 0 {
            send_file_body(stream, abs, self.config.chunk_size).await?;
        }

        let mut reader = FrameReader::new(&mut *stream);
        let bytes = tokio::time::timeout(self.config.frame_read_timeout, reader.read_frame())
            .await
            .map_err(|_| DirsyncError::Transport("sync ack timed out".into()))?
            .map_err(DirsyncError::from)?;
        match decode(&bytes)? {
            SyncFrame::SyncAck => Ok(()),
            other => Err(DirsyncError::Protocol(format!("expected syncack, got {}", other.service_name()))),
        }
    }

    /// Pull the server's full tree down to `root`, overwriting local
    /// content, retrying the whole transfer until it completes cleanly
    /// (mirrors the original's "retry restore until RestoreEnd").
    pub async fn run_restore(&self, stream: &mut TcpStream) -> Result<(), DirsyncError> {
        stream.write_all(&encode(&SyncFrame::Restore)).await.map_err(DirsyncError::from)?;
        let mut reader = FrameReader::new(&mut *stream);
        loop {
            let bytes = tokio::time::timeout(self.config.restore_read_timeout, reader.read_frame())
                .await
                .map_err(|_| DirsyncError::Transport("restore frame timed out".into()))?
                .map_err(DirsyncError::from)?;
            match decode(&bytes)? {
                SyncFrame::RestoreEnd => return Ok(()),
                SyncFrame::Sync { rel_path, size_code } => {
                    let abs = self.root.join(&rel_path);
                    match size_code {
                        -1 => std::fs::create_dir_all(&abs)?,
                        total if total >= 0 => {
                            if let Some(parent) = abs.parent() {
                                std::fs::create_dir_all(parent)?;
                            }
                            let file = std::fs::File::create(&abs)?;
                            let mut writer = std::io::BufWriter::new(file);
                            tokio::time::timeout(
                                self.config.restore_read_timeout,
                                reader.read_payload(total as u64, self.config.chunk_size, |chunk| {
                                    use std::io::Write;
                                    writer.write_all(chunk)
                                }),
                            )
                            .await
                            .map_err(|_| DirsyncError::Transport("restore payload timed out".into()))?
                            .map_err(DirsyncError::from)?;
                        }
                        _ => {}
                    }
                }
                other => {
                    return Err(DirsyncError::Protocol(format!(
                        "unexpected frame during restore: {}",
                        other.service_name()
                    )))
                }
            }
        }
    }

    /// Reset the local tree to empty before a restore attempt (the
    /// original's `resetFolder`).
    pub fn reset_folder(&self) -> std::io::Result<()> {
        for entry in std::fs::read_dir(&self.root)?.flatten() {
            let path = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Send the local tree as a manifest and return the server-reported
    /// list of paths (relative to the root) that need to be resent.
    pub async fn run_checksync(&self, stream: &mut TcpStream) -> Result<Vec<PathBuf>, DirsyncError> {
        let manifest = build_manifest(&self.root, root_name(&self.root))?;
        stream
            .write_all(&encode(&SyncFrame::CheckSync { manifest }))
            .await
            .map_err(DirsyncError::from)?;

        let mut reader = FrameReader::new(&mut *stream);
        let bytes = tokio::time::timeout(self.config.checksync_timeout, reader.read_frame())
            .await
            .map_err(|_| DirsyncError::Transport("checksync response timed out".into()))?
            .map_err(DirsyncError::from)?;
        match decode(&bytes)? {
            SyncFrame::CheckSyncResponse { missing } => {
                Ok(missing.into_iter().map(PathBuf::from).collect())
            }
            other => Err(DirsyncError::Protocol(format!(
                "expected checksyncresponse, got {}",
                other.service_name()
            ))),
        }
    }
}

fn root_name(root: &Path) -> String {
    root.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| ".".to_string())
}

async fn send_file_body(stream: &mut TcpStream, path: &Path, chunk_size: usize) -> Result<(), DirsyncError> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await.map_err(DirsyncError::from)?;
    }
    Ok(())
}

/// Build the recursive manifest checksync sends: every directory and file
/// under `dir`, files carrying size + content hash.
fn build_manifest(dir: &Path, name: String) -> std::io::Result<ManifestDir> {
    let mut manifest = ManifestDir::empty(name);
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let Some(entry_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if path.is_dir() {
            manifest.directories.push(build_manifest(&path, entry_name)?);
        } else if path.is_file() {
            let size = entry.metadata()?.len();
            let hash = hash_file(&path)?;
            manifest.files.push(ManifestFile { name: entry_name, size, hash });
        }
    }
    Ok(manifest)
}
