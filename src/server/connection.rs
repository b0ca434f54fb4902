//! Per-socket connection state machine.
//!
//! `Accepted → Authenticated → ReceivingFile → Authenticated`, matching
//! the original's per-client loop in `ServerEngine.cpp`'s `clientSession`,
//! with `restore`/`checksync` realized as a background task the main loop
//! awaits before reading its next frame rather than the original's `-4`
//! sentinel-return trick.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::codec::{decode, encode, FrameReader, SyncFrame};
use crate::error::DirsyncError;
use crate::reconcile::explore_dir;
use crate::server::SharedState;
use crate::types::{validate_rel_path, ManifestDir};

pub struct Connection {
    state: Arc<SharedState>,
    reader: FrameReader<OwnedReadHalf>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    username: Option<String>,
    root: Option<PathBuf>,
}

/// Accept one socket's worth of protocol: authenticate, then serve frames
/// until the connection errors out or the peer disconnects.
pub async fn handle(socket: TcpStream, state: Arc<SharedState>) {
    let peer = socket.peer_addr().ok();
    let (read_half, write_half) = socket.into_split();
    let mut conn = Connection {
        state: state.clone(),
        reader: FrameReader::new(read_half),
        writer: Arc::new(Mutex::new(write_half)),
        username: None,
        root: None,
    };

    if let Err(err) = conn.run().await {
        warn!("connection {peer:?} ended: {err}");
    }

    if let Some(user) = conn.username.take() {
        state.connected_users.lock().await.remove(&user);
        info!("{user} disconnected");
    }
}

impl Connection {
    async fn run(&mut self) -> Result<(), DirsyncError> {
        self.authenticate_or_signup().await?;
        loop {
            let timeout = self.state.config.server_read_timeout;
            let frame_bytes = match tokio::time::timeout(timeout, self.reader.read_frame()).await {
                Ok(read) => read.map_err(DirsyncError::from)?,
                Err(_) => return Err(DirsyncError::Transport("no frame within the read deadline".into())),
            };
            let frame = decode(&frame_bytes)?;
            self.dispatch(frame).await?;
        }
    }

    async fn send(&self, frame: &SyncFrame) -> Result<(), DirsyncError> {
        let bytes = encode(frame);
        let mut w = self.writer.lock().await;
        w.write_all(&bytes).await.map_err(DirsyncError::from)
    }

    async fn authenticate_or_signup(&mut self) -> Result<(), DirsyncError> {
        let frame_bytes = self.reader.read_frame().await.map_err(DirsyncError::from)?;
        match decode(&frame_bytes)? {
            SyncFrame::Authenticate { user, pass } => self.handle_login(user, pass).await,
            SyncFrame::SignUp { user, pass } => self.handle_signup(user, pass).await,
            other => {
                self.send(&SyncFrame::AuthResponse {
                    ok: false,
                    message: "expected authentication or signup".into(),
                })
                .await?;
                Err(DirsyncError::Protocol(format!(
                    "expected authentication, got {}",
                    other.service_name()
                )))
            }
        }
    }

    async fn handle_login(&mut self, user: String, pass: String) -> Result<(), DirsyncError> {
        let ok = self.state.credentials.authenticate(&user, &pass).await?;
        if !ok {
            self.send(&SyncFrame::AuthResponse { ok: false, message: "invalid credentials".into() })
                .await?;
            return Err(DirsyncError::Auth(format!("invalid credentials for {user}")));
        }

        {
            let mut connected = self.state.connected_users.lock().await;
            if connected.contains(&user) {
                self.send(&SyncFrame::AuthResponse {
                    ok: false,
                    message: "user already connected".into(),
                })
                .await?;
                return Err(DirsyncError::Auth(format!("{user} already has a live connection")));
            }
            connected.insert(user.clone());
        }

        let root = self.state.user_root(&user);
        if !root.exists() {
            warn!("root directory for {user} missing on disk, recreating");
            std::fs::create_dir_all(&root)?;
        }
        self.username = Some(user.clone());
        self.root = Some(root);
        self.send(&SyncFrame::AuthResponse { ok: true, message: "welcome back".into() }).await?;
        info!("{user} logged in");
        Ok(())
    }

    async fn handle_signup(&mut self, user: String, pass: String) -> Result<(), DirsyncError> {
        let created = self.state.credentials.register(&user, &pass).await?;
        if !created {
            self.send(&SyncFrame::AuthResponse { ok: false, message: "username already taken".into() })
                .await?;
            return Err(DirsyncError::Auth(format!("{user} already registered")));
        }

        let root = self.state.user_root(&user);
        std::fs::create_dir_all(&root)?;
        self.state.connected_users.lock().await.insert(user.clone());
        self.username = Some(user.clone());
        self.root = Some(root);
        self.send(&SyncFrame::AuthResponse { ok: true, message: "registered".into() }).await?;
        info!("{user} registered and logged in");
        Ok(())
    }

    async fn dispatch(&mut self, frame: SyncFrame) -> Result<(), DirsyncError> {
        let root = self
            .root
            .clone()
            .ok_or_else(|| DirsyncError::Protocol("frame received before authentication".into()))?;
        match frame {
            SyncFrame::Sync { rel_path, size_code } => self.handle_sync(&root, rel_path, size_code).await,
            SyncFrame::CheckSync { manifest } => self.handle_checksync(&root, manifest).await,
            SyncFrame::Restore => self.handle_restore(&root).await,
            other => Err(DirsyncError::Protocol(format!(
                "frame not valid in the authenticated state: {}",
                other.service_name()
            ))),
        }
    }

    async fn handle_sync(&mut self, root: &Path, rel_path: String, size_code: i64) -> Result<(), DirsyncError> {
        let rel = validate_rel_path(&rel_path)
            .ok_or_else(|| DirsyncError::Protocol(format!("unsafe path in sync frame: {rel_path}")))?;
        let abs = root.join(&rel);

        match size_code {
            -2 => {
                if abs.is_dir() {
                    let _ = std::fs::remove_dir_all(&abs);
                } else {
                    let _ = std::fs::remove_file(&abs);
                }
            }
            -1 => {
                std::fs::create_dir_all(&abs)?;
            }
            total if total >= 0 => {
                if let Some(parent) = abs.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = std::fs::File::create(&abs)?;
                let mut writer = std::io::BufWriter::new(file);
                let chunk_size = self.state.config.chunk_size;
                let timeout = self.state.config.server_read_timeout;
                tokio::time::timeout(
                    timeout,
                    self.reader.read_payload(total as u64, chunk_size, |chunk| {
                        use std::io::Write;
                        writer.write_all(chunk)
                    }),
                )
                .await
                .map_err(|_| DirsyncError::Transport("sync payload timed out".into()))?
                .map_err(DirsyncError::from)?;
            }
            _ => unreachable!("i64 is either -2, -1, or >= 0"),
        }

        self.send(&SyncFrame::SyncAck).await?;
        Ok(())
    }

    async fn handle_checksync(&mut self, root: &Path, manifest: ManifestDir) -> Result<(), DirsyncError> {
        let root = root.to_path_buf();
        let timeout = self.state.config.checksync_timeout;
        let join = tokio::task::spawn_blocking(move || {
            let mut missing = Vec::new();
            explore_dir(&root, &manifest, &mut missing, true);
            (root, missing)
        });
        let (root, missing) = tokio::time::timeout(timeout, join)
            .await
            .map_err(|_| DirsyncError::Transport("checksync exceeded its deadline".into()))?
            .map_err(|e| DirsyncError::Transport(format!("checksync task panicked: {e}")))?;

        let missing: Vec<String> = missing
            .into_iter()
            .filter_map(|p| p.strip_prefix(&root).ok().map(|r| r.to_string_lossy().replace('\\', "/")))
            .collect();
        self.send(&SyncFrame::CheckSyncResponse { missing }).await?;
        Ok(())
    }

    async fn handle_restore(&mut self, root: &Path) -> Result<(), DirsyncError> {
        run_restore(root, &self.writer, self.state.config.chunk_size).await
    }
}

/// C4.5.1: stream the entire tree rooted at `root` to the client as a
/// sequence of `Sync` frames (directories first, as `-1`, then files with
/// their byte payload), terminated by `RestoreEnd`.
async fn run_restore(root: &Path, writer: &Arc<Mutex<OwnedWriteHalf>>, chunk_size: usize) -> Result<(), DirsyncError> {
    let mut entries: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path() != root)
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in entries {
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| DirsyncError::Protocol("restore entry escaped its root".into()))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            write_frame(writer, &SyncFrame::Sync { rel_path: rel_str, size_code: -1 }).await?;
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        write_frame(writer, &SyncFrame::Sync { rel_path: rel_str, size_code: size as i64 }).await?;
        let data = std::fs::read(entry.path())?;
        let mut w = writer.lock().await;
        w.write_all(&data).await.map_err(DirsyncError::from)?;
    }

    write_frame(writer, &SyncFrame::RestoreEnd).await
}

async fn write_frame(writer: &Arc<Mutex<OwnedWriteHalf>>, frame: &SyncFrame) -> Result<(), DirsyncError> {
    let bytes = encode(frame);
    let mut w = writer.lock().await;
    w.write_all(&bytes).await.map_err(DirsyncError::from)
}
