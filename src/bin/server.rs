use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;

use dirsync::auth::SqliteCredentialStore;
use dirsync::config::Runtime;
use dirsync::logging;
use dirsync::server::{acceptor, SharedState};

/// dirsync-server: accept client connections and mirror each user's tree
/// under its own subdirectory of `storage_dir`.
#[derive(Parser, Debug)]
#[command(name = "dirsync-server", version, about)]
struct Cli {
    /// Directory user trees are stored under (one subdirectory per user).
    storage_dir: PathBuf,

    /// Port to listen on.
    port: u16,

    /// Directory to write daily rolling logs to, in addition to stderr.
    #[arg(long, env = "DIRSYNC_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_dir.as_deref());

    std::fs::create_dir_all(&cli.storage_dir)?;
    let config = Runtime::from_env();

    let db_path = SqliteCredentialStore::default_path(&cli.storage_dir);
    let credentials = Arc::new(SqliteCredentialStore::open(&db_path)?);

    let state = SharedState::new(cli.storage_dir, config, credentials);
    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await?;

    acceptor::run(listener, state).await?;
    Ok(())
}
