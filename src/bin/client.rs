use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use dirsync::cli::prompt;
use dirsync::client::Client;
use dirsync::config::Runtime;
use dirsync::logging;
use dirsync::types::{ChangeKind, Credentials, FileEvent, StartupMode};

/// dirsync-client: mirror `root_dir` to a per-user directory on a dirsync
/// server, or restore/reconcile it from the server's copy on startup.
#[derive(Parser, Debug)]
#[command(name = "dirsync-client", version, about)]
struct Cli {
    /// Local directory to mirror.
    root_dir: PathBuf,

    /// Server IPv4 address.
    ip: Ipv4Addr,

    /// Server port.
    port: u16,

    /// Directory to write daily rolling logs to, in addition to stderr.
    #[arg(long, env = "DIRSYNC_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_dir.as_deref());

    if !cli.root_dir.is_dir() {
        eprintln!("Directory parameter is not a directory");
        std::process::exit(1);
    }

    let addr = SocketAddr::from((cli.ip, cli.port));
    let config = Runtime::from_env();
    let client = Arc::new(Client::new(cli.root_dir, addr, config));

    let (mut stream, creds) = authenticate_interactively(&client).await;

    if creds.is_new_user {
        client.seed_existing_tree();
    } else {
        let mode = tokio::task::spawn_blocking(prompt::ask_startup_mode).await?;
        match mode {
            StartupMode::Monitor => {
                run_checksync_until_done(&client, &mut stream, &creds).await;
            }
            StartupMode::Restore => {
                run_restore_until_clean(&client, &mut stream, &creds).await;
                return Ok(());
            }
            StartupMode::RestoreThenMonitor => {
                run_restore_until_clean(&client, &mut stream, &creds).await;
                client.watcher().reset_directory();
            }
        }
    }

    let watcher = client.watcher();
    let queue = client.queue();
    let watcher_handle = tokio::spawn(async move { watcher.run(queue).await });

    let sync_client = client.clone();
    let sync_creds = creds.clone();
    let sync_handle = tokio::spawn(async move {
        if let Err(err) = sync_client.run_monitor(stream, &sync_creds).await {
            warn!("sync loop ended: {err}");
        }
    });

    tokio::task::spawn_blocking(prompt::wait_for_exit_command).await?;
    client.stop();
    info!("closing file watcher");
    let _ = watcher_handle.await;
    info!("closing connection");
    let _ = sync_handle.await;
    println!("Execution terminated");

    Ok(())
}

async fn authenticate_interactively(client: &Client) -> (tokio::net::TcpStream, Credentials) {
    loop {
        let creds = tokio::task::spawn_blocking(prompt::ask_credentials).await.expect("prompt task panicked");
        let mut stream = client.connect().await;
        match client.try_authenticate(&mut stream, &creds).await {
            Ok(outcome) => {
                println!("{}", outcome.message);
                if outcome.ok {
                    return (stream, creds);
                }
            }
            Err(err) => warn!("authentication attempt failed: {err}"),
        }
    }
}

/// Restore retries the whole transfer until it completes without a
/// transport error, matching `ClientMain.cpp`'s
/// `while (!client.getRestoreEnded())` loop.
async fn run_restore_until_clean(client: &Arc<Client>, stream: &mut tokio::net::TcpStream, creds: &Credentials) {
    loop {
        if let Err(err) = client.reset_folder() {
            warn!("failed to clear local tree before restore: {err}");
        }
        match client.run_restore(stream).await {
            Ok(()) => return,
            Err(err) => {
                warn!("restore failed: {err}, reconnecting to retry");
                *stream = client.reconnect(creds).await;
            }
        }
    }
}

/// Checksync retries until a response arrives, then seeds the queue with
/// every path the server reported missing (matching
/// `ClientMain.cpp`'s `while (!client.getChecksyncEnded())` loop).
async fn run_checksync_until_done(client: &Arc<Client>, stream: &mut tokio::net::TcpStream, creds: &Credentials) {
    loop {
        match client.run_checksync(stream).await {
            Ok(missing) => {
                for rel in missing {
                    let abs = client.root().join(rel);
                    client.queue().push(FileEvent::new(abs, ChangeKind::Created));
                }
                return;
            }
            Err(err) => {
                warn!("checksync failed: {err}, reconnecting to retry");
                *stream = client.reconnect(creds).await;
            }
        }
    }
}
