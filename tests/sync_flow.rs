//! End-to-end client/server flows over a loopback socket: signup push,
//! duplicate login rejection, full restore, and checksync reconciliation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use dirsync::auth::SqliteCredentialStore;
use dirsync::client::Client;
use dirsync::config::Runtime;
use dirsync::server::{acceptor, SharedState};
use dirsync::types::{ChangeKind, Credentials, FileEvent};

async fn start_server(storage_dir: PathBuf) -> SocketAddr {
    let db_path = storage_dir.join("users.sqlite");
    let credentials = Arc::new(SqliteCredentialStore::open(&db_path).unwrap());
    let mut config = Runtime::from_env();
    config.watcher_delay = Duration::from_millis(20);
    let state = SharedState::new(storage_dir, config, credentials);
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = acceptor::run(listener, state).await;
    });
    addr
}

fn test_config() -> Runtime {
    let mut c = Runtime::default();
    c.reconnect_backoff = Duration::from_millis(20);
    c
}

#[tokio::test]
async fn signup_push_creates_file_on_server() {
    let storage = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let addr = start_server(storage.path().to_path_buf()).await;

    let client = Client::new(local.path().to_path_buf(), addr, test_config());
    let creds = Credentials { user: "alice".into(), pass: "hunter2".into(), is_new_user: true };

    let mut stream = client.connect().await;
    let outcome = client.try_authenticate(&mut stream, &creds).await.unwrap();
    assert!(outcome.ok, "{}", outcome.message);

    std::fs::write(local.path().join("a.txt"), b"hello world").unwrap();
    let event = FileEvent::new(local.path().join("a.txt"), ChangeKind::Created);
    client.send_event(&mut stream, &event).await.unwrap();

    let remote_file = storage.path().join("alice").join("a.txt");
    assert_eq!(std::fs::read(remote_file).unwrap(), b"hello world");
}

#[tokio::test]
async fn duplicate_login_is_rejected() {
    let storage = tempfile::tempdir().unwrap();
    let addr = start_server(storage.path().to_path_buf()).await;

    let local1 = tempfile::tempdir().unwrap();
    let client1 = Client::new(local1.path().to_path_buf(), addr, test_config());
    let creds = Credentials { user: "bob".into(), pass: "pw".into(), is_new_user: true };
    let mut stream1 = client1.connect().await;
    let outcome1 = client1.try_authenticate(&mut stream1, &creds).await.unwrap();
    assert!(outcome1.ok);

    let local2 = tempfile::tempdir().unwrap();
    let client2 = Client::new(local2.path().to_path_buf(), addr, test_config());
    let login = Credentials { user: "bob".into(), pass: "pw".into(), is_new_user: false };
    let mut stream2 = client2.connect().await;
    let outcome2 = client2.try_authenticate(&mut stream2, &login).await.unwrap();
    assert!(!outcome2.ok);
}

#[tokio::test]
async fn restore_pulls_full_remote_tree() {
    let storage = tempfile::tempdir().unwrap();
    let addr = start_server(storage.path().to_path_buf()).await;

    let seed_dir = tempfile::tempdir().unwrap();
    let seeder = Client::new(seed_dir.path().to_path_buf(), addr, test_config());
    let creds = Credentials { user: "carol".into(), pass: "pw".into(), is_new_user: true };
    let mut seed_stream = seeder.connect().await;
    let outcome = seeder.try_authenticate(&mut seed_stream, &creds).await.unwrap();
    assert!(outcome.ok);
    std::fs::write(seed_dir.path().join("one.txt"), b"one").unwrap();
    std::fs::create_dir(seed_dir.path().join("sub")).unwrap();
    std::fs::write(seed_dir.path().join("sub").join("two.txt"), b"two").unwrap();
    let one = FileEvent::new(seed_dir.path().join("one.txt"), ChangeKind::Created);
    seeder.send_event(&mut seed_stream, &one).await.unwrap();
    let two = FileEvent::new(seed_dir.path().join("sub").join("two.txt"), ChangeKind::Created);
    seeder.send_event(&mut seed_stream, &two).await.unwrap();

    let restore_dir = tempfile::tempdir().unwrap();
    let restorer = Client::new(restore_dir.path().to_path_buf(), addr, test_config());
    let login = Credentials { user: "carol".into(), pass: "pw".into(), is_new_user: false };
    let mut restore_stream = restorer.connect().await;
    let outcome = restorer.try_authenticate(&mut restore_stream, &login).await.unwrap();
    assert!(outcome.ok);
    restorer.run_restore(&mut restore_stream).await.unwrap();

    assert_eq!(std::fs::read(restore_dir.path().join("one.txt")).unwrap(), b"one");
    assert_eq!(std::fs::read(restore_dir.path().join("sub").join("two.txt")).unwrap(), b"two");
}

#[tokio::test]
async fn checksync_reports_and_corrects_divergence() {
    let storage = tempfile::tempdir().unwrap();
    let addr = start_server(storage.path().to_path_buf()).await;

    let local = tempfile::tempdir().unwrap();
    let client = Client::new(local.path().to_path_buf(), addr, test_config());
    let creds = Credentials { user: "dave".into(), pass: "pw".into(), is_new_user: true };
    let mut stream = client.connect().await;
    let outcome = client.try_authenticate(&mut stream, &creds).await.unwrap();
    assert!(outcome.ok);

    std::fs::write(local.path().join("keep.txt"), b"same").unwrap();
    std::fs::write(local.path().join("stale.txt"), b"v2").unwrap();
    let keep = FileEvent::new(local.path().join("keep.txt"), ChangeKind::Created);
    client.send_event(&mut stream, &keep).await.unwrap();
    let stale = FileEvent::new(local.path().join("stale.txt"), ChangeKind::Created);
    client.send_event(&mut stream, &stale).await.unwrap();

    // diverge the server's copy of stale.txt behind the client's back
    std::fs::write(storage.path().join("dave").join("stale.txt"), b"v1-server-side").unwrap();

    let missing = client.run_checksync(&mut stream).await.unwrap();
    let names: Vec<String> = missing.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    assert!(names.iter().any(|n| n.contains("stale.txt")), "{names:?}");
    assert!(!names.iter().any(|n| n.contains("keep.txt")), "{names:?}");
}
