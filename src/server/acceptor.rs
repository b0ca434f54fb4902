//! The accept loop. One task per connection, capped by
//! `SharedState::connection_count` against `config.connection_limit`.
//!
//! Grounded on `ServerEngine.cpp`'s `runServer`, which accepts forever and
//! spawns a worker thread per client, refusing new sockets past a fixed
//! pool size.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::{connection, SharedState};

pub async fn run(listener: TcpListener, state: Arc<SharedState>) -> std::io::Result<()> {
    info!("accepting connections on {}", listener.local_addr()?);
    loop {
        let (socket, peer) = listener.accept().await?;

        let current = state.connection_count.load(Ordering::SeqCst);
        if current >= state.config.connection_limit {
            warn!("connection limit ({}) reached, dropping {peer}", state.config.connection_limit);
            drop(socket);
            continue;
        }
        state.connection_count.fetch_add(1, Ordering::SeqCst);
        info!("accepted {peer}");

        let state = state.clone();
        tokio::spawn(async move {
            connection::handle(socket, state.clone()).await;
            state.connection_count.fetch_sub(1, Ordering::SeqCst);
        });
    }
}
