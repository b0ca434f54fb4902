//! Interactive terminal collaborators. Blocking by design (they wrap
//! `std::io::stdin`); the binary entry points run them via
//! `tokio::task::spawn_blocking` so they never occupy an async worker
//! thread while waiting on a human.

pub mod prompt;
