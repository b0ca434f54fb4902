//! An unbounded, closable MPSC queue of [`FileEvent`]s. Multiple producers
//! (the watcher, the checksync/signup seeding paths), one consumer (the
//! sync loop).
//!
//! Modeled on the original's `Utils::threadqueue`, but exposed as a safe,
//! `Send + Sync`, `close()`-able type that an async consumer can `.await`.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::types::FileEvent;

pub struct EventQueue {
    items: Mutex<VecDeque<FileEvent>>,
    closed: Mutex<bool>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            items: Mutex::new(VecDeque::new()),
            closed: Mutex::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue an event. Non-blocking; wakes one waiting `pop`.
    pub fn push(&self, event: FileEvent) {
        self.items.lock().unwrap().push_back(event);
        self.notify.notify_one();
    }

    /// Wait for an event, or `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<FileEvent> {
        loop {
            // Register as a waiter before checking the condition: a
            // `close()`/`push()` landing between the check and the `.await`
            // below is still observed, instead of being missed.
            let notified = self.notify.notified();
            {
                let mut items = self.items.lock().unwrap();
                if let Some(e) = items.pop_front() {
                    return Some(e);
                }
                if *self.closed.lock().unwrap() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue: wakes all waiters; subsequent `pop`s drain whatever
    /// remains, then return `None`.
    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeKind;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn ev(name: &str) -> FileEvent {
        FileEvent::new(PathBuf::from(name), ChangeKind::Created)
    }

    #[tokio::test]
    async fn push_then_pop_is_fifo() {
        let q = EventQueue::new();
        q.push(ev("a"));
        q.push(ev("b"));
        assert_eq!(q.pop().await.unwrap().rel_path, PathBuf::from("a"));
        assert_eq!(q.pop().await.unwrap().rel_path, PathBuf::from("b"));
    }

    #[tokio::test]
    async fn close_wakes_blocked_pop_with_none() {
        let q = Arc::new(EventQueue::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.close();
        assert!(handle.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_drains_before_returning_none() {
        let q = EventQueue::new();
        q.push(ev("a"));
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }
}
