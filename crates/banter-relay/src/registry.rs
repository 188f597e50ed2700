//! The set of online sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use banter_types::wire::ServerFrame;

use crate::session::SessionHandle;

/// Returned when a second live session tries to claim a taken username.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateUsername;

/// Thread-safe mapping from username to live session. All sends performed
/// under the lock are non-blocking queue pushes; socket I/O never happens
/// while the lock is held.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert atomically; a second session with the same name is refused.
    pub async fn register(&self, handle: SessionHandle) -> Result<(), DuplicateUsername> {
        let mut sessions = self.inner.write().await;
        if sessions.contains_key(&handle.username) {
            return Err(DuplicateUsername);
        }
        sessions.insert(handle.username.clone(), handle);
        Ok(())
    }

    pub async fn remove(&self, username: &str) {
        self.inner.write().await.remove(username);
    }

    pub async fn lookup(&self, username: &str) -> Option<SessionHandle> {
        self.inner.read().await.get(username).cloned()
    }

    /// Sorted snapshot of everyone online.
    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queue a frame for one user. `false` when the user is offline or their
    /// queue would not take the frame.
    pub async fn send_to(&self, username: &str, frame: &ServerFrame) -> bool {
        let sessions = self.inner.read().await;
        match sessions.get(username) {
            Some(handle) => handle.send_frame(frame),
            None => false,
        }
    }

    /// Queue a frame for every session except `exclude`. Sessions whose queue
    /// is closed are skipped; their own handlers run the cleanup.
    pub async fn broadcast(&self, frame: &ServerFrame, exclude: Option<&str>) {
        let line = frame.to_line();
        let sessions = self.inner.read().await;
        for (name, handle) in sessions.iter() {
            if Some(name.as_str()) == exclude {
                continue;
            }
            if !handle.send_line(line.clone()) {
                debug!(user = %name, "broadcast skipped a session");
            }
        }
    }

    /// Broadcast the current user list to everyone.
    pub async fn broadcast_user_list(&self) {
        let users = self.usernames().await;
        debug!(?users, "broadcasting user list");
        self.broadcast(&ServerFrame::UserList { users }, None).await;
    }
}
