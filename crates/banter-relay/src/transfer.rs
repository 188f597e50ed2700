//! Cross-connection coordination of file transfers.
//!
//! A transfer locks both participants: the sender may not start a second
//! send and the receiver may not be targeted by another sender until the
//! active context is released. Release happens on completion, timeout, error
//! or either side's disconnect, and is idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Live record of one in-flight file relay between two users.
#[derive(Debug)]
pub struct TransferContext {
    /// Relay-internal identity; `file_id` is client-supplied and opaque.
    pub id: Uuid,
    pub file_id: String,
    pub sender: String,
    pub receiver: String,
    pub file_name: String,
    pub file_size: u64,
    bytes_relayed: AtomicU64,
    pub started_at: Instant,
}

impl TransferContext {
    pub fn add_relayed(&self, n: u64) {
        self.bytes_relayed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    /// The username on the other end of this transfer from `user`.
    pub fn counterpart(&self, user: &str) -> &str {
        if self.sender == user { &self.receiver } else { &self.sender }
    }
}

/// `file_transfer_start` refused because a participant is already locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("File transfer already in progress")]
pub struct TransferConflict;

#[derive(Default)]
struct Reservations {
    sending: HashMap<String, Arc<TransferContext>>,
    receiving: HashMap<String, Arc<TransferContext>>,
}

/// Tracks active transfers and holds the per-user reservations.
#[derive(Clone, Default)]
pub struct TransferCoordinator {
    inner: Arc<Mutex<Reservations>>,
}

impl TransferCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve both participants and create the context, atomically. Refused
    /// while either participant is referenced by any active transfer, in
    /// either role.
    pub fn try_reserve(
        &self,
        sender: &str,
        receiver: &str,
        file_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> Result<Arc<TransferContext>, TransferConflict> {
        let mut r = self.inner.lock().unwrap();
        if r.sending.contains_key(sender)
            || r.receiving.contains_key(sender)
            || r.sending.contains_key(receiver)
            || r.receiving.contains_key(receiver)
        {
            return Err(TransferConflict);
        }
        let ctx = Arc::new(TransferContext {
            id: Uuid::new_v4(),
            file_id: file_id.to_owned(),
            sender: sender.to_owned(),
            receiver: receiver.to_owned(),
            file_name: file_name.to_owned(),
            file_size,
            bytes_relayed: AtomicU64::new(0),
            started_at: Instant::now(),
        });
        r.sending.insert(sender.to_owned(), ctx.clone());
        r.receiving.insert(receiver.to_owned(), ctx.clone());
        Ok(ctx)
    }

    /// Drop both reservations held by `ctx`. Safe to call more than once and
    /// never touches a newer context that reused a participant.
    pub fn release(&self, ctx: &Arc<TransferContext>) {
        let mut r = self.inner.lock().unwrap();
        release_entry(&mut r.sending, &ctx.sender, ctx);
        release_entry(&mut r.receiving, &ctx.receiver, ctx);
    }

    /// Release whatever transfer references `user`, if any, and return it so
    /// the caller can notify the counterpart. Used on disconnect.
    pub fn release_for(&self, user: &str) -> Option<Arc<TransferContext>> {
        let mut r = self.inner.lock().unwrap();
        let ctx = r
            .sending
            .get(user)
            .cloned()
            .or_else(|| r.receiving.get(user).cloned())?;
        release_entry(&mut r.sending, &ctx.sender, &ctx);
        release_entry(&mut r.receiving, &ctx.receiver, &ctx);
        Some(ctx)
    }

    /// The transfer currently referencing `user`, in either role.
    pub fn active_for(&self, user: &str) -> Option<Arc<TransferContext>> {
        let r = self.inner.lock().unwrap();
        r.sending
            .get(user)
            .cloned()
            .or_else(|| r.receiving.get(user).cloned())
    }

    /// Remove and return every context older than `timeout`. The watchdog
    /// calls this periodically and notifies both parties of each eviction.
    pub fn expire(&self, timeout: Duration) -> Vec<Arc<TransferContext>> {
        let mut r = self.inner.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<Arc<TransferContext>> = r
            .sending
            .values()
            .filter(|ctx| now.duration_since(ctx.started_at) > timeout)
            .cloned()
            .collect();
        for ctx in &expired {
            release_entry(&mut r.sending, &ctx.sender, ctx);
            release_entry(&mut r.receiving, &ctx.receiver, ctx);
        }
        expired
    }
}

fn release_entry(
    map: &mut HashMap<String, Arc<TransferContext>>,
    key: &str,
    ctx: &Arc<TransferContext>,
) {
    if map.get(key).is_some_and(|held| Arc::ptr_eq(held, ctx)) {
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserve(c: &TransferCoordinator, s: &str, r: &str, id: &str) -> Arc<TransferContext> {
        c.try_reserve(s, r, id, "file.bin", 128).unwrap()
    }

    #[test]
    fn locks_both_participants_in_both_roles() {
        let coordinator = TransferCoordinator::new();
        let _f1 = reserve(&coordinator, "alice", "bob", "F1");

        // Same pair, either direction.
        assert!(matches!(coordinator.try_reserve("alice", "bob", "F2", "x", 1), Err(TransferConflict)));
        assert!(matches!(coordinator.try_reserve("bob", "alice", "F2", "x", 1), Err(TransferConflict)));
        // Third parties may not touch a locked participant in any role.
        assert!(matches!(coordinator.try_reserve("carol", "bob", "F2", "x", 1), Err(TransferConflict)));
        assert!(matches!(coordinator.try_reserve("alice", "carol", "F2", "x", 1), Err(TransferConflict)));
        assert!(matches!(coordinator.try_reserve("carol", "alice", "F2", "x", 1), Err(TransferConflict)));
        // An unrelated pair is fine.
        assert!(coordinator.try_reserve("carol", "dave", "F2", "x", 1).is_ok());
    }

    #[test]
    fn release_frees_both_reservations() {
        let coordinator = TransferCoordinator::new();
        let f1 = reserve(&coordinator, "alice", "bob", "F1");
        coordinator.release(&f1);
        assert!(coordinator.active_for("alice").is_none());
        assert!(coordinator.active_for("bob").is_none());
        assert!(coordinator.try_reserve("alice", "bob", "F2", "x", 1).is_ok());
    }

    #[test]
    fn release_is_idempotent_and_identity_checked() {
        let coordinator = TransferCoordinator::new();
        let f1 = reserve(&coordinator, "alice", "bob", "F1");
        coordinator.release(&f1);
        coordinator.release(&f1);

        // A stale handle must not evict the transfer that replaced it.
        let f2 = reserve(&coordinator, "alice", "bob", "F2");
        coordinator.release(&f1);
        assert!(coordinator.active_for("alice").is_some());
        coordinator.release(&f2);
        assert!(coordinator.active_for("alice").is_none());
    }

    #[test]
    fn release_for_returns_the_context_for_either_role() {
        let coordinator = TransferCoordinator::new();
        let f1 = reserve(&coordinator, "alice", "bob", "F1");
        let released = coordinator.release_for("bob").unwrap();
        assert!(Arc::ptr_eq(&f1, &released));
        assert_eq!(released.counterpart("bob"), "alice");
        assert!(coordinator.release_for("alice").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_evicts_only_stale_contexts() {
        let coordinator = TransferCoordinator::new();
        let old = reserve(&coordinator, "alice", "bob", "F1");

        tokio::time::advance(Duration::from_secs(200)).await;
        let fresh = reserve(&coordinator, "carol", "dave", "F2");

        tokio::time::advance(Duration::from_secs(150)).await;
        let expired = coordinator.expire(Duration::from_secs(300));
        assert_eq!(expired.len(), 1);
        assert!(Arc::ptr_eq(&expired[0], &old));

        assert!(coordinator.active_for("alice").is_none());
        assert!(coordinator.active_for("carol").is_some());
        coordinator.release(&fresh);
    }

    #[test]
    fn relayed_byte_count_is_monotonic() {
        let coordinator = TransferCoordinator::new();
        let ctx = reserve(&coordinator, "alice", "bob", "F1");
        assert_eq!(ctx.relayed(), 0);
        ctx.add_relayed(100);
        ctx.add_relayed(28);
        assert_eq!(ctx.relayed(), 128);
    }
}
