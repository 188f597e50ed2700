//! Per-session outbound plumbing.
//!
//! Each connection owns a writer task that is the only code touching its
//! socket's write half. Everyone else (the session's own handler, peers
//! delivering messages, the transfer watchdog) enqueues onto a bounded
//! channel. Queue full drops the frame with a warning; queue closed means
//! the session is going away.

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use banter_types::wire::ServerFrame;

/// Capacity of the per-session outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// One unit of work for a session's writer task.
pub enum Outbound {
    /// A serialized control frame, written as one line.
    Frame(String),
    /// An inbound file relay: the forwarded `file_transfer_start` line, then
    /// every chunk drained from `payload`, back to back. No other queue item
    /// touches the socket until the payload channel closes, which is what
    /// keeps relayed bytes contiguous on the receiver's wire.
    FileRelay {
        start: String,
        payload: mpsc::Receiver<Bytes>,
    },
}

/// A live session as seen by the rest of the relay: a name and a queue.
#[derive(Clone)]
pub struct SessionHandle {
    pub username: String,
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    pub fn new(username: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self { username, tx }
    }

    /// Queue one control frame. `false` when the queue is full or closed.
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        self.send_line(frame.to_line())
    }

    /// Queue one pre-serialized frame line (no trailing newline).
    pub fn send_line(&self, line: String) -> bool {
        self.enqueue(Outbound::Frame(line))
    }

    /// Hand the writer task a file relay to drain.
    pub fn send_file_relay(&self, start: String, payload: mpsc::Receiver<Bytes>) -> bool {
        self.enqueue(Outbound::FileRelay { start, payload })
    }

    fn enqueue(&self, item: Outbound) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user = %self.username, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(user = %self.username, "outbound queue closed");
                false
            }
        }
    }
}

/// Drain a session's outbound queue into its socket. Exits when the queue
/// closes or a write fails; a failed write means the peer is gone and the
/// connection's read side will observe that shortly.
pub async fn write_outbound(mut socket: OwnedWriteHalf, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        let ok = match item {
            Outbound::Frame(line) => write_line(&mut socket, &line).await,
            Outbound::FileRelay { start, mut payload } => {
                let mut ok = write_line(&mut socket, &start).await;
                while ok {
                    match payload.recv().await {
                        Some(chunk) => ok = socket.write_all(&chunk).await.is_ok(),
                        None => break,
                    }
                }
                ok
            }
        };
        if !ok {
            debug!("session writer stopping: socket write failed");
            break;
        }
    }
}

async fn write_line(socket: &mut OwnedWriteHalf, line: &str) -> bool {
    let mut wire = Vec::with_capacity(line.len() + 1);
    wire.extend_from_slice(line.as_bytes());
    wire.push(b'\n');
    socket.write_all(&wire).await.is_ok()
}
