//! Per-connection state machine.
//!
//! A handler owns the read half of one authenticated socket and a byte
//! buffer. In frame mode the buffer is scanned for newline-delimited JSON
//! control frames; a `file_transfer_start` switches the handler into relay
//! mode, where exactly the declared number of payload bytes are pumped to
//! the receiver's writer before frame parsing resumes on whatever bytes the
//! sender concatenated after the payload.

use std::sync::Arc;

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use banter_history::HistoryClient;
use banter_types::api::SaveMessageRequest;
use banter_types::wire::{ClientFrame, ServerFrame};

use crate::config::RelayConfig;
use crate::registry::SessionRegistry;
use crate::session::SessionHandle;
use crate::transfer::{TransferContext, TransferCoordinator};

/// Payload chunks that may sit between the relay loop and the receiver's
/// writer before the sender is backpressured.
const RELAY_CHANNEL_CAPACITY: usize = 32;

/// Cap on rows returned for one `request_history` frame.
const HISTORY_LIMIT: u32 = 100;

/// Why a relay stopped before the declared payload completed.
#[derive(Debug, Error)]
enum RelayError {
    #[error("File transfer timeout")]
    Timeout,
    #[error("receiver connection lost")]
    ReceiverLost,
    #[error("sender closed mid-transfer")]
    SenderClosed,
    #[error(transparent)]
    Read(#[from] std::io::Error),
}

/// A transfer this handler drove as the sender, waiting for its end frame.
struct ActiveTransfer {
    ctx: Arc<TransferContext>,
    receiver: SessionHandle,
}

pub struct ConnectionHandler {
    username: String,
    reader: OwnedReadHalf,
    buffer: BytesMut,
    session: SessionHandle,
    registry: SessionRegistry,
    transfers: TransferCoordinator,
    history: HistoryClient,
    config: Arc<RelayConfig>,
    active: Option<ActiveTransfer>,
}

impl ConnectionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        username: String,
        reader: OwnedReadHalf,
        leftover: BytesMut,
        session: SessionHandle,
        registry: SessionRegistry,
        transfers: TransferCoordinator,
        history: HistoryClient,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            username,
            reader,
            buffer: leftover,
            session,
            registry,
            transfers,
            history,
            config,
            active: None,
        }
    }

    /// Drive the connection until EOF or a fatal error, then clean up.
    pub async fn run(mut self) {
        match self.read_loop().await {
            Ok(()) => info!("{} connection closed", self.username),
            Err(e) => debug!("{} connection ended: {e:#}", self.username),
        }
        self.shutdown().await;
    }

    async fn read_loop(&mut self) -> Result<()> {
        loop {
            self.drain_frames().await?;
            // drain_frames left no complete line behind; a buffer this big
            // means one frame is never going to terminate.
            if self.buffer.len() > self.config.max_message_size * 2 {
                warn!("{} overflowed the frame buffer, clearing", self.username);
                self.buffer.clear();
                self.send_error("Message too large, buffer cleared");
            }
            let n = self.read_chunk().await?;
            if n == 0 {
                return Ok(());
            }
        }
    }

    /// Read up to `buffer_size` more bytes into the frame buffer.
    async fn read_chunk(&mut self) -> std::io::Result<usize> {
        read_limited(&mut self.reader, &mut self.buffer, self.config.buffer_size).await
    }

    /// Parse and dispatch every complete line currently buffered.
    async fn drain_frames(&mut self) -> Result<()> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(line.len() - 1);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.config.max_message_size {
                warn!("{} sent an oversized frame ({} bytes)", self.username, line.len());
                self.send_error(&format!(
                    "Message too large (max {} bytes)",
                    self.config.max_message_size
                ));
                continue;
            }
            self.dispatch(&line).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, line: &[u8]) -> Result<()> {
        let frame: ClientFrame = match serde_json::from_slice(line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{} sent an undecodable frame: {e}", self.username);
                self.send_error("Invalid message format");
                return Ok(());
            }
        };
        match frame {
            ClientFrame::Group { message, encrypted_data, timestamp } => {
                self.on_group(message, encrypted_data, timestamp).await
            }
            ClientFrame::Dm { to, message, encrypted_data, timestamp } => {
                self.on_dm(to, message, encrypted_data, timestamp).await
            }
            ClientFrame::FileTransferStart { file_id, file_name, file_size, receiver } => {
                self.on_file_start(file_id, file_name, file_size, receiver, line).await
            }
            ClientFrame::FileTransferEnd { file_id, .. } => self.on_file_end(file_id, line).await,
            ClientFrame::RequestUsers => {
                self.registry.broadcast_user_list().await;
                Ok(())
            }
            ClientFrame::RequestHistory { chat_with } => self.on_request_history(chat_with).await,
            ClientFrame::RequestChats => self.on_request_chats().await,
            ClientFrame::Typing { to } => self.on_typing(to).await,
        }
    }

    async fn on_group(
        &mut self,
        message: String,
        encrypted_data: Option<Value>,
        timestamp: Option<Value>,
    ) -> Result<()> {
        if message.is_empty() || message.len() > self.config.max_message_size {
            self.send_error("Invalid message");
            return Ok(());
        }
        self.persist(SaveMessageRequest::new(
            &self.username,
            "group",
            &message,
            "group",
            encrypted_data.as_ref(),
        ));
        debug!("group message from {}", self.username);
        let frame = ServerFrame::Group {
            from: self.username.clone(),
            message,
            encrypted_data,
            timestamp,
        };
        self.registry.broadcast(&frame, Some(&self.username)).await;
        Ok(())
    }

    async fn on_dm(
        &mut self,
        to: Option<String>,
        message: String,
        encrypted_data: Option<Value>,
        timestamp: Option<Value>,
    ) -> Result<()> {
        let Some(recipient) = to.filter(|t| !t.is_empty()) else {
            self.send_error("Invalid message or recipient");
            return Ok(());
        };
        if message.is_empty() || message.len() > self.config.max_message_size {
            self.send_error("Invalid message or recipient");
            return Ok(());
        }
        self.persist(SaveMessageRequest::new(
            &self.username,
            &recipient,
            &message,
            "dm",
            encrypted_data.as_ref(),
        ));
        let delivery = ServerFrame::Dm {
            from: self.username.clone(),
            to: None,
            message: message.clone(),
            sent: None,
            encrypted_data: encrypted_data.clone(),
            timestamp: timestamp.clone(),
        };
        if self.registry.send_to(&recipient, &delivery).await {
            debug!("dm {} -> {}", self.username, recipient);
            self.send_frame(ServerFrame::Dm {
                from: self.username.clone(),
                to: Some(recipient),
                message,
                sent: Some(true),
                encrypted_data,
                timestamp,
            });
        } else {
            self.send_error(&format!("User {recipient} not found or offline"));
        }
        Ok(())
    }

    async fn on_request_history(&mut self, chat_with: Option<String>) -> Result<()> {
        let Some(chat_with) = chat_with.filter(|c| !c.is_empty()) else {
            self.send_error("Invalid history request");
            return Ok(());
        };
        match self.history.message_history(&self.username, &chat_with, HISTORY_LIMIT).await {
            Ok(messages) => {
                info!("sent {} history rows to {} for {}", messages.len(), self.username, chat_with);
                self.send_frame(ServerFrame::History { chat_with, messages });
            }
            Err(e) => {
                warn!("history fetch for {} failed: {e}", self.username);
                self.send_error("Failed to fetch history");
            }
        }
        Ok(())
    }

    async fn on_request_chats(&mut self) -> Result<()> {
        match self.history.chat_list(&self.username).await {
            Ok(chats) => self.send_frame(ServerFrame::ChatList { chats }),
            Err(e) => {
                warn!("chat list fetch for {} failed: {e}", self.username);
                self.send_error("Failed to fetch chat list");
            }
        }
        Ok(())
    }

    async fn on_typing(&mut self, to: Option<String>) -> Result<()> {
        // Typing indicators are best-effort; malformed ones are dropped.
        let Some(to) = to.filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        let frame = ServerFrame::Typing { from: self.username.clone(), to: to.clone() };
        if to == "group" {
            self.registry.broadcast(&frame, Some(&self.username)).await;
        } else {
            self.registry.send_to(&to, &frame).await;
        }
        Ok(())
    }

    // ── File relay ────────────────────────────────────────────────────

    async fn on_file_start(
        &mut self,
        file_id: Option<String>,
        file_name: Option<String>,
        file_size: Option<u64>,
        receiver: Option<String>,
        line: &[u8],
    ) -> Result<()> {
        let Some(file_id) = file_id.filter(|id| !id.is_empty()) else {
            self.send_error("Invalid file transfer request");
            return Ok(());
        };
        let Some(receiver) = receiver.filter(|r| !r.is_empty()) else {
            self.send_error("Invalid file transfer request");
            return Ok(());
        };
        let Some(file_size) = file_size else {
            self.send_error("Invalid file size");
            return Ok(());
        };
        let file_name = file_name.unwrap_or_default();
        info!(
            "{} wants to send '{}' ({} bytes) to {}",
            self.username, file_name, file_size, receiver
        );

        let Ok(ctx) =
            self.transfers.try_reserve(&self.username, &receiver, &file_id, &file_name, file_size)
        else {
            self.send_error("File transfer already in progress");
            return Ok(());
        };
        let Some(handle) = self.registry.lookup(&receiver).await else {
            self.transfers.release(&ctx);
            self.send_error(&format!("{receiver} is offline. Cannot send file."));
            return Ok(());
        };

        // Forward the start frame verbatim, bundled with the payload stream
        // so nothing can interleave between the two on the receiver's wire.
        let (payload_tx, payload_rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let start = String::from_utf8_lossy(line).into_owned();
        if !handle.send_file_relay(start, payload_rx) {
            self.transfers.release(&ctx);
            self.send_error(&format!("Failed to reach {receiver}"));
            return Ok(());
        }

        match self.relay_payload(&ctx, payload_tx).await {
            Ok(()) => {
                info!(
                    "relayed '{}' ({} bytes) {} -> {}",
                    ctx.file_name,
                    ctx.relayed(),
                    self.username,
                    receiver
                );
                self.active = Some(ActiveTransfer { ctx, receiver: handle });
                Ok(())
            }
            Err(RelayError::Timeout) => {
                warn!("file transfer {} from {} timed out", file_id, self.username);
                self.transfers.release(&ctx);
                self.send_error("File transfer timeout");
                handle.send_frame(&ServerFrame::Error { message: "File transfer timeout".into() });
                Ok(())
            }
            Err(RelayError::ReceiverLost) => {
                warn!("receiver {} vanished mid-transfer {}", receiver, file_id);
                self.transfers.release(&ctx);
                self.send_error(&format!("Failed to reach {receiver}"));
                Ok(())
            }
            Err(e) => {
                // The sender's own socket failed; its exit path tells the
                // receiver.
                self.transfers.release(&ctx);
                handle.send_frame(&ServerFrame::Error {
                    message: "Sender disconnected during file transfer".into(),
                });
                Err(e.into())
            }
        }
    }

    /// Pump exactly `ctx.file_size` bytes from this socket into the
    /// receiver's payload channel. Bytes past the declared size stay in the
    /// frame buffer for normal parsing.
    async fn relay_payload(
        &mut self,
        ctx: &Arc<TransferContext>,
        payload_tx: mpsc::Sender<Bytes>,
    ) -> Result<(), RelayError> {
        let deadline = ctx.started_at + self.config.file_transfer_timeout;
        while ctx.relayed() < ctx.file_size {
            if self.buffer.is_empty() {
                let read = read_limited(&mut self.reader, &mut self.buffer, self.config.buffer_size);
                let n = tokio::time::timeout_at(deadline, read)
                    .await
                    .map_err(|_| RelayError::Timeout)??;
                if n == 0 {
                    return Err(RelayError::SenderClosed);
                }
            }
            let remaining = ctx.file_size - ctx.relayed();
            let take = (self.buffer.len() as u64).min(remaining) as usize;
            let chunk = self.buffer.split_to(take).freeze();
            tokio::time::timeout_at(deadline, payload_tx.send(chunk))
                .await
                .map_err(|_| RelayError::Timeout)?
                .map_err(|_| RelayError::ReceiverLost)?;
            ctx.add_relayed(take as u64);
        }
        Ok(())
    }

    async fn on_file_end(&mut self, file_id: Option<String>, line: &[u8]) -> Result<()> {
        let matches = self
            .active
            .as_ref()
            .is_some_and(|active| Some(active.ctx.file_id.as_str()) == file_id.as_deref());
        if !matches {
            warn!("{} sent file_transfer_end for unknown id {:?}", self.username, file_id);
            return Ok(());
        }
        if let Some(active) = self.active.take() {
            if !active.receiver.send_line(String::from_utf8_lossy(line).into_owned()) {
                debug!("could not forward end frame to {}", active.receiver.username);
            }
            self.transfers.release(&active.ctx);
            info!("file transfer {} completed", active.ctx.file_id);
        }
        Ok(())
    }

    // ── Plumbing ──────────────────────────────────────────────────────

    /// Save a message through the history service without blocking the
    /// session on it.
    fn persist(&self, message: SaveMessageRequest) {
        let history = self.history.clone();
        tokio::spawn(async move {
            if let Err(e) = history.save_message(&message).await {
                warn!("failed to persist message: {e}");
            }
        });
    }

    fn send_frame(&self, frame: ServerFrame) {
        self.session.send_frame(&frame);
    }

    fn send_error(&self, message: &str) {
        self.send_frame(ServerFrame::Error { message: message.into() });
    }

    /// Exit cleanup: release any transfer referencing this user, tell the
    /// counterpart, then announce the departure.
    async fn shutdown(&mut self) {
        self.active = None;
        if let Some(ctx) = self.transfers.release_for(&self.username) {
            let peer = ctx.counterpart(&self.username).to_string();
            warn!(
                "releasing transfer {} on {}'s disconnect",
                ctx.file_id, self.username
            );
            let message = if ctx.sender == self.username {
                "Sender disconnected during file transfer"
            } else {
                "Receiver disconnected during file transfer"
            };
            self.registry
                .send_to(&peer, &ServerFrame::Error { message: message.into() })
                .await;
        }
        self.registry.remove(&self.username).await;
        info!("{} disconnected", self.username);
        self.registry
            .broadcast(
                &ServerFrame::System { message: format!("{} left the chat", self.username) },
                None,
            )
            .await;
        self.registry.broadcast_user_list().await;
    }
}

/// Read up to `cap` bytes into `buffer`.
async fn read_limited(
    reader: &mut OwnedReadHalf,
    buffer: &mut BytesMut,
    cap: usize,
) -> std::io::Result<usize> {
    let mut limited = buffer.limit(cap);
    reader.read_buf(&mut limited).await
}
