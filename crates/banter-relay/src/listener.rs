//! Accept loop and authentication handshake.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use banter_history::HistoryClient;
use banter_types::wire::{AuthReply, ServerFrame};

use crate::auth::{AuthError, AuthVerifier};
use crate::config::RelayConfig;
use crate::connection::ConnectionHandler;
use crate::registry::SessionRegistry;
use crate::session::{OUTBOUND_CAPACITY, SessionHandle, write_outbound};
use crate::transfer::TransferCoordinator;

/// A client gets this long to answer `request_auth`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The auth reply is one small frame; anything bigger is garbage.
const HANDSHAKE_BUFFER: usize = 1024;

/// How often stalled transfers are swept.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

/// The relay server: accepts sockets, authenticates them, and hands each
/// admitted session to a `ConnectionHandler`.
#[derive(Clone)]
pub struct RelayServer {
    config: Arc<RelayConfig>,
    registry: SessionRegistry,
    transfers: TransferCoordinator,
    history: HistoryClient,
    auth: Arc<AuthVerifier>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, history: HistoryClient) -> Self {
        let auth = Arc::new(AuthVerifier::new(&config.jwt_secret));
        Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            transfers: TransferCoordinator::new(),
            history,
            auth,
        }
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("new connection from {addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_socket(stream).await {
                            debug!("connection from {addr} dropped: {e:#}");
                        }
                    });
                }
                Err(e) => error!("accept error: {e}"),
            }
        }
    }

    /// Background sweep that expires transfers which never completed. The
    /// sender's relay loop catches mid-payload stalls itself; this catches
    /// transfers parked waiting for an end frame that never comes.
    pub fn spawn_watchdog(&self) -> tokio::task::JoinHandle<()> {
        let transfers = self.transfers.clone();
        let registry = self.registry.clone();
        let timeout = self.config.file_transfer_timeout;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WATCHDOG_PERIOD);
            loop {
                tick.tick().await;
                for ctx in transfers.expire(timeout) {
                    warn!(
                        "file transfer {} ({} -> {}) timed out",
                        ctx.file_id, ctx.sender, ctx.receiver
                    );
                    let frame = ServerFrame::Error { message: "File transfer timeout".into() };
                    registry.send_to(&ctx.sender, &frame).await;
                    registry.send_to(&ctx.receiver, &frame).await;
                }
            }
        })
    }

    async fn handle_socket(&self, mut stream: TcpStream) -> Result<()> {
        let (username, leftover) = match self.handshake(&mut stream).await? {
            Ok(admitted) => admitted,
            Err(reason) => {
                warn!("handshake rejected: {reason}");
                let frame = ServerFrame::Error { message: reason };
                send_line(&mut stream, &frame.to_line()).await.ok();
                return Ok(());
            }
        };

        // Claim the username atomically; a live duplicate is refused.
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = SessionHandle::new(username.clone(), tx);
        if self.registry.register(handle.clone()).await.is_err() {
            warn!("rejected duplicate login for {username}");
            let frame = ServerFrame::Error { message: "Username already taken".into() };
            send_line(&mut stream, &frame.to_line()).await.ok();
            return Ok(());
        }
        info!("{username} logged in");

        let (reader, writer) = stream.into_split();
        let writer_task = tokio::spawn(write_outbound(writer, rx));

        handle.send_frame(&ServerFrame::System {
            message: format!("Welcome to the server, {username}!"),
        });
        self.registry
            .broadcast(
                &ServerFrame::System { message: format!("{username} joined the chat") },
                Some(&username),
            )
            .await;
        self.registry.broadcast_user_list().await;

        let handler = ConnectionHandler::new(
            username,
            reader,
            leftover,
            handle,
            self.registry.clone(),
            self.transfers.clone(),
            self.history.clone(),
            self.config.clone(),
        );
        handler.run().await;

        writer_task.abort();
        Ok(())
    }

    /// Run the token exchange. `Ok(Err(reason))` is a protocol-level
    /// rejection that still gets an `error` frame; `Err(_)` is a dead socket.
    async fn handshake(
        &self,
        stream: &mut TcpStream,
    ) -> Result<std::result::Result<(String, BytesMut), String>> {
        send_line(stream, &ServerFrame::RequestAuth.to_line()).await?;

        let read_reply = async {
            let mut buf = BytesMut::with_capacity(HANDSHAKE_BUFFER);
            loop {
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let mut line = buf.split_to(pos + 1);
                    line.truncate(line.len() - 1);
                    return std::io::Result::Ok(Some((line, buf)));
                }
                if buf.len() >= HANDSHAKE_BUFFER {
                    return Ok(None);
                }
                let room = HANDSHAKE_BUFFER - buf.len();
                let mut limited = (&mut buf).limit(room);
                let n = stream.read_buf(&mut limited).await?;
                if n == 0 {
                    return Ok(None);
                }
            }
        };
        let (line, leftover) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_reply).await {
            Ok(Ok(Some(reply))) => reply,
            // EOF before a newline, or an oversized preamble.
            Ok(Ok(None)) => return Ok(Err(AuthError::MissingToken.to_string())),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(Err("Authentication timed out".into())),
        };

        let reply: AuthReply = match serde_json::from_slice(&line) {
            Ok(reply) => reply,
            Err(_) => return Ok(Err("Invalid message format".into())),
        };
        let Some(token) = reply.token.filter(|t| !t.is_empty()) else {
            return Ok(Err(AuthError::MissingToken.to_string()));
        };
        match self.auth.verify(&token) {
            Ok(username) => Ok(Ok((username, leftover))),
            Err(e) => Ok(Err(e.to_string())),
        }
    }
}

async fn send_line(stream: &mut TcpStream, line: &str) -> std::io::Result<()> {
    let mut wire = Vec::with_capacity(line.len() + 1);
    wire.extend_from_slice(line.as_bytes());
    wire.push(b'\n');
    stream.write_all(&wire).await
}
