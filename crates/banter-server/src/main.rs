use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use banter_history::HistoryClient;
use banter_relay::config::RelayConfig;
use banter_relay::listener::RelayServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "banter=debug".into()),
        )
        .init();

    // Config -- the shared JWT secret is MANDATORY
    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e}");
            eprintln!("       The relay verifies tokens issued by the auth service;");
            eprintln!("       both must read the same JWT_SECRET_KEY.");
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let history = HistoryClient::new(config.db_api_url.clone(), config.db_api_timeout)?;

    info!("chat relay listening on {addr}");
    info!("history API: {}", config.db_api_url);
    info!(
        "buffer size: {} bytes, max message size: {} bytes, transfer timeout: {}s",
        config.buffer_size,
        config.max_message_size,
        config.file_transfer_timeout.as_secs()
    );

    // Create the listener via socket2 for address reuse, TCP_NODELAY, and a
    // custom backlog.
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(socket.into())?;

    let server = RelayServer::new(config, history);
    let watchdog = server.spawn_watchdog();

    tokio::select! {
        _ = server.run(listener) => {},
        _ = shutdown_signal() => {},
    }
    watchdog.abort();

    Ok(())
}

/// Listen for Ctrl+C / SIGTERM to trigger shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
