//! WebSocket server implementation
//!
//! Accepts TCP connections, upgrades them, identifies the user from the
//! `user` query parameter and hands each registered connection to its
//! handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::form_urlencoded;

use super::connection::Connection;
use super::handler;
use super::registry::{Registry, DEFAULT_WRITE_TIMEOUT};

/// Query parameter carrying the user id on the upgrade request
pub const USER_QUERY_PARAM: &str = "user";

/// How long shutdown waits for connection handlers to unwind
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server id, attached to every log line of the accept loop
    pub id: String,
    /// host:port to listen on
    pub listen: String,
    /// Bound on a single write to one recipient
    pub write_timeout: Duration,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(id: impl Into<String>, listen: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            listen: listen.into(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Address to bind. A bare `:port` listens on all interfaces.
    pub fn listen_addr(&self) -> String {
        match self.listen.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => self.listen.clone(),
        }
    }

    /// Set the per-recipient write timeout
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

/// Chat relay serving one room on one listen address
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Arc::new(Registry::new(config.write_timeout)),
            config,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Trigger server shutdown. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    ///
    /// On shutdown every live connection is closed once and the handlers are
    /// given a short grace period to deregister.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let span = info_span!("relay", server_id = %self.config.id);
        self.accept_loop(listener).instrument(span).await
    }

    async fn accept_loop(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Relay listening on ws://{}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            handlers.spawn(
                                async move {
                                    if let Err(e) = handle_connection(stream, peer_addr, registry).await {
                                        error!("Connection error from {}: {:#}", peer_addr, e);
                                    }
                                }
                                .in_current_span(),
                            );
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }
        drop(listener);

        self.registry.shutdown().await;

        if !handlers.is_empty() {
            info!("Waiting for {} connections to close...", handlers.len());
        }
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("{} connections did not close in time, aborting", handlers.len());
            handlers.abort_all();
        }

        info!("Relay stopped");
        Ok(())
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
}

/// Upgrade, identify, register and run a single connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let mut user = None;
    let identify = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match user_from_query(request.uri().query()) {
            Some(id) => {
                user = Some(id);
                Ok(response)
            }
            None => {
                warn!("Rejecting {}: no user id in request {}", peer_addr, request.uri());
                Err(missing_user_response())
            }
        }
    };
    let ws_stream = accept_hdr_async(stream, identify)
        .await
        .with_context(|| format!("websocket upgrade from {} failed", peer_addr))?;
    let user = user.context("upgrade accepted without a user id")?;

    let (sink, frames) = ws_stream.split();
    let conn = Connection::new(user.clone(), sink);

    if let Some(old) = registry.add_user(&user, Arc::clone(&conn)).await {
        old.close().await;
        info!("User {} already connected, kicked off old connection", user);
    }
    if registry.is_shut_down() {
        // registered after shutdown swept the registry
        conn.close().await;
    }
    info!("User {} upgraded to websocket from {}", user, peer_addr);

    handler::run(user, conn, frames, registry).await;
    Ok(())
}

/// Extract a non-empty user id from a request query string
///
/// The value is form-decoded; when `user` repeats, the first one counts.
pub fn user_from_query(query: Option<&str>) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == USER_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn missing_user_response() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!(
        "missing '{}' query parameter",
        USER_QUERY_PARAM
    )));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}
