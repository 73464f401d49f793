use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};

use crate::portrelay::{net, relay, telemetry};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("dial {addr}: timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("dial {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Establishes the outbound half of a connection pair. One attempt, no retry.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<BoxedStream, ConnectError>;
}

pub type SharedConnector = Arc<dyn Connector>;

#[derive(Debug, Clone)]
pub struct TcpConnector {
    dial_timeout: Duration,
}

impl TcpConnector {
    /// A zero `dial_timeout` leaves the timeout to the OS.
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<BoxedStream, ConnectError> {
        let res = if self.dial_timeout > Duration::from_millis(0) {
            match time::timeout(self.dial_timeout, TcpStream::connect(addr)).await {
                Ok(res) => res,
                Err(_) => {
                    return Err(ConnectError::Timeout {
                        addr: addr.to_string(),
                        timeout: self.dial_timeout,
                    });
                }
            }
        } else {
            TcpStream::connect(addr).await
        };

        let c = res.map_err(|source| ConnectError::Io {
            addr: addr.to_string(),
            source,
        })?;
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }
}

/// Everything a forwarding listener needs besides its addresses.
#[derive(Clone)]
pub struct ForwardContext {
    pub connector: SharedConnector,
    pub sessions: telemetry::SharedSessions,
    pub relay: relay::RelayOptions,
}

impl ForwardContext {
    pub fn handler(&self, target: impl Into<String>) -> ForwardHandler {
        ForwardHandler {
            target: Arc::from(target.into()),
            ctx: self.clone(),
        }
    }
}

/// Per-connection handler: dial the fixed target, then relay.
#[derive(Clone)]
pub struct ForwardHandler {
    target: Arc<str>,
    ctx: ForwardContext,
}

impl ForwardHandler {
    pub fn target(&self) -> &str {
        &self.target
    }

    async fn handle(&self, mut conn: TcpStream, peer: SocketAddr) {
        let sid = telemetry::new_session_id();

        let up = match self.ctx.connector.connect(&self.target).await {
            Ok(up) => up,
            Err(err) => {
                tracing::warn!(sid = %sid, client = %peer, target = %self.target, err = %err, "proxy: dial failed");
                let _ = conn.shutdown().await;
                return;
            }
        };

        let _ = conn.set_nodelay(true);
        self.ctx.sessions.add(telemetry::SessionInfo {
            id: sid.clone(),
            client: peer.to_string(),
            target: self.target.to_string(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        });
        tracing::info!(sid = %sid, client = %peer, target = %self.target, "proxy: client connected");

        let stats = relay::relay(conn, up, self.ctx.relay).await;

        self.ctx.sessions.remove(&sid);

        if let Some(err) = &stats.error {
            tracing::debug!(sid = %sid, err = %err, "proxy: relay ended with error");
        }
        tracing::info!(
            sid = %sid,
            client = %peer,
            ingress = stats.ingress,
            egress = stats.egress,
            ended_by = ?stats.ended_by,
            "proxy: client disconnected"
        );
    }
}

pub async fn bind_tcp(listen_addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))
}

/// Bind `listen_addr` and forward every accepted connection to the handler's
/// target until shutdown or until `accept` fails.
pub async fn serve_tcp(
    listen_addr: &str,
    handler: ForwardHandler,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ln = bind_tcp(listen_addr).await?;
    serve_listener(ln, handler, shutdown).await
}

pub async fn serve_listener(
    ln: TcpListener,
    handler: ForwardHandler,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local = ln.local_addr().ok();
    tracing::info!(local = ?local, target = %handler.target(), "proxy: listening");

    while !*shutdown.borrow() {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::error!(local = ?local, err = %err, "proxy: accept failed");
                        return Err(err).context("accept tcp");
                    }
                };
                let h = handler.clone();

                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "proxy: accepted");
                    }
                    h.handle(conn, peer).await;
                });
            }
        }
    }

    tracing::info!(local = ?local, "proxy: listener stopped");
    Ok(())
}
