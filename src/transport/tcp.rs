//! TCP connectors, plaintext and TLS.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::config::TlsConfig;
use crate::error::NetError;
use crate::framer::FramerOptions;
use crate::service;
use crate::transport::stream::StreamConnection;
use crate::transport::tls::{Security, TlsEngine};
use crate::transport::{
    Connection, Connector, ConnectorCore, ConnectorId, OnConnectionReady, RECONNECT_DELAY,
};

/// Client connector: keeps one connection to `host:port` alive,
/// re-running the connect loop after every failure or loss with a fixed
/// backoff. The loop is a single task, so a reconnect can never race its
/// own teardown.
pub struct TcpClient {
    core: ConnectorCore,
    host: String,
    port: u16,
    security: Security,
    framer: FramerOptions,
    /// Carried for callers layering keepalives; the core does not
    /// generate heartbeat traffic.
    #[allow(dead_code)]
    heartbeat: Duration,
}

impl TcpClient {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        framer: FramerOptions,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectorCore::new(),
            host: host.into(),
            port,
            security: Security::Plain,
            framer,
            heartbeat,
        })
    }

    pub fn with_tls(
        host: impl Into<String>,
        port: u16,
        config: &TlsConfig,
        framer: FramerOptions,
        heartbeat: Duration,
    ) -> Result<Arc<Self>, NetError> {
        let host = host.into();
        let engine = TlsEngine::for_client(config, &host)?;
        Ok(Arc::new(Self {
            core: ConnectorCore::new(),
            host,
            port,
            security: Security::Tls(engine),
            framer,
            heartbeat,
        }))
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.core.shutdown_rx();
        loop {
            if self.core.is_shut_down() {
                return;
            }
            debug!(host = %self.host, port = self.port, "connecting");
            let attempt = tokio::select! {
                result = TcpStream::connect((self.host.as_str(), self.port)) => result,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            };
            let stream = match attempt {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(host = %self.host, port = self.port, error = %err, "connect failed");
                    if !pause(&mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let session = tokio::select! {
                result = self.security.establish(stream) => result,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            };
            let session = match session {
                Ok(session) => session,
                Err(err) => {
                    warn!(host = %self.host, port = self.port, error = %err, "handshake failed");
                    if !pause(&mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            };

            let connection = StreamConnection::new(session, self.framer);
            debug!(id = connection.id(), host = %self.host, port = self.port, "connected");
            let lost = attach_restart_hook(connection.hooks());
            let Some(ready) = self.core.ready_hook() else {
                warn!(id = connection.id(), "no messenger attached, dropping connection");
                return;
            };
            ready(connection);

            tokio::select! {
                _ = lost => {}
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            }
            if !pause(&mut shutdown_rx).await {
                return;
            }
        }
    }
}

impl Connector for TcpClient {
    fn id(&self) -> ConnectorId {
        self.core.id()
    }

    fn bind_connection_ready(&self, hook: OnConnectionReady) -> bool {
        self.core.bind_ready(hook)
    }

    fn start(self: Arc<Self>) {
        service::spawn(self.run());
    }

    fn stop(&self) {
        self.core.shutdown();
    }
}

/// Sleep out the reconnect delay; `false` when the connector was shut
/// down while waiting.
pub(crate) async fn pause(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RECONNECT_DELAY) => true,
        _ = shutdown_rx.wait_for(|stopped| *stopped) => false,
    }
}

/// One-shot hook resolving when the connection tears down, used by
/// client connectors to schedule their restart.
pub(crate) fn attach_restart_hook(hooks: &crate::transport::Hooks) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    hooks.add_disconnect(Arc::new(move |_, _| {
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(());
        }
    }));
    rx
}

/// Server connector: accept loop on a dual-stack listener. Accept and
/// handshake errors are logged and accepting continues; they never tear
/// the server down.
pub struct TcpServer {
    core: ConnectorCore,
    port: u16,
    security: Security,
    framer: FramerOptions,
    #[allow(dead_code)]
    heartbeat: Duration,
}

impl TcpServer {
    pub fn new(port: u16, framer: FramerOptions, heartbeat: Duration) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectorCore::new(),
            port,
            security: Security::Plain,
            framer,
            heartbeat,
        })
    }

    pub fn with_tls(
        port: u16,
        config: &TlsConfig,
        framer: FramerOptions,
        heartbeat: Duration,
    ) -> Result<Arc<Self>, NetError> {
        let engine = TlsEngine::for_server(config)?;
        Ok(Arc::new(Self {
            core: ConnectorCore::new(),
            port,
            security: Security::Tls(engine),
            framer,
            heartbeat,
        }))
    }

    fn bind(&self) -> io::Result<TcpListener> {
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port);
        let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
        // Accept v4-mapped peers on the same listener where the platform
        // allows it.
        let _ = socket.set_only_v6(false);
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        TcpListener::from_std(socket.into())
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.core.shutdown_rx();
        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(err) => {
                warn!(port = self.port, error = %err, "bind failed");
                return;
            }
        };
        debug!(port = self.port, "accepting connections");
        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let server = self.clone();
                    service::spawn(async move { server.establish(stream, peer).await });
                }
                Err(err) => {
                    warn!(port = self.port, error = %err, "accept error");
                }
            }
        }
    }

    async fn establish(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        match self.security.establish(stream).await {
            Ok(session) => {
                let connection = StreamConnection::new(session, self.framer);
                debug!(id = connection.id(), %peer, "connection ready");
                if let Some(ready) = self.core.ready_hook() {
                    ready(connection);
                }
            }
            Err(err) => warn!(%peer, error = %err, "handshake failed"),
        }
    }
}

impl Connector for TcpServer {
    fn id(&self) -> ConnectorId {
        self.core.id()
    }

    fn bind_connection_ready(&self, hook: OnConnectionReady) -> bool {
        self.core.bind_ready(hook)
    }

    fn start(self: Arc<Self>) {
        service::spawn(self.run());
    }

    fn stop(&self) {
        self.core.shutdown();
    }
}
