//! UNIX-domain stream connectors, plaintext and TLS.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::config::TlsConfig;
use crate::error::NetError;
use crate::framer::FramerOptions;
use crate::service;
use crate::transport::stream::StreamConnection;
use crate::transport::tcp::{attach_restart_hook, pause};
use crate::transport::tls::{Security, TlsEngine};
use crate::transport::{Connection, Connector, ConnectorCore, ConnectorId, OnConnectionReady};

/// Client connector for a filesystem socket path; reconnects with the
/// same fixed backoff as the TCP client.
pub struct UnixClient {
    core: ConnectorCore,
    path: PathBuf,
    security: Security,
    framer: FramerOptions,
}

impl UnixClient {
    pub fn new(path: impl Into<PathBuf>, framer: FramerOptions) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectorCore::new(),
            path: path.into(),
            security: Security::Plain,
            framer,
        })
    }

    pub fn with_tls(
        path: impl Into<PathBuf>,
        config: &TlsConfig,
        framer: FramerOptions,
    ) -> Result<Arc<Self>, NetError> {
        // There is no DNS name on a filesystem path; the certificate is
        // checked against "localhost".
        let engine = TlsEngine::for_client(config, "localhost")?;
        Ok(Arc::new(Self {
            core: ConnectorCore::new(),
            path: path.into(),
            security: Security::Tls(engine),
            framer,
        }))
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.core.shutdown_rx();
        loop {
            if self.core.is_shut_down() {
                return;
            }
            debug!(path = %self.path.display(), "connecting");
            let attempt = tokio::select! {
                result = UnixStream::connect(&self.path) => result,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            };
            let stream = match attempt {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(path = %self.path.display(), error = %err, "connect failed");
                    if !pause(&mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            };

            let session = tokio::select! {
                result = self.security.establish(stream) => result,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            };
            let session = match session {
                Ok(session) => session,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "handshake failed");
                    if !pause(&mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            };

            let connection = StreamConnection::new(session, self.framer);
            debug!(id = connection.id(), path = %self.path.display(), "connected");
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

impl Connector for UnixClient {
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

/// Server connector bound to a filesystem socket path. The server owns
/// the socket file: a stale file is removed before bind and the file is
/// unlinked again when the server goes away.
pub struct UnixServer {
    core: ConnectorCore,
    path: PathBuf,
    security: Security,
    framer: FramerOptions,
}

impl UnixServer {
    pub fn new(path: impl Into<PathBuf>, framer: FramerOptions) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectorCore::new(),
            path: path.into(),
            security: Security::Plain,
            framer,
        })
    }

    pub fn with_tls(
        path: impl Into<PathBuf>,
        config: &TlsConfig,
        framer: FramerOptions,
    ) -> Result<Arc<Self>, NetError> {
        let engine = TlsEngine::for_server(config)?;
        Ok(Arc::new(Self {
            core: ConnectorCore::new(),
            path: path.into(),
            security: Security::Tls(engine),
            framer,
        }))
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.core.shutdown_rx();
        cleanup_socket_file(&self.path);
        let listener = match UnixListener::bind(&self.path) {
            Ok(listener) => listener,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "bind failed");
                return;
            }
        };
        debug!(path = %self.path.display(), "accepting connections");
        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            };
            match accepted {
                Ok((stream, _addr)) => {
                    let server = self.clone();
                    service::spawn(async move { server.establish(stream).await });
                }
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "accept error");
                }
            }
        }
    }

    async fn establish(self: Arc<Self>, stream: UnixStream) {
        match self.security.establish(stream).await {
            Ok(session) => {
                let connection = StreamConnection::new(session, self.framer);
                debug!(id = connection.id(), path = %self.path.display(), "connection ready");
                if let Some(ready) = self.core.ready_hook() {
                    ready(connection);
                }
            }
            Err(err) => warn!(path = %self.path.display(), error = %err, "handshake failed"),
        }
    }
}

impl Connector for UnixServer {
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

impl Drop for UnixServer {
    fn drop(&mut self) {
        cleanup_socket_file(&self.path);
    }
}

fn cleanup_socket_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "cannot remove socket file");
        }
    }
}
