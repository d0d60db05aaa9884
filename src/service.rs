//! Process-wide worker pool and connector factories.
//!
//! [`init_services`] builds the runtime every connector and connection
//! task runs on; [`deinit_services`] stops it and joins the workers.
//! Code already running inside a tokio runtime (tests, embedding
//! applications) can skip `init_services`: spawns fall back to the
//! ambient runtime.

use std::future::Future;
use std::net::IpAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, error, warn};

use crate::config::{ServiceConfig, TlsConfig};
use crate::error::NetError;
use crate::framer::FramerOptions;
use crate::transport::tcp::{TcpClient, TcpServer};
use crate::transport::udp::{UdpClient, UdpServer};
#[cfg(unix)]
use crate::transport::unix::{UnixClient, UnixServer};
use crate::transport::Connector;

static RUNTIME: Lazy<Mutex<Option<Runtime>>> = Lazy::new(|| Mutex::new(None));

/// Create the worker pool. A second call is a warning and a no-op.
pub fn init_services(config: ServiceConfig) -> Result<(), NetError> {
    let mut slot = RUNTIME.lock();
    if slot.is_some() {
        warn!("services already initialized");
        return Ok(());
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.worker_threads(config.workers.max(1)).enable_all();
    match config.thread_namer {
        Some(namer) => {
            let counter = AtomicUsize::new(0);
            builder.thread_name_fn(move || namer(counter.fetch_add(1, Ordering::Relaxed)));
        }
        None => {
            builder.thread_name("msglink-worker");
        }
    }
    let runtime = builder.build().map_err(NetError::transport)?;
    debug!(workers = config.workers, "services initialized");
    *slot = Some(runtime);
    Ok(())
}

/// Stop the worker pool and join the workers. In-flight tasks get a
/// bounded grace period.
pub fn deinit_services() {
    let runtime = RUNTIME.lock().take();
    if let Some(runtime) = runtime {
        runtime.shutdown_timeout(Duration::from_secs(5));
        debug!("services deinitialized");
    }
}

/// Spawn onto the service runtime, or onto the ambient tokio runtime
/// when `init_services` has not been called.
pub(crate) fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Some(runtime) = RUNTIME.lock().as_ref() {
        runtime.spawn(future);
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => error!("no runtime available; call init_services() first"),
    }
}

// Connector factories. The `_with` variants expose framing options and
// the heartbeat interval carried through to the connection constructors;
// the plain ones use the defaults.

pub fn create_tcp_server(port: u16) -> Arc<dyn Connector> {
    create_tcp_server_with(port, FramerOptions::default(), Duration::ZERO)
}

pub fn create_tcp_server_with(
    port: u16,
    framer: FramerOptions,
    heartbeat: Duration,
) -> Arc<dyn Connector> {
    TcpServer::new(port, framer, heartbeat)
}

pub fn create_tcp_client(host: impl Into<String>, port: u16) -> Arc<dyn Connector> {
    create_tcp_client_with(host, port, FramerOptions::default(), Duration::ZERO)
}

pub fn create_tcp_client_with(
    host: impl Into<String>,
    port: u16,
    framer: FramerOptions,
    heartbeat: Duration,
) -> Arc<dyn Connector> {
    TcpClient::new(host, port, framer, heartbeat)
}

pub fn create_tcp_ssl_server(
    port: u16,
    config: &TlsConfig,
) -> Result<Arc<dyn Connector>, NetError> {
    TcpServer::with_tls(port, config, FramerOptions::default(), Duration::ZERO)
        .map(|server| server as Arc<dyn Connector>)
}

pub fn create_tcp_ssl_client(
    host: impl Into<String>,
    port: u16,
    config: &TlsConfig,
) -> Result<Arc<dyn Connector>, NetError> {
    TcpClient::with_tls(host, port, config, FramerOptions::default(), Duration::ZERO)
        .map(|client| client as Arc<dyn Connector>)
}

#[cfg(unix)]
pub fn create_unix_server(path: impl Into<PathBuf>) -> Arc<dyn Connector> {
    UnixServer::new(path, FramerOptions::default())
}

#[cfg(unix)]
pub fn create_unix_client(path: impl Into<PathBuf>) -> Arc<dyn Connector> {
    UnixClient::new(path, FramerOptions::default())
}

#[cfg(unix)]
pub fn create_unix_ssl_server(
    path: impl Into<PathBuf>,
    config: &TlsConfig,
) -> Result<Arc<dyn Connector>, NetError> {
    UnixServer::with_tls(path, config, FramerOptions::default())
        .map(|server| server as Arc<dyn Connector>)
}

#[cfg(unix)]
pub fn create_unix_ssl_client(
    path: impl Into<PathBuf>,
    config: &TlsConfig,
) -> Result<Arc<dyn Connector>, NetError> {
    UnixClient::with_tls(path, config, FramerOptions::default())
        .map(|client| client as Arc<dyn Connector>)
}

pub fn create_udp_unicast_server(addr: IpAddr, port: u16) -> Arc<dyn Connector> {
    UdpServer::new(addr, port, FramerOptions::datagram())
}

pub fn create_udp_unicast_client(addr: IpAddr, port: u16) -> Arc<dyn Connector> {
    UdpClient::unicast(addr, port, FramerOptions::datagram(), Duration::ZERO)
}

pub fn create_udp_multicast_server(group: IpAddr, port: u16) -> Arc<dyn Connector> {
    UdpServer::new(group, port, FramerOptions::datagram())
}

pub fn create_udp_multicast_client(group: IpAddr, port: u16) -> Arc<dyn Connector> {
    UdpClient::multicast(group, port, FramerOptions::datagram(), Duration::ZERO)
}

/// Broadcast receivers bind the given port on the v4 unspecified
/// address.
pub fn create_udp_broadcast_server(port: u16) -> Arc<dyn Connector> {
    UdpServer::new(
        IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        port,
        FramerOptions::datagram(),
    )
}

pub fn create_udp_broadcast_client(port: u16) -> Arc<dyn Connector> {
    UdpClient::broadcast(port, FramerOptions::datagram(), Duration::ZERO)
}
