//! UDP connectors: unicast, multicast and broadcast.
//!
//! The server owns a single socket and demultiplexes inbound packets by
//! remote endpoint into per-peer [`DatagramConnection`]s. One reassembly
//! area is kept across receives: a packet's trailing bytes that end
//! mid-frame are compacted to the head of the buffer and completed by
//! later packets. The client side owns its socket and one connection to
//! a fixed peer endpoint.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::framer::FramerOptions;
use crate::service;
use crate::transport::datagram::DatagramConnection;
use crate::transport::tcp::{attach_restart_hook, pause};
use crate::transport::{Connection, Connector, ConnectorCore, ConnectorId, OnConnectionReady};

/// Largest datagram a peer can send us.
const MAX_DATAGRAM: usize = 64 * 1024;
/// Size of the server's reassembly area.
const REASSEMBLY_CAPACITY: usize = 4 * MAX_DATAGRAM;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UdpMode {
    Unicast,
    Multicast,
    Broadcast,
}

fn any_addr(reference: IpAddr, port: u16) -> SocketAddr {
    match reference {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

fn new_socket(reference: IpAddr) -> io::Result<Socket> {
    let domain = match reference {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn join_group(socket: &Socket, group: IpAddr) -> io::Result<()> {
    match group {
        IpAddr::V4(group) => socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(group) => socket.join_multicast_v6(&group, 0),
    }
}

/// Client connector sending to (and receiving from) one fixed endpoint.
/// Restarts with the usual backoff when its connection tears down.
pub struct UdpClient {
    core: ConnectorCore,
    endpoint: SocketAddr,
    mode: UdpMode,
    framer: FramerOptions,
    #[allow(dead_code)]
    heartbeat: Duration,
}

impl UdpClient {
    pub fn unicast(
        addr: IpAddr,
        port: u16,
        framer: FramerOptions,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Self::build(SocketAddr::new(addr, port), UdpMode::Unicast, framer, heartbeat)
    }

    pub fn multicast(
        group: IpAddr,
        port: u16,
        framer: FramerOptions,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Self::build(SocketAddr::new(group, port), UdpMode::Multicast, framer, heartbeat)
    }

    /// IPv4 only; IPv6 superseded broadcast with multicast.
    pub fn broadcast(port: u16, framer: FramerOptions, heartbeat: Duration) -> Arc<Self> {
        Self::build(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
            UdpMode::Broadcast,
            framer,
            heartbeat,
        )
    }

    fn build(
        endpoint: SocketAddr,
        mode: UdpMode,
        framer: FramerOptions,
        heartbeat: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectorCore::new(),
            endpoint,
            mode,
            framer,
            heartbeat,
        })
    }

    fn open_socket(&self) -> io::Result<UdpSocket> {
        let socket = new_socket(self.endpoint.ip())?;
        match self.mode {
            UdpMode::Unicast => {
                socket.bind(&any_addr(self.endpoint.ip(), 0).into())?;
            }
            UdpMode::Multicast => {
                // Group members bind the shared port and join; outbound
                // packets to the group leave the same socket.
                socket.bind(&any_addr(self.endpoint.ip(), self.endpoint.port()).into())?;
                join_group(&socket, self.endpoint.ip())?;
                match self.endpoint.ip() {
                    IpAddr::V4(_) => socket.set_multicast_ttl_v4(5)?,
                    IpAddr::V6(_) => socket.set_multicast_hops_v6(5)?,
                }
            }
            UdpMode::Broadcast => {
                socket.set_broadcast(true)?;
                socket.bind(&any_addr(self.endpoint.ip(), 0).into())?;
            }
        }
        UdpSocket::from_std(socket.into())
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.core.shutdown_rx();
        loop {
            if self.core.is_shut_down() {
                return;
            }
            let socket = match self.open_socket() {
                Ok(socket) => Arc::new(socket),
                Err(err) => {
                    warn!(endpoint = %self.endpoint, error = %err, "socket setup failed");
                    if !pause(&mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            };
            let connection =
                DatagramConnection::new_client(socket, self.endpoint, self.framer);
            debug!(id = connection.id(), endpoint = %self.endpoint, "datagram session ready");

            let lost_rx = attach_restart_hook(connection.hooks());
            let Some(ready) = self.core.ready_hook() else {
                warn!(id = connection.id(), "no messenger attached, dropping connection");
                return;
            };
            ready(connection);

            tokio::select! {
                _ = lost_rx => {}
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            }
            if !pause(&mut shutdown_rx).await {
                return;
            }
        }
    }
}

impl Connector for UdpClient {
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

/// Server connector: one socket, one read actor, a table of per-peer
/// connections keyed by remote endpoint. Receive errors rebind the
/// socket after the usual delay; the peer table starts over.
pub struct UdpServer {
    core: ConnectorCore,
    endpoint: SocketAddr,
    framer: FramerOptions,
    peers: Mutex<HashMap<SocketAddr, Arc<DatagramConnection>>>,
}

impl UdpServer {
    pub fn new(addr: IpAddr, port: u16, framer: FramerOptions) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectorCore::new(),
            endpoint: SocketAddr::new(addr, port),
            framer,
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn open_socket(&self) -> io::Result<UdpSocket> {
        let socket = new_socket(self.endpoint.ip())?;
        socket.bind(&any_addr(self.endpoint.ip(), self.endpoint.port()).into())?;
        if self.endpoint.ip().is_multicast() {
            join_group(&socket, self.endpoint.ip())?;
        }
        UdpSocket::from_std(socket.into())
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.core.shutdown_rx();
        'rebind: loop {
            if self.core.is_shut_down() {
                return;
            }
            self.peers.lock().clear();
            let socket = match self.open_socket() {
                Ok(socket) => Arc::new(socket),
                Err(err) => {
                    warn!(endpoint = %self.endpoint, error = %err, "socket setup failed");
                    if !pause(&mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(endpoint = %self.endpoint, "receiving");

            let mut buf = vec![0u8; REASSEMBLY_CAPACITY];
            // Bytes held at the head of the buffer: the partial frame a
            // previous packet ended with.
            let mut held = 0usize;
            loop {
                if REASSEMBLY_CAPACITY - held < MAX_DATAGRAM {
                    warn!(held, "reassembly area exhausted, dropping held bytes");
                    held = 0;
                }
                let received = tokio::select! {
                    result = socket.recv_from(&mut buf[held..]) => result,
                    _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
                };
                match received {
                    Ok((n, peer)) => {
                        let connection = self.peer_connection(&socket, peer);
                        let total = held + n;
                        match connection.feed(&buf[..total]) {
                            Ok(consumed) => {
                                buf.copy_within(consumed..total, 0);
                                held = total - consumed;
                            }
                            Err(err) => {
                                warn!(%peer, error = %err, "inbound framing failure");
                                connection.stop(NetError::DataCorruption);
                                held = 0;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(endpoint = %self.endpoint, error = %err, "receive error, rebinding");
                        if !pause(&mut shutdown_rx).await {
                            return;
                        }
                        continue 'rebind;
                    }
                }
            }
        }
    }

    /// Look up the connection for `peer`, creating and announcing it on
    /// first contact. The peer's disconnect removes the table entry.
    fn peer_connection(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        peer: SocketAddr,
    ) -> Arc<DatagramConnection> {
        if let Some(connection) = self.peers.lock().get(&peer) {
            return connection.clone();
        }
        let connection = DatagramConnection::new_server_peer(socket.clone(), peer, self.framer);
        debug!(id = connection.id(), %peer, "new datagram peer");
        let server = Arc::downgrade(self);
        connection.hooks().add_disconnect(Arc::new(move |_, _| {
            if let Some(server) = server.upgrade() {
                server.peers.lock().remove(&peer);
                debug!(%peer, "datagram peer removed");
            }
        }));
        self.peers.lock().insert(peer, connection.clone());
        if let Some(ready) = self.core.ready_hook() {
            ready(connection.clone());
        }
        connection
    }
}

impl Connector for UdpServer {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::FramerOptions;

    #[test]
    fn broadcast_targets_the_v4_broadcast_address() {
        let client = UdpClient::broadcast(19999, FramerOptions::datagram(), Duration::ZERO);
        assert_eq!(client.endpoint.ip(), IpAddr::V4(Ipv4Addr::BROADCAST));
        assert_eq!(client.mode, UdpMode::Broadcast);
    }

    #[tokio::test]
    async fn unicast_client_binds_an_ephemeral_port() {
        let client = UdpClient::unicast(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            19998,
            FramerOptions::datagram(),
            Duration::ZERO,
        );
        let socket = client.open_socket().unwrap();
        let local = socket.local_addr().unwrap();
        assert_ne!(local.port(), 0);
        assert_ne!(local.port(), 19998);
    }

    #[tokio::test]
    async fn server_socket_binds_the_requested_port() {
        let server = UdpServer::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            FramerOptions::datagram(),
        );
        let socket = server.open_socket().unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
