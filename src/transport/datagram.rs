//! Per-connection actor pair for packetized transports.
//!
//! Same public contract as the stream connection, with datagram
//! peculiarities: writes go out with `send_to` to the peer endpoint
//! captured at construction, and reads drain everything currently
//! available, holding partial frames until more bytes arrive. On the
//! server side the socket is shared and owned by the datagram server;
//! its per-peer connections run no read actor and receive bytes through
//! [`DatagramConnection::feed`] instead.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tracing::{debug, error};

use crate::error::NetError;
use crate::framer::{Channel, FrameError, Framer, FramerOptions};
use crate::service;
use crate::transport::{drain_frames, next_connection_id, Connection, ConnectionId, Hooks};

const MAX_DATAGRAM: usize = 64 * 1024;

pub struct DatagramConnection {
    id: ConnectionId,
    hooks: Hooks,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    connected: AtomicBool,
    started: AtomicBool,
    queue: Mutex<VecDeque<Vec<Bytes>>>,
    queue_ready: Notify,
    shutdown_tx: watch::Sender<bool>,
    framer: Mutex<Box<dyn Framer>>,
    encoder: Box<dyn Framer>,
    /// Client connections own their socket and run a read actor;
    /// server-fed ones are driven by the demultiplexer.
    reads: bool,
}

impl DatagramConnection {
    /// Connection that owns the socket: reads and writes against one
    /// fixed peer.
    pub fn new_client(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        framer: FramerOptions,
    ) -> Arc<Self> {
        Self::build(socket, peer, framer, true)
    }

    /// Per-peer connection behind a datagram server; bytes arrive via
    /// [`feed`](Self::feed).
    pub fn new_server_peer(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        framer: FramerOptions,
    ) -> Arc<Self> {
        Self::build(socket, peer, framer, false)
    }

    fn build(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        framer: FramerOptions,
        reads: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_connection_id(),
            hooks: Hooks::default(),
            socket,
            peer,
            // True until the first stop; set from construction so a
            // teardown racing start still reaches the hooks.
            connected: AtomicBool::new(true),
            started: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queue_ready: Notify::new(),
            shutdown_tx: watch::channel(false).0,
            framer: Mutex::new(framer.build()),
            encoder: framer.build(),
            reads,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Push received bytes through this connection's framer, emitting
    /// every completed message, and report how many bytes were consumed.
    /// Unconsumed bytes belong to a partial frame and stay with the
    /// caller. Messages are emitted after the framer lock is released.
    pub(crate) fn feed(&self, data: &[u8]) -> Result<usize, FrameError> {
        let mut frames = Vec::new();
        let consumed = {
            let mut framer = self.framer.lock();
            drain_frames(framer.as_mut(), data, &mut frames)?
        };
        for (payload, channel) in frames {
            self.hooks.emit_msg(self.id, payload, channel);
        }
        Ok(consumed)
    }

    async fn read_actor(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let ready = tokio::select! {
                result = self.socket.readable() => result,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            };
            if let Err(err) = ready {
                self.stop(NetError::transport(err));
                return;
            }
            // Drain every datagram currently available before suspending
            // again.
            loop {
                match self.socket.try_recv_from(&mut buf) {
                    Ok((n, _from)) => {
                        pending.extend_from_slice(&buf[..n]);
                        match self.feed(&pending) {
                            Ok(consumed) => {
                                pending.drain(..consumed);
                            }
                            Err(err) => {
                                error!(id = self.id, error = %err, "inbound framing failure");
                                self.stop(NetError::DataCorruption);
                                return;
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        self.stop(NetError::transport(err));
                        return;
                    }
                }
            }
        }
    }

    async fn write_actor(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let frame = self.queue.lock().pop_front();
            match frame {
                Some(buffers) => {
                    let result = tokio::select! {
                        result = self.send_frame(&buffers) => result,
                        _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
                    };
                    if let Err(err) = result {
                        self.stop(NetError::transport(err));
                        return;
                    }
                }
                None => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    tokio::select! {
                        _ = self.queue_ready.notified() => {}
                        _ = shutdown_rx.wait_for(|stopped| *stopped) => {}
                    }
                }
            }
        }
    }

    /// One message is one datagram: gather multi-buffer frames before
    /// the send.
    async fn send_frame(&self, buffers: &[Bytes]) -> io::Result<()> {
        if let [single] = buffers {
            self.socket.send_to(single, self.peer).await?;
            return Ok(());
        }
        let total = buffers.iter().map(|b| b.len()).sum();
        let mut datagram = Vec::with_capacity(total);
        for buffer in buffers {
            datagram.extend_from_slice(buffer);
        }
        self.socket.send_to(&datagram, self.peer).await?;
        Ok(())
    }
}

impl Connection for DatagramConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    fn start(self: Arc<Self>) {
        if *self.shutdown_tx.borrow() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.reads {
            let reader = self.clone();
            service::spawn(reader.read_actor());
        }
        let writer = self.clone();
        service::spawn(writer.write_actor());
    }

    fn stop(&self, err: NetError) {
        self.shutdown_tx.send_replace(true);
        self.queue_ready.notify_one();
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(id = self.id, peer = %self.peer, error = %err, "connection stopped");
            self.hooks.emit_disconnect(self.id, &err);
        }
    }

    fn send_msg(&self, payload: Vec<u8>, channel: Channel) {
        if *self.shutdown_tx.borrow() {
            return;
        }
        if payload.len() > u32::MAX as usize {
            error!(id = self.id, len = payload.len(), "payload exceeds framing limit, dropped");
            return;
        }
        let frame = self.encoder.encode(payload, channel);
        self.queue.lock().push_back(frame);
        self.queue_ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn bound_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn round_trip_between_two_clients() {
        let a = bound_socket().await;
        let b = bound_socket().await;
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let left = DatagramConnection::new_client(a, b_addr, FramerOptions::datagram());
        let right = DatagramConnection::new_client(b, a_addr, FramerOptions::datagram());

        let (tx, mut rx) = mpsc::unbounded_channel();
        right.hooks().set_msg(Arc::new(move |_, payload, _| {
            let _ = tx.send(payload);
        }));
        left.clone().start();
        right.clone().start();

        left.send_msg(b"ping".to_vec(), 0);
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, b"ping");
    }

    #[tokio::test]
    async fn feed_holds_partial_frames() {
        let socket = bound_socket().await;
        let peer = socket.local_addr().unwrap();
        let conn = DatagramConnection::new_server_peer(socket, peer, FramerOptions::datagram());

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.hooks().set_msg(Arc::new(move |_, payload, _| {
            let _ = tx.send(payload);
        }));

        let encoder = FramerOptions::datagram().build();
        let mut wire = Vec::new();
        for frame in encoder.encode(b"held".to_vec(), 0) {
            wire.extend_from_slice(&frame);
        }

        // A datagram ending mid-frame is held, not aborted.
        let consumed = conn.feed(&wire[..3]).unwrap();
        assert_eq!(consumed, 0);
        assert!(rx.try_recv().is_err());

        let consumed = conn.feed(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(rx.recv().await.unwrap(), b"held");
    }

    #[tokio::test]
    async fn feed_reports_oversized_frames() {
        let socket = bound_socket().await;
        let peer = socket.local_addr().unwrap();
        let options = FramerOptions {
            max_payload: 16,
            ..FramerOptions::datagram()
        };
        let conn = DatagramConnection::new_server_peer(socket, peer, options);

        let mut wire = Vec::new();
        wire.extend_from_slice(&1024u32.to_le_bytes());
        wire.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            conn.feed(&wire),
            Err(FrameError::OversizedPayload { .. })
        ));
    }
}
