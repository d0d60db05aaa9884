//! Transport connectors and connections.
//!
//! A connector owns the lifecycle of one transport endpoint (a client's
//! connect loop or a server's accept loop) and produces connections. A
//! connection is one established peer session: a read actor and a write
//! actor exchanging length-framed messages over the underlying socket.

pub mod datagram;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod udp;
#[cfg(unix)]
pub mod unix;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::NetError;
use crate::framer::{Channel, FrameError, Framer};

/// Process-unique connection identifier; never reused within a process.
pub type ConnectionId = u64;

/// Process-unique connector identifier, counted independently.
pub type ConnectorId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn next_connector_id() -> ConnectorId {
    NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Delay before a client connector retries after a failed or lost
/// connection, and before a datagram server rebinds its socket.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Hook receiving every assembled inbound message of a connection.
pub type MsgHook = Arc<dyn Fn(ConnectionId, Vec<u8>, Channel) + Send + Sync>;

/// Hook observing a connection's teardown. Runs at most once per hook.
pub type DisconnectHook = Arc<dyn Fn(ConnectionId, &NetError) + Send + Sync>;

/// Hook a connector invokes for every connection that completed its
/// handshake. Installed by the messenger in `add_connector`.
pub type OnConnectionReady = Arc<dyn Fn(Arc<dyn Connection>) + Send + Sync>;

/// Hook points installed on a connection between construction and start.
///
/// The message slot has a single consumer (the messenger) so the payload
/// can be handed over without a copy; teardown is observed by several
/// parties (messenger, reconnecting client connector, datagram server).
#[derive(Default)]
pub struct Hooks {
    msg: Mutex<Option<MsgHook>>,
    disconnect: Mutex<Vec<DisconnectHook>>,
}

impl Hooks {
    pub fn set_msg(&self, hook: MsgHook) {
        *self.msg.lock() = Some(hook);
    }

    pub fn add_disconnect(&self, hook: DisconnectHook) {
        self.disconnect.lock().push(hook);
    }

    /// Invoke the message hook. The lock is released before the call so
    /// no internal lock is ever held across user code.
    pub(crate) fn emit_msg(&self, id: ConnectionId, payload: Vec<u8>, channel: Channel) {
        let hook = self.msg.lock().clone();
        if let Some(hook) = hook {
            hook(id, payload, channel);
        }
    }

    pub(crate) fn emit_disconnect(&self, id: ConnectionId, err: &NetError) {
        let hooks = self.disconnect.lock().clone();
        for hook in hooks {
            hook(id, err);
        }
    }
}

/// One established peer session carrying framed messages.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn hooks(&self) -> &Hooks;

    /// Launch the read and write actors. Idempotent; a no-op once the
    /// connection has been stopped.
    fn start(self: Arc<Self>);

    /// Initiate teardown. The first caller to flip the connected flag
    /// triggers the single disconnect emission; later calls are no-ops.
    fn stop(&self, err: NetError);

    /// Encode and enqueue a message. Never blocks and never fails; after
    /// teardown the message is silently dropped.
    fn send_msg(&self, payload: Vec<u8>, channel: Channel);
}

/// Factory and lifecycle owner for connections of one transport.
pub trait Connector: Send + Sync {
    fn id(&self) -> ConnectorId;

    /// Install the connection-ready hook. Returns `false` when a hook is
    /// already installed, which marks the connector as registered.
    fn bind_connection_ready(&self, hook: OnConnectionReady) -> bool;

    /// Run the connect/accept loop on the worker pool.
    fn start(self: Arc<Self>);

    /// Halt the connect/accept loop. Connections already handed off are
    /// not touched; the messenger stops those.
    fn stop(&self);
}

/// State shared by every connector implementation: identifier, the
/// connection-ready hook slot and the shutdown signal for its loop task.
pub(crate) struct ConnectorCore {
    id: ConnectorId,
    ready: Mutex<Option<OnConnectionReady>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectorCore {
    pub fn new() -> Self {
        Self {
            id: next_connector_id(),
            ready: Mutex::new(None),
            shutdown_tx: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> ConnectorId {
        self.id
    }

    pub fn bind_ready(&self, hook: OnConnectionReady) -> bool {
        let mut slot = self.ready.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(hook);
        true
    }

    pub fn ready_hook(&self) -> Option<OnConnectionReady> {
        self.ready.lock().clone()
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Feed as many whole framer operations as `data` covers, collecting
/// completed messages. Returns the number of consumed bytes; the caller
/// keeps the remainder for the next receive. Shared by the datagram
/// client drain loop and the datagram server demultiplexer.
pub(crate) fn drain_frames(
    framer: &mut dyn Framer,
    data: &[u8],
    frames: &mut Vec<(Vec<u8>, Channel)>,
) -> Result<usize, FrameError> {
    let mut processed = 0;
    loop {
        let op = framer.next_op();
        if data.len() - processed < op.len {
            break;
        }
        let work = framer.work_buffer();
        work.extend_from_slice(&data[processed..processed + op.len]);
        processed += op.len;
        if framer.advance(op.len)? {
            frames.push(framer.take());
        }
    }
    Ok(processed)
}
