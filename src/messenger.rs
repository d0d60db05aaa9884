//! Connector registry and callback dispatcher.
//!
//! The messenger owns every registered connector and every live
//! connection, keyed by their process-unique identifiers. It installs
//! the internal hooks that bridge connector and connection lifecycles to
//! the three user callbacks, and guarantees that no internal lock is
//! held while user code runs: registry lookups clone the `Arc` under the
//! lock and release it before calling out.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::NetError;
use crate::framer::Channel;
use crate::transport::{Connection, ConnectionId, Connector, ConnectorId};

/// Invoked once per connection after it is registered, before any
/// message is delivered.
pub type OnConnect = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// Invoked exactly once per connection, after every message.
pub type OnDisconnect = Arc<dyn Fn(ConnectionId, NetError) + Send + Sync>;

/// Invoked for every inbound message, in wire order per connection.
pub type OnMsg = Arc<dyn Fn(ConnectionId, Vec<u8>, Channel) + Send + Sync>;

struct UserCallbacks {
    on_connect: Option<OnConnect>,
    on_disconnect: Option<OnDisconnect>,
    on_msg: Option<OnMsg>,
}

struct ConnectorRecord {
    connector: Arc<dyn Connector>,
}

struct ConnectionRecord {
    connection: Arc<dyn Connection>,
    connector: ConnectorId,
    /// Liveness of this value is the cheap "still registered" signal the
    /// read path checks through a weak reference, instead of a registry
    /// lookup per message.
    _sentinel: Arc<()>,
}

#[derive(Default)]
struct Registry {
    connectors: HashMap<ConnectorId, ConnectorRecord>,
    connections: HashMap<ConnectionId, ConnectionRecord>,
}

#[derive(Default)]
pub struct Messenger {
    registry: Mutex<Registry>,
}

impl Messenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install the user callbacks, hook the connector's lifecycle into
    /// this messenger, register it and start it. Returns the connector
    /// identifier, or 0 when the connector is already registered.
    pub fn add_connector(
        self: &Arc<Self>,
        connector: Arc<dyn Connector>,
        on_connect: Option<OnConnect>,
        on_disconnect: Option<OnDisconnect>,
        on_msg: Option<OnMsg>,
    ) -> ConnectorId {
        let connector_id = connector.id();
        let callbacks = Arc::new(UserCallbacks {
            on_connect,
            on_disconnect,
            on_msg,
        });
        let messenger = Arc::downgrade(self);
        let installed = connector.bind_connection_ready(Arc::new(move |connection| {
            if let Some(messenger) = messenger.upgrade() {
                messenger.adopt_connection(connection, connector_id, &callbacks);
            }
        }));
        if !installed {
            warn!(connector_id, "connector already registered");
            return 0;
        }
        self.registry.lock().connectors.insert(
            connector_id,
            ConnectorRecord {
                connector: connector.clone(),
            },
        );
        debug!(connector_id, "connector registered");
        connector.start();
        connector_id
    }

    /// Forward a message to a connection. Unknown identifiers are
    /// ignored; the connection may be gone by the time a caller sends.
    pub fn send(&self, id: ConnectionId, msg: Vec<u8>) {
        self.send_on(id, msg, 0);
    }

    /// Like [`send`](Self::send) with an explicit channel tag. Only the
    /// extended framer layout puts the tag on the wire.
    pub fn send_on(&self, id: ConnectionId, msg: Vec<u8>, channel: Channel) {
        let connection = {
            let registry = self.registry.lock();
            registry.connections.get(&id).map(|r| r.connection.clone())
        };
        if let Some(connection) = connection {
            connection.send_msg(msg, channel);
        }
    }

    /// Tear down one connection with `user_triggered_disconnect`.
    pub fn disconnect(&self, id: ConnectionId) {
        self.disconnect_with(id, NetError::UserTriggeredDisconnect);
    }

    /// Remove a connector, halting its accept/connect loop and stopping
    /// every connection it spawned.
    pub fn remove_connector(&self, connector_id: ConnectorId) {
        let (connector, connections) = {
            let mut registry = self.registry.lock();
            let connector = registry
                .connectors
                .remove(&connector_id)
                .map(|record| record.connector);
            let connections: Vec<_> = registry
                .connections
                .values()
                .filter(|record| record.connector == connector_id)
                .map(|record| record.connection.clone())
                .collect();
            (connector, connections)
        };
        if let Some(connector) = connector {
            debug!(connector_id, "connector removed");
            connector.stop();
        }
        for connection in connections {
            connection.stop(NetError::UserTriggeredDisconnect);
        }
    }

    /// Remove all connectors, stopping each and its connections.
    pub fn stop(&self) {
        let connector_ids: Vec<_> = self.registry.lock().connectors.keys().copied().collect();
        for connector_id in connector_ids {
            self.remove_connector(connector_id);
        }
        // Connections whose connector was never registered with us.
        let leftovers: Vec<_> = {
            let registry = self.registry.lock();
            registry
                .connections
                .values()
                .map(|record| record.connection.clone())
                .collect()
        };
        for connection in leftovers {
            connection.stop(NetError::UserTriggeredDisconnect);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        let registry = self.registry.lock();
        registry.connectors.is_empty() && registry.connections.is_empty()
    }

    /// Wire a fresh connection into the registry: disconnect and message
    /// hooks, the connection record with its sentinel, the user
    /// `on_connect`, then start.
    fn adopt_connection(
        self: &Arc<Self>,
        connection: Arc<dyn Connection>,
        connector_id: ConnectorId,
        callbacks: &Arc<UserCallbacks>,
    ) {
        let id = connection.id();
        let sentinel = Arc::new(());

        {
            let messenger = Arc::downgrade(self);
            let callbacks = callbacks.clone();
            connection.hooks().add_disconnect(Arc::new(move |id, err| {
                if let Some(messenger) = messenger.upgrade() {
                    messenger.finish_connection(id, err.clone(), &callbacks);
                }
            }));
        }
        {
            let messenger = Arc::downgrade(self);
            let callbacks = callbacks.clone();
            let sentinel = Arc::downgrade(&sentinel);
            connection.hooks().set_msg(Arc::new(move |id, payload, channel| {
                if sentinel.upgrade().is_none() {
                    return;
                }
                if let Some(messenger) = messenger.upgrade() {
                    messenger.deliver_msg(id, payload, channel, &callbacks);
                }
            }));
        }

        self.registry.lock().connections.insert(
            id,
            ConnectionRecord {
                connection: connection.clone(),
                connector: connector_id,
                _sentinel: sentinel,
            },
        );
        debug!(id, connector_id, "connection registered");

        if let Some(on_connect) = &callbacks.on_connect {
            let cb = on_connect.clone();
            if dispatch(move || cb(id)).is_err() {
                error!(id, "connect callback panicked");
                connection.stop(NetError::DataCorruption);
                self.finish_connection(id, NetError::DataCorruption, callbacks);
                return;
            }
        }
        connection.start();
    }

    fn deliver_msg(
        &self,
        id: ConnectionId,
        payload: Vec<u8>,
        channel: Channel,
        callbacks: &Arc<UserCallbacks>,
    ) {
        let Some(on_msg) = &callbacks.on_msg else {
            return;
        };
        let cb = on_msg.clone();
        if dispatch(move || cb(id, payload, channel)).is_err() {
            error!(id, "message callback panicked");
            self.disconnect_with(id, NetError::DataCorruption);
        }
    }

    /// Drop the record (retiring the sentinel, so late read callbacks
    /// no-op) and emit the user disconnect. The connection's own
    /// connected flag guarantees this runs at most once per connection.
    fn finish_connection(&self, id: ConnectionId, err: NetError, callbacks: &Arc<UserCallbacks>) {
        let removed = self.registry.lock().connections.remove(&id);
        if removed.is_none() {
            return;
        }
        debug!(id, error = %err, "connection record dropped");
        if let Some(on_disconnect) = &callbacks.on_disconnect {
            let cb = on_disconnect.clone();
            if dispatch(move || cb(id, err)).is_err() {
                error!(id, "disconnect callback panicked");
            }
        }
    }

    fn disconnect_with(&self, id: ConnectionId, err: NetError) {
        let connection = {
            let registry = self.registry.lock();
            registry.connections.get(&id).map(|r| r.connection.clone())
        };
        if let Some(connection) = connection {
            connection.stop(err);
        }
    }
}

/// Contain panics from user callbacks at the dispatch boundary.
fn dispatch(f: impl FnOnce()) -> Result<(), ()> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|_| ())
}

type Deleter = Box<dyn FnOnce() + Send>;

static GLOBAL: Lazy<Mutex<Option<Arc<Messenger>>>> = Lazy::new(|| Mutex::new(None));
static DELETERS: Lazy<Mutex<Vec<Deleter>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// The process-wide messenger, created lazily. Its teardown is queued
/// into the global deinit list flushed by [`deinit_messengers`].
pub fn messenger() -> Arc<Messenger> {
    let mut slot = GLOBAL.lock();
    if let Some(existing) = slot.as_ref() {
        return existing.clone();
    }
    let created = Messenger::new();
    DELETERS.lock().push(Box::new(|| {
        // Release the slot lock before stopping; callbacks may re-enter.
        let taken = GLOBAL.lock().take();
        if let Some(messenger) = taken {
            messenger.stop();
        }
    }));
    *slot = Some(created.clone());
    created
}

/// Flush the deinit list: stop and drop every lazily created messenger.
pub fn deinit_messengers() {
    let deleters: Vec<_> = std::mem::take(&mut *DELETERS.lock());
    for deleter in deleters {
        deleter();
    }
}
