//! # msglink
//!
//! A message-oriented networking library. Connectors (servers or
//! clients) over TCP, TLS, UNIX-domain stream sockets or UDP produce
//! connections carrying discrete length-framed byte messages in both
//! directions; a central messenger multiplexes many connectors and
//! delivers lifecycle and message events to user callbacks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use msglink::{create_tcp_client, create_tcp_server, messenger};
//!
//! #[tokio::main]
//! async fn main() {
//!     let net = messenger();
//!
//!     // Echo server: send every message straight back.
//!     let echo = net.clone();
//!     net.add_connector(
//!         create_tcp_server(11111),
//!         None,
//!         None,
//!         Some(Arc::new(move |id, msg, _| echo.send(id, msg))),
//!     );
//!
//!     let replies = net.clone();
//!     net.add_connector(
//!         create_tcp_client("localhost", 11111),
//!         Some(Arc::new(move |id| replies.send(id, b"hello".to_vec()))),
//!         None,
//!         Some(Arc::new(|_, msg, _| println!("{}", String::from_utf8_lossy(&msg)))),
//!     );
//! }
//! ```

pub mod config;
pub mod error;
pub mod framer;
pub mod messenger;
pub mod service;
pub mod transport;

pub use config::{
    ServiceConfig, ThreadNamer, TlsCertificate, TlsConfig, TlsHandshakeRole, TlsMethod,
    VerifyCallback,
};
pub use error::NetError;
pub use framer::{
    Channel, FrameError, Framer, FramerKind, FramerOptions, HeaderLayout, DEFAULT_MAX_PAYLOAD,
};
pub use messenger::{deinit_messengers, messenger, Messenger, OnConnect, OnDisconnect, OnMsg};
#[cfg(unix)]
pub use service::{
    create_unix_client, create_unix_server, create_unix_ssl_client, create_unix_ssl_server,
};
pub use service::{
    create_tcp_client, create_tcp_client_with, create_tcp_server, create_tcp_server_with,
    create_tcp_ssl_client, create_tcp_ssl_server, create_udp_broadcast_client,
    create_udp_broadcast_server, create_udp_multicast_client, create_udp_multicast_server,
    create_udp_unicast_client, create_udp_unicast_server, deinit_services, init_services,
};
pub use transport::{Connection, ConnectionId, Connector, ConnectorId};

/// The current library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
