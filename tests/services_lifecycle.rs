use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use msglink::{
    create_tcp_client, create_tcp_server, deinit_messengers, deinit_services, init_services,
    messenger, ServiceConfig,
};

/// Drive the library without an ambient tokio runtime: the worker pool
/// from `init_services` carries everything, the lazy messenger routes
/// callbacks, and the deinit sequence tears both down.
#[test]
fn init_exchange_deinit() -> Result<()> {
    init_services(ServiceConfig {
        workers: 2,
        thread_namer: Some(Arc::new(|index| format!("msglink-test-{index}"))),
    })?;

    let net = messenger();
    let echo = net.clone();
    net.add_connector(
        create_tcp_server(17137),
        None,
        None,
        Some(Arc::new(move |id, msg, _| echo.send(id, msg))),
    );

    let (connect_tx, connects) = mpsc::channel();
    let (msg_tx, msgs) = mpsc::channel::<Vec<u8>>();
    let (drop_tx, drops) = mpsc::channel();
    net.add_connector(
        create_tcp_client("::1", 17137),
        Some(Arc::new(move |id| {
            let _ = connect_tx.send(id);
        })),
        Some(Arc::new(move |id, _| {
            let _ = drop_tx.send(id);
        })),
        Some(Arc::new(move |_, msg, _| {
            let _ = msg_tx.send(msg);
        })),
    );

    let client_id = connects.recv_timeout(Duration::from_secs(10))?;
    net.send(client_id, b"ping".to_vec());
    let echoed = msgs.recv_timeout(Duration::from_secs(10))?;
    assert_eq!(echoed, b"ping");

    deinit_messengers();
    drops.recv_timeout(Duration::from_secs(10))?;
    assert!(net.is_empty());

    deinit_services();
    Ok(())
}
