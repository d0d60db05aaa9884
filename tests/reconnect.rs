use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use msglink::{create_tcp_client, create_tcp_server, Messenger};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// A client pointed at a dead endpoint retries silently on a fixed
/// cadence; once the server appears, exactly one connection comes up on
/// each side.
#[tokio::test]
async fn client_reconnects_when_the_server_appears() -> Result<()> {
    let net = Messenger::new();

    let (client_connect_tx, mut client_connects) = mpsc::unbounded_channel();
    net.add_connector(
        create_tcp_client("::1", 17130),
        Some(Arc::new(move |id| {
            let _ = client_connect_tx.send(id);
        })),
        None,
        None,
    );

    // No server yet: the retry loop must stay silent.
    sleep(Duration::from_secs(3)).await;
    assert!(client_connects.try_recv().is_err());

    let (server_connect_tx, mut server_connects) = mpsc::unbounded_channel();
    net.add_connector(
        create_tcp_server(17130),
        Some(Arc::new(move |id| {
            let _ = server_connect_tx.send(id);
        })),
        None,
        None,
    );

    timeout(Duration::from_secs(10), client_connects.recv())
        .await?
        .unwrap();
    timeout(Duration::from_secs(10), server_connects.recv())
        .await?
        .unwrap();

    // Exactly one connect each; the client must not flap.
    sleep(Duration::from_millis(1500)).await;
    assert!(client_connects.try_recv().is_err());
    assert!(server_connects.try_recv().is_err());

    net.stop();
    Ok(())
}
