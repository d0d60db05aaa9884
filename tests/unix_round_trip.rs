#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use msglink::{create_unix_client, create_unix_server, Messenger};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("msglink-{tag}-{}.sock", std::process::id()))
}

#[tokio::test]
async fn unix_socket_echo_round_trip() -> Result<()> {
    let path = socket_path("echo");
    let _ = std::fs::remove_file(&path);

    let net = Messenger::new();
    let echo = net.clone();
    net.add_connector(
        create_unix_server(&path),
        None,
        None,
        Some(Arc::new(move |id, msg, _| echo.send(id, msg))),
    );

    let (connect_tx, mut connects) = mpsc::unbounded_channel();
    let (msg_tx, mut msgs) = mpsc::unbounded_channel::<Vec<u8>>();
    net.add_connector(
        create_unix_client(&path),
        Some(Arc::new(move |id| {
            let _ = connect_tx.send(id);
        })),
        None,
        Some(Arc::new(move |_, msg, _| {
            let _ = msg_tx.send(msg);
        })),
    );

    let client_id = timeout(Duration::from_secs(10), connects.recv())
        .await?
        .unwrap();
    net.send(client_id, b"over the filesystem".to_vec());
    let echoed = timeout(Duration::from_secs(10), msgs.recv()).await?.unwrap();
    assert_eq!(echoed, b"over the filesystem");

    net.stop();
    Ok(())
}
