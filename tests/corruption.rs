use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use msglink::{create_tcp_server, Messenger, NetError};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

async fn connect_with_retry(port: u16) -> Result<TcpStream> {
    for _ in 0..50 {
        match TcpStream::connect(("::1", port)).await {
            Ok(stream) => return Ok(stream),
            Err(_) => sleep(Duration::from_millis(100)).await,
        }
    }
    anyhow::bail!("server on port {port} never came up")
}

/// A header declaring a 4 GiB payload against the default 64 MiB cap
/// must tear the connection down as data corruption within one read
/// cycle.
#[tokio::test]
async fn oversized_length_header_disconnects_with_corruption() -> Result<()> {
    let net = Messenger::new();
    let (err_tx, mut errors) = tokio::sync::mpsc::unbounded_channel();
    net.add_connector(
        create_tcp_server(17131),
        None,
        Some(Arc::new(move |_, err| {
            let _ = err_tx.send(err);
        })),
        None,
    );

    let mut raw = connect_with_retry(17131).await?;
    raw.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await?;
    raw.flush().await?;

    let err = timeout(Duration::from_secs(10), errors.recv())
        .await?
        .unwrap();
    assert!(matches!(err, NetError::DataCorruption));
    assert_eq!(net.connection_count(), 0);
    net.stop();
    Ok(())
}
