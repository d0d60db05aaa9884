//! Per-connection actor pair for reliable byte-stream transports.
//!
//! The read actor pulls exactly the byte counts the framer asks for and
//! hands completed messages to the message hook. The write actor sleeps
//! until the outbound queue is non-empty, then writes the head frame's
//! buffers and goes back to waiting. `send_msg` only appends to the queue
//! and wakes the writer, so it may be called from any thread; everything
//! else runs on the two actor tasks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Notify};
use tracing::{debug, error};

use crate::error::NetError;
use crate::framer::{Channel, Framer, FramerOptions};
use crate::service;
use crate::transport::{next_connection_id, Connection, ConnectionId, Hooks};

/// Object-safe alias for anything a stream connection can drive: a plain
/// TCP or UNIX stream, or a TLS session over either.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type BoxedStream = Box<dyn StreamIo>;

type Frame = Vec<Bytes>;

struct ActorIo {
    read: ReadHalf<BoxedStream>,
    write: WriteHalf<BoxedStream>,
    framer: Box<dyn Framer>,
}

pub struct StreamConnection {
    id: ConnectionId,
    hooks: Hooks,
    /// True until the first `stop`; whoever flips it owns the single
    /// disconnect emission. Set from construction so a teardown racing
    /// `start` still reaches the hooks.
    connected: AtomicBool,
    started: AtomicBool,
    queue: Mutex<VecDeque<Frame>>,
    queue_ready: Notify,
    shutdown_tx: watch::Sender<bool>,
    io: Mutex<Option<ActorIo>>,
    encoder: Box<dyn Framer>,
}

impl StreamConnection {
    pub fn new(io: BoxedStream, framer: FramerOptions) -> Arc<Self> {
        let (read, write) = tokio::io::split(io);
        Arc::new(Self {
            id: next_connection_id(),
            hooks: Hooks::default(),
            connected: AtomicBool::new(true),
            started: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queue_ready: Notify::new(),
            shutdown_tx: watch::channel(false).0,
            io: Mutex::new(Some(ActorIo {
                read,
                write,
                framer: framer.build(),
            })),
            encoder: framer.build(),
        })
    }

    async fn read_actor(
        self: Arc<Self>,
        mut read: ReadHalf<BoxedStream>,
        mut framer: Box<dyn Framer>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let op = framer.next_op();
            let work = framer.work_buffer();
            let offset = work.len();
            work.resize(offset + op.len, 0);
            let result = tokio::select! {
                result = read.read_exact(&mut work[offset..]) => result,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
            };
            if let Err(err) = result {
                self.stop(NetError::transport(err));
                return;
            }
            match framer.advance(op.len) {
                Ok(true) => {
                    let (payload, channel) = framer.take();
                    self.hooks.emit_msg(self.id, payload, channel);
                }
                Ok(false) => {}
                Err(err) => {
                    error!(id = self.id, error = %err, "inbound framing failure");
                    self.stop(NetError::DataCorruption);
                    return;
                }
            }
        }
    }

    async fn write_actor(self: Arc<Self>, mut write: WriteHalf<BoxedStream>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let frame = self.queue.lock().pop_front();
            match frame {
                Some(buffers) => {
                    let result = tokio::select! {
                        result = Self::write_frame(&mut write, &buffers) => result,
                        _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
                    };
                    if let Err(err) = result {
                        self.stop(NetError::transport(err));
                        break;
                    }
                }
                None => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    // Queue empty: sleep until `send_msg` or `stop` rings.
                    tokio::select! {
                        _ = self.queue_ready.notified() => {}
                        _ = shutdown_rx.wait_for(|stopped| *stopped) => {}
                    }
                }
            }
        }
        let _ = write.shutdown().await;
    }

    async fn write_frame(
        write: &mut WriteHalf<BoxedStream>,
        buffers: &[Bytes],
    ) -> std::io::Result<()> {
        for buffer in buffers {
            write.write_all(buffer).await?;
        }
        write.flush().await
    }
}

impl Connection for StreamConnection {
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
        let Some(io) = self.io.lock().take() else {
            return;
        };
        let reader = self.clone();
        service::spawn(reader.read_actor(io.read, io.framer));
        let writer = self.clone();
        service::spawn(writer.write_actor(io.write));
    }

    fn stop(&self, err: NetError) {
        // Wake both actors; dropping their halves closes the socket,
        // which is the cancellation mechanism for in-flight I/O.
        self.shutdown_tx.send_replace(true);
        self.queue_ready.notify_one();
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(id = self.id, error = %err, "connection stopped");
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
        // Edge-triggered wake for the writer's awaiting state.
        self.queue_ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn pair() -> (Arc<StreamConnection>, Arc<StreamConnection>) {
        let (a, b) = tokio::io::duplex(1024);
        (
            StreamConnection::new(Box::new(a), FramerOptions::default()),
            StreamConnection::new(Box::new(b), FramerOptions::default()),
        )
    }

    fn collect_msgs(conn: &Arc<StreamConnection>) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        conn.hooks()
            .set_msg(Arc::new(move |_, payload, _| {
                let _ = tx.send(payload);
            }));
        rx
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (left, right) = pair();
        let mut inbound = collect_msgs(&right);
        left.clone().start();
        right.clone().start();

        for i in 0..50u8 {
            left.send_msg(vec![i; 3], 0);
        }
        for i in 0..50u8 {
            let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg, vec![i; 3]);
        }
    }

    #[tokio::test]
    async fn messages_enqueued_before_start_are_flushed() {
        let (left, right) = pair();
        let mut inbound = collect_msgs(&right);
        left.send_msg(b"early".to_vec(), 0);
        left.clone().start();
        right.clone().start();

        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, b"early");
    }

    #[tokio::test]
    async fn disconnect_fires_exactly_once_under_racing_stops() {
        let (left, _right) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        left.hooks().add_disconnect(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        left.clone().start();

        let a = left.clone();
        let b = left.clone();
        let t1 = tokio::spawn(async move { a.stop(NetError::UserTriggeredDisconnect) });
        let t2 = tokio::spawn(async move { b.stop(NetError::ConnectionAborted) });
        t1.await.unwrap();
        t2.await.unwrap();
        left.stop(NetError::UserTriggeredDisconnect);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_close_stops_the_connection() {
        let (left, right) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        right.hooks().add_disconnect(Arc::new(move |_, err| {
            let _ = tx.send(err.clone());
        }));
        right.clone().start();

        left.clone().start();
        left.stop(NetError::UserTriggeredDisconnect);

        let err = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, NetError::Transport(_)));
    }

    #[tokio::test]
    async fn send_after_stop_is_silently_dropped() {
        let (left, _right) = pair();
        left.clone().start();
        left.stop(NetError::UserTriggeredDisconnect);
        left.send_msg(b"late".to_vec(), 0);
        assert!(left.queue.lock().is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (left, right) = pair();
        let mut inbound = collect_msgs(&right);
        left.clone().start();
        left.clone().start();
        right.clone().start();

        left.send_msg(b"once".to_vec(), 0);
        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, b"once");
    }

    #[tokio::test]
    async fn concurrent_senders_do_not_interleave_frames() {
        let (left, right) = pair();
        let mut inbound = collect_msgs(&right);
        left.clone().start();
        right.clone().start();

        let a = left.clone();
        let t1 = tokio::spawn(async move {
            for _ in 0..100 {
                a.send_msg(vec![b'a'; 64], 0);
            }
        });
        let b = left.clone();
        let t2 = tokio::spawn(async move {
            for _ in 0..100 {
                b.send_msg(vec![b'b'; 64], 0);
            }
        });
        t1.await.unwrap();
        t2.await.unwrap();

        for _ in 0..200 {
            let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.len(), 64);
            assert!(msg.iter().all(|&b| b == msg[0]));
        }
    }
}
