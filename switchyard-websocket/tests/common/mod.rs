//! In-memory connections for driving a hub without sockets.

#![allow(dead_code)]

use async_trait::async_trait;
use std::time::Duration;
use switchyard_websocket::{
    Connection, ConnectionInfo, FrameReader, FrameWriter, Message, WebSocketError,
    WebSocketResult,
};
use tokio::sync::mpsc;

pub struct ChannelReader(mpsc::UnboundedReceiver<Message>);

#[async_trait]
impl FrameReader for ChannelReader {
    async fn read_message(&mut self) -> WebSocketResult<Option<Message>> {
        Ok(self.0.recv().await)
    }
}

pub struct ChannelWriter(mpsc::UnboundedSender<Message>);

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn write_message(&mut self, message: Message) -> WebSocketResult<()> {
        self.0
            .send(message)
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    async fn close(&mut self) -> WebSocketResult<()> {
        Ok(())
    }
}

/// A writer whose writes never complete, like a peer that stopped reading.
pub struct StuckWriter;

#[async_trait]
impl FrameWriter for StuckWriter {
    async fn write_message(&mut self, _message: Message) -> WebSocketResult<()> {
        std::future::pending().await
    }

    async fn close(&mut self) -> WebSocketResult<()> {
        Ok(())
    }
}

/// A writer that fails every write.
pub struct BrokenWriter;

#[async_trait]
impl FrameWriter for BrokenWriter {
    async fn write_message(&mut self, _message: Message) -> WebSocketResult<()> {
        Err(WebSocketError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        )))
    }

    async fn close(&mut self) -> WebSocketResult<()> {
        Ok(())
    }
}

/// Remote end of an in-memory connection.
pub struct Peer {
    pub inbound: mpsc::UnboundedSender<Message>,
    pub outbound: mpsc::UnboundedReceiver<Message>,
}

impl Peer {
    /// Next frame written by the server, failing the test after five seconds.
    pub async fn next(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection writer dropped")
    }

    /// Next text or binary frame, skipping control frames.
    pub async fn next_data(&mut self) -> Message {
        loop {
            let frame = self.next().await;
            if frame.is_text() || frame.is_binary() {
                return frame;
            }
        }
    }

    /// Drain and return every frame written so far.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Route hub logs to the test output. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn connection(id: &str) -> (Connection, Peer) {
    init_tracing();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let connection = Connection::new(
        ConnectionInfo::with_id(id),
        ChannelReader(in_rx),
        ChannelWriter(out_tx),
    );
    (
        connection,
        Peer {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

/// A connection whose writes hang forever. Keep the returned sender alive
/// so the read side stays open.
pub fn stuck_connection(id: &str) -> (Connection, mpsc::UnboundedSender<Message>) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let connection = Connection::new(ConnectionInfo::with_id(id), ChannelReader(in_rx), StuckWriter);
    (connection, in_tx)
}

/// A connection whose writes always fail.
pub fn broken_connection(id: &str) -> (Connection, mpsc::UnboundedSender<Message>) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let connection = Connection::new(ConnectionInfo::with_id(id), ChannelReader(in_rx), BrokenWriter);
    (connection, in_tx)
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}
