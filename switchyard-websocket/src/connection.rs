//! Connection boundary between the upgrade layer and the hub.
//!
//! A [`Connection`] is a pair of frame halves plus the metadata captured at
//! upgrade time. The client's read pump owns the [`FrameReader`] and the
//! write pump owns the [`FrameWriter`], so neither half needs a lock.

use crate::error::{WebSocketError, WebSocketResult};
use crate::message::Message;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tungstenite::error::CapacityError;

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Read half of a message-framed connection.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Read the next frame. `Ok(None)` means the peer ended the stream.
    async fn read_message(&mut self) -> WebSocketResult<Option<Message>>;

    /// Whether the transport already replies to ping frames itself.
    ///
    /// Readers that return false get a pong queued by the client for every
    /// ping they yield.
    fn answers_pings(&self) -> bool {
        false
    }
}

/// Write half of a message-framed connection.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Write one frame and flush it.
    async fn write_message(&mut self, message: Message) -> WebSocketResult<()>;

    /// Write a ping frame.
    async fn write_ping(&mut self, payload: &[u8]) -> WebSocketResult<()> {
        self.write_message(Message::ping(payload.to_vec())).await
    }

    /// Write a pong frame.
    async fn write_pong(&mut self, payload: &[u8]) -> WebSocketResult<()> {
        self.write_message(Message::pong(payload.to_vec())).await
    }

    /// Close the underlying transport.
    async fn close(&mut self) -> WebSocketResult<()>;
}

#[async_trait]
impl<S> FrameReader for SplitStream<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_message(&mut self) -> WebSocketResult<Option<Message>> {
        match self.next().await {
            Some(Ok(raw)) => Ok(Some(raw.into())),
            Some(Err(tungstenite::Error::Capacity(CapacityError::MessageTooLong {
                size,
                max_size,
            }))) => Err(WebSocketError::MessageTooLarge {
                size,
                max: max_size,
            }),
            Some(Err(e)) => Err(WebSocketError::Protocol(e)),
            None => Ok(None),
        }
    }

    fn answers_pings(&self) -> bool {
        true
    }
}

#[async_trait]
impl<S> FrameWriter for SplitSink<WebSocketStream<S>, tungstenite::Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_message(&mut self, message: Message) -> WebSocketResult<()> {
        self.send(message.into()).await?;
        Ok(())
    }

    async fn close(&mut self) -> WebSocketResult<()> {
        SinkExt::close(self).await?;
        Ok(())
    }
}

/// Metadata captured when the connection was upgraded.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Unique connection identifier
    pub id: ConnectionId,
    /// Remote address
    pub remote_addr: Option<SocketAddr>,
    /// Negotiated subprotocol
    pub subprotocol: Option<String>,
    /// Query parameters of the upgrade request (first value wins)
    pub query: HashMap<String, String>,
    /// Upgrade request headers, keyed by lowercase name
    pub headers: HashMap<String, String>,
}

impl ConnectionInfo {
    /// Create metadata with a fresh random id.
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Create metadata with a given id.
    pub fn with_id(id: impl Into<ConnectionId>) -> Self {
        Self {
            id: id.into(),
            remote_addr: None,
            subprotocol: None,
            query: HashMap::new(),
            headers: HashMap::new(),
        }
    }

    /// Capture the query string and headers of an upgrade request.
    pub fn from_request<B>(request: &http::Request<B>) -> Self {
        let mut info = Self::new();
        if let Some(query) = request.uri().query() {
            info = info.query_string(query);
        }
        for (name, value) in request.headers() {
            if let Ok(value) = value.to_str() {
                info.headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        info
    }

    /// Set the remote address.
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set the negotiated subprotocol.
    pub fn subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.subprotocol = Some(protocol.into());
        self
    }

    /// Parse a raw query string such as `token=abc&room=general`.
    pub fn query_string(mut self, raw: &str) -> Self {
        let raw = raw.strip_prefix('?').unwrap_or(raw);
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            self.query
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
        self
    }

    /// Add a request header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Look up a header, case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// An upgraded connection: metadata plus both frame halves.
pub struct Connection {
    info: ConnectionInfo,
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
}

impl Connection {
    /// Assemble a connection from arbitrary frame halves.
    pub fn new<R, W>(info: ConnectionInfo, reader: R, writer: W) -> Self
    where
        R: FrameReader,
        W: FrameWriter,
    {
        Self {
            info,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Wrap a tungstenite stream by splitting it into its two halves.
    pub fn from_stream<S>(stream: WebSocketStream<S>, info: ConnectionInfo) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = stream.split();
        Self::new(info, stream, sink)
    }

    /// Connection metadata.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub(crate) fn into_parts(self) -> (ConnectionInfo, Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        (self.info, self.reader, self.writer)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("info", &self.info).finish()
    }
}
