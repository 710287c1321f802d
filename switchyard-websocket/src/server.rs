//! TCP listener performing the WebSocket upgrade and handing connections
//! to a [`Hub`].

use crate::client::PRINCIPAL_KEY;
use crate::connection::{Connection, ConnectionInfo};
use crate::error::{WebSocketError, WebSocketResult};
use crate::hub::Hub;
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::{HeaderValue, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::WebSocketConfig;

/// Decides whether an upgrade request may proceed.
///
/// Runs during the handshake, after the subprotocol has been negotiated.
/// An error rejects the upgrade with `401 Unauthorized`; `Ok(Some(principal))`
/// is stored on the client and available through
/// [`Client::principal`](crate::Client::principal).
pub trait Authenticator: Send + Sync + 'static {
    /// Inspect the request metadata.
    fn authenticate(&self, info: &ConnectionInfo) -> WebSocketResult<Option<serde_json::Value>>;
}

impl<F> Authenticator for F
where
    F: Fn(&ConnectionInfo) -> WebSocketResult<Option<serde_json::Value>> + Send + Sync + 'static,
{
    fn authenticate(&self, info: &ConnectionInfo) -> WebSocketResult<Option<serde_json::Value>> {
        self(info)
    }
}

/// Builder for [`WebSocketServer`].
pub struct WebSocketServerBuilder {
    hub: Hub,
    bind_addr: SocketAddr,
    subprotocols: Vec<String>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl WebSocketServerBuilder {
    /// Create a builder serving connections into `hub`.
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            subprotocols: Vec::new(),
            authenticator: None,
        }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the bind address from a string.
    pub fn bind(mut self, addr: &str) -> WebSocketResult<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| WebSocketError::Server(format!("Invalid address: {}", e)))?;
        Ok(self)
    }

    /// Add a supported subprotocol. The first protocol the client offers
    /// that appears in this list is selected.
    pub fn subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.subprotocols.push(protocol.into());
        self
    }

    /// Set the authenticator consulted for every upgrade request.
    pub fn authenticator<A: Authenticator>(mut self, authenticator: A) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Bind the listener.
    pub async fn build(self) -> WebSocketResult<WebSocketServer> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let config = self.hub.config();
        let ws_config = WebSocketConfig::default()
            .read_buffer_size(config.read_buffer_size)
            .write_buffer_size(config.write_buffer_size)
            .max_message_size(Some(config.max_message_size))
            .max_frame_size(Some(config.max_message_size));

        Ok(WebSocketServer {
            listener,
            acceptor: Arc::new(Acceptor {
                hub: self.hub,
                subprotocols: self.subprotocols,
                authenticator: self.authenticator,
                ws_config,
            }),
        })
    }
}

struct Acceptor {
    hub: Hub,
    subprotocols: Vec<String>,
    authenticator: Option<Arc<dyn Authenticator>>,
    ws_config: WebSocketConfig,
}

impl Acceptor {
    /// First protocol offered by the client that we support.
    fn negotiate(&self, request: &Request) -> Option<String> {
        request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .find(|offered| self.subprotocols.iter().any(|p| p == offered))
            .map(str::to_string)
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> WebSocketResult<()> {
        let _ = stream.set_nodelay(true);

        let mut accepted: Option<(ConnectionInfo, Option<serde_json::Value>)> = None;
        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let mut info = ConnectionInfo::from_request(request).remote_addr(addr);

            if let Some(protocol) = self.negotiate(request) {
                if let Ok(value) = HeaderValue::from_str(&protocol) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
                info = info.subprotocol(protocol);
            }

            let principal = match &self.authenticator {
                Some(authenticator) => match authenticator.authenticate(&info) {
                    Ok(principal) => principal,
                    Err(e) => {
                        tracing::warn!(addr = %addr, error = %e, "Rejected WebSocket upgrade");
                        return Err(reject(StatusCode::UNAUTHORIZED, e.to_string()));
                    }
                },
                None => None,
            };

            accepted = Some((info, principal));
            Ok(response)
        };

        let handshake = accept_hdr_async_with_config(stream, callback, Some(self.ws_config));
        let ws_stream = tokio::time::timeout(self.hub.config().handshake_timeout, handshake)
            .await
            .map_err(|_| WebSocketError::Timeout)??;

        let Some((info, principal)) = accepted else {
            return Err(WebSocketError::Server("handshake finished without a request".to_string()));
        };
        tracing::debug!(connection_id = %info.id, addr = %addr, subprotocol = ?info.subprotocol, "WebSocket connection established");

        let connection = Connection::from_stream(ws_stream, info);
        self.hub
            .serve_with(connection, |client| {
                if let Some(principal) = principal {
                    client.set(PRINCIPAL_KEY, principal);
                }
            })
            .await?;
        Ok(())
    }
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

/// WebSocket server bound to a TCP listener.
pub struct WebSocketServer {
    listener: TcpListener,
    acceptor: Arc<Acceptor>,
}

impl WebSocketServer {
    /// Create a builder for the server.
    pub fn builder(hub: Hub) -> WebSocketServerBuilder {
        WebSocketServerBuilder::new(hub)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> WebSocketResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The hub connections are served into.
    pub fn hub(&self) -> &Hub {
        &self.acceptor.hub
    }

    /// Accept connections until the hub is closed.
    pub async fn run(self) -> WebSocketResult<()> {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, "WebSocket server listening");

        loop {
            let accepted = tokio::select! {
                _ = self.acceptor.hub.closed() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let acceptor = Arc::clone(&self.acceptor);
                    tokio::spawn(async move {
                        if let Err(e) = acceptor.handle_connection(stream, addr).await {
                            tracing::debug!(addr = %addr, error = %e, "Connection setup failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }

        tracing::info!(addr = %addr, "WebSocket server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("subprotocols", &self.acceptor.subprotocols)
            .finish()
    }
}
