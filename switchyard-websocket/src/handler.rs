//! Handler types, handler registries and isolated dispatch.
//!
//! Every user callback runs behind [`run_isolated`], so an error or a panic
//! in one handler is reported through the error handlers and never reaches
//! the hub loop, a pump, or a sibling handler.

use crate::client::Client;
use crate::error::{WebSocketError, WebSocketResult};
use crate::message::Message;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Future returned by asynchronous handlers.
pub type HandlerFuture = BoxFuture<'static, WebSocketResult<()>>;

/// Connect or disconnect handler.
pub type ClientHandler = Arc<dyn Fn(Arc<Client>) -> HandlerFuture + Send + Sync>;

/// Named event handler, receiving the envelope's `data`.
pub type EventHandler = Arc<dyn Fn(Arc<Client>, serde_json::Value) -> HandlerFuture + Send + Sync>;

/// Raw inbound frame handler.
pub type MessageHandler = Arc<dyn Fn(Arc<Client>, Message) -> HandlerFuture + Send + Sync>;

/// Error handler. `client` is `None` for errors not tied to a connection.
pub type ErrorHandler = Arc<dyn Fn(Option<&Arc<Client>>, &WebSocketError) + Send + Sync>;

pub(crate) fn client_handler<F, Fut>(f: F) -> ClientHandler
where
    F: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
{
    Arc::new(move |client| Box::pin(f(client)))
}

pub(crate) fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Arc<Client>, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
{
    Arc::new(move |client, data| Box::pin(f(client, data)))
}

pub(crate) fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Arc<Client>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
{
    Arc::new(move |client, message| Box::pin(f(client, message)))
}

/// Run one handler invocation, converting panics into errors.
pub(crate) async fn run_isolated<F>(invoke: F) -> WebSocketResult<()>
where
    F: FnOnce() -> HandlerFuture,
{
    let future = match std::panic::catch_unwind(AssertUnwindSafe(invoke)) {
        Ok(future) => future,
        Err(panic) => return Err(WebSocketError::HandlerPanic(panic_message(&panic))),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(WebSocketError::HandlerPanic(panic_message(&panic))),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Invoke error handlers, each behind its own panic guard.
pub(crate) fn report_to(
    handlers: &[ErrorHandler],
    client: Option<&Arc<Client>>,
    error: &WebSocketError,
) {
    for handler in handlers {
        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(client, error))).is_err() {
            tracing::error!(error = %error, "Error handler panicked");
        }
    }
}

/// Hub-wide handler registry. Append-only; dispatch works on a copy.
#[derive(Default)]
pub(crate) struct HubHandlers {
    connect: RwLock<Vec<ClientHandler>>,
    disconnect: RwLock<Vec<ClientHandler>>,
    events: RwLock<HashMap<String, Vec<EventHandler>>>,
    errors: RwLock<Vec<ErrorHandler>>,
}

impl HubHandlers {
    pub fn add_connect(&self, handler: ClientHandler) {
        self.connect.write().push(handler);
    }

    pub fn add_disconnect(&self, handler: ClientHandler) {
        self.disconnect.write().push(handler);
    }

    pub fn add_event(&self, event: String, handler: EventHandler) {
        self.events.write().entry(event).or_default().push(handler);
    }

    pub fn add_error(&self, handler: ErrorHandler) {
        self.errors.write().push(handler);
    }

    /// Fire connect handlers, one task per handler.
    pub fn spawn_connect(self: &Arc<Self>, client: &Arc<Client>) {
        let handlers = self.connect.read().clone();
        self.spawn_each("connect", handlers, client);
    }

    /// Fire disconnect handlers, one task per handler.
    pub fn spawn_disconnect(self: &Arc<Self>, client: &Arc<Client>) {
        let handlers = self.disconnect.read().clone();
        self.spawn_each("disconnect", handlers, client);
    }

    fn spawn_each(self: &Arc<Self>, kind: &'static str, handlers: Vec<ClientHandler>, client: &Arc<Client>) {
        for handler in handlers {
            let registry = Arc::clone(self);
            let client = Arc::clone(client);
            tokio::spawn(async move {
                let invoked = Arc::clone(&client);
                if let Err(e) = run_isolated(move || handler(invoked)).await {
                    tracing::error!(client_id = %client.id(), handler = kind, error = %e, "Handler failed");
                    registry.report(Some(&client), &e);
                }
            });
        }
    }

    /// Run the named-event handlers in registration order.
    pub async fn dispatch_event(&self, client: &Arc<Client>, event: &str, data: &serde_json::Value) {
        let handlers = match self.events.read().get(event) {
            Some(handlers) => handlers.clone(),
            None => return,
        };

        for handler in handlers {
            let invoked = Arc::clone(client);
            let data = data.clone();
            if let Err(e) = run_isolated(move || handler(invoked, data)).await {
                tracing::error!(client_id = %client.id(), event = %event, error = %e, "Event handler failed");
                self.report(Some(client), &e);
            }
        }
    }

    /// Route an error to every registered error handler.
    pub fn report(&self, client: Option<&Arc<Client>>, error: &WebSocketError) {
        let handlers = self.errors.read().clone();
        report_to(&handlers, client, error);
    }
}

/// Trait-based alternative to closure registration.
///
/// Register an implementation with [`Hub::with_handler`](crate::Hub::with_handler).
#[async_trait]
pub trait HubHandler: Send + Sync + 'static {
    /// Called after a client is registered.
    async fn on_connect(&self, client: Arc<Client>) -> WebSocketResult<()> {
        let _ = client;
        Ok(())
    }

    /// Called after a client is unregistered and removed from its rooms.
    async fn on_disconnect(&self, client: Arc<Client>) -> WebSocketResult<()> {
        let _ = client;
        Ok(())
    }

    /// Called for handler failures, fan-out failures and pump errors.
    fn on_error(&self, client: Option<&Arc<Client>>, error: &WebSocketError) {
        tracing::error!(client_id = ?client.map(|c| c.id()), error = %error, "WebSocket error");
    }
}

/// A handler that only logs lifecycle events.
#[derive(Debug, Default, Clone)]
pub struct LoggingHandler;

#[async_trait]
impl HubHandler for LoggingHandler {
    async fn on_connect(&self, client: Arc<Client>) -> WebSocketResult<()> {
        tracing::info!(client_id = %client.id(), remote_addr = ?client.remote_addr(), "Client connected");
        Ok(())
    }

    async fn on_disconnect(&self, client: Arc<Client>) -> WebSocketResult<()> {
        tracing::info!(client_id = %client.id(), "Client disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_isolated_passes_result_through() {
        assert!(run_isolated(|| Box::pin(async { Ok::<(), WebSocketError>(()) })).await.is_ok());

        let err =
            run_isolated(|| Box::pin(async { Err::<(), _>(WebSocketError::handler("nope")) })).await;
        assert!(matches!(err, Err(WebSocketError::Handler(msg)) if msg == "nope"));
    }

    #[tokio::test]
    async fn test_run_isolated_catches_panics() {
        let err = run_isolated(|| {
            Box::pin(async {
                if true {
                    panic!("boom");
                }
                Ok::<(), WebSocketError>(())
            })
        })
        .await;
        assert!(matches!(err, Err(WebSocketError::HandlerPanic(msg)) if msg == "boom"));

        let err = run_isolated(|| -> HandlerFuture { panic!("eager") }).await;
        assert!(matches!(err, Err(WebSocketError::HandlerPanic(msg)) if msg == "eager"));
    }

    #[test]
    fn test_report_survives_panicking_error_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let handlers: Vec<ErrorHandler> = vec![
            Arc::new(|_, _| panic!("bad handler")),
            Arc::new(move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        ];

        report_to(&handlers, None, &WebSocketError::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
