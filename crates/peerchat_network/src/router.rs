//! Protocol router — maps protocol identifiers to inbound stream handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::connection::Stream;

/// A handler invoked once per accepted inbound stream for its protocol.
pub type StreamHandler =
    Arc<dyn Fn(Stream) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Routes accepted streams to the handler registered for their protocol.
#[derive(Default)]
pub struct ProtocolRouter {
    handlers: HashMap<String, StreamHandler>,
}

impl ProtocolRouter {
    /// Create a new router with no handlers registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a protocol, returning the one it replaced.
    pub fn register(
        &mut self,
        protocol: impl Into<String>,
        handler: StreamHandler,
    ) -> Option<StreamHandler> {
        let protocol = protocol.into();
        debug!("Registering stream handler for {protocol}");
        self.handlers.insert(protocol, handler)
    }

    /// Look up the handler for a protocol.
    pub fn handler(&self, protocol: &str) -> Option<StreamHandler> {
        self.handlers.get(protocol).cloned()
    }
}

/// Wrap an async closure as a [`StreamHandler`].
pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream| Box::pin(f(stream)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
