//! Upgrade handling and the registry of live connections.

use std::sync::{Arc, Weak};

use http::HeaderMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::bytes::Bytes;
use tracing::debug;

use crate::connection::{Connection, ConnectionId};
use crate::errors::ConnectionError;
use crate::events::{SubscriptionId, Subscribers};
use crate::handshake;
use crate::transport::Transport;

/// Callback invoked with each newly upgraded connection.
pub type ConnectHandler = dyn Fn(&Connection) + Send + Sync;

/// Accepts upgrade requests and tracks the resulting connections.
///
/// A connection stays in the registry until it disconnects or the listener
/// is shut down. Cloning is cheap; clones share state.
#[derive(Clone, Default)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

#[derive(Default)]
struct ListenerInner {
    connections: Mutex<FxHashMap<ConnectionId, Connection>>,
    connect: Mutex<Subscribers<ConnectHandler>>,
}

impl Listener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for new connections, run in registration order.
    pub fn on_connect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        let mut connect = self.inner.connect.lock();
        let id = connect.subscribe(Arc::new(callback));
        debug!(subscribers = connect.len(), "Registered connect handler");
        id
    }

    /// Remove a connect callback. Returns `false` if it was not registered.
    pub fn remove_connect_handler(&self, id: SubscriptionId) -> bool {
        self.inner.connect.lock().remove(id)
    }

    /// Handle one upgrade request arriving on `transport`.
    ///
    /// A request that is not a WebSocket upgrade gets a bare `400` response
    /// and the transport is shut down. Otherwise the `101` response is
    /// written, the connection is registered and every connect callback is
    /// invoked with it before it is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Protocol`] for a rejected request, or the
    /// transport's error if the handshake response could not be written.
    pub fn handle_upgrade<T>(
        &self,
        headers: &HeaderMap,
        transport: T,
    ) -> Result<Connection, ConnectionError>
    where
        T: Transport + 'static,
    {
        let key = match handshake::validate(headers) {
            Ok(key) => key,
            Err(e) => {
                debug!(error = %e, "Rejecting upgrade request");
                if let Err(write_err) =
                    transport.write(Bytes::from_static(handshake::BAD_REQUEST_RESPONSE))
                {
                    debug!(error = %write_err, "Could not write 400 response");
                }
                transport.shutdown();
                return Err(e.into());
            }
        };

        let accept = handshake::compute_accept_value(key);
        if let Err(e) = transport.write(Bytes::from(handshake::build_response(&accept))) {
            debug!(error = %e, "Could not write handshake response");
            transport.shutdown();
            return Err(e);
        }

        let connection = Connection::new(transport);
        let id = connection.id();
        let registry: Weak<ListenerInner> = Arc::downgrade(&self.inner);
        connection.on_disconnect(move || {
            if let Some(inner) = registry.upgrade() {
                inner.connections.lock().remove(&id);
            }
        });
        self.inner.connections.lock().insert(id, connection.clone());
        debug!(connection = %id, "WebSocket connection established");

        let handlers = self.inner.connect.lock().snapshot();
        for handler in handlers {
            handler(&connection);
        }
        Ok(connection)
    }

    /// Connections that have completed the handshake and not yet closed.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Close every registered connection and empty the registry.
    pub fn shutdown(&self) {
        let connections = std::mem::take(&mut *self.inner.connections.lock());
        debug!(count = connections.len(), "Shutting down listener");
        for connection in connections.into_values() {
            connection.close();
        }
    }
}
