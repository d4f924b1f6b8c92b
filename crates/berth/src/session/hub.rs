//! Registry of live connections, addressable by connection id.
//!
//! A session record names its owner by connection id. When another
//! connection for the same user shows up, the hub is how the owner is told
//! to let go.

use std::time::Duration;

use berth_protocol::ServerEvent;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Size of the per-connection outbound buffer.
pub const CONNECTION_BUFFER_SIZE: usize = 256;

/// Signals shared between a connection and the hub.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    /// Events for the client.
    pub outbound: mpsc::Sender<ServerEvent>,
    /// Fired on disconnect, shutdown, or forced takeover.
    pub cancel: CancellationToken,
    /// Fired when a newer connection for the same user asks this one to leave.
    pub superseded: CancellationToken,
    /// Fired once the connection has finished tearing down.
    pub terminated: CancellationToken,
}

/// How a takeover ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Takeover {
    /// The old connection is not in this process.
    NotConnected,
    /// The old connection tore down in time.
    Released,
    /// The old connection did not answer in time, was cancelled, and then
    /// tore down.
    Forced,
    /// The old connection was cancelled but is still tearing down.
    Stuck,
    /// The waiting connection itself was cancelled.
    Abandoned,
}

/// All live connections of this process.
pub struct ConnectionHub {
    connections: DashMap<String, ConnectionHandle>,
    shutdown: CancellationToken,
}

impl ConnectionHub {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            connections: DashMap::new(),
            shutdown,
        }
    }

    /// Register a new connection. Its cancel token is a child of shutdown.
    pub fn register(&self) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let handle = ConnectionHandle {
            connection_id: uuid::Uuid::new_v4().to_string(),
            outbound: tx,
            cancel: self.shutdown.child_token(),
            superseded: CancellationToken::new(),
            terminated: CancellationToken::new(),
        };
        self.connections
            .insert(handle.connection_id.clone(), handle.clone());
        debug!("Registered connection {}", handle.connection_id);
        (handle, rx)
    }

    pub fn unregister(&self, connection_id: &str) {
        if self.connections.remove(connection_id).is_some() {
            debug!("Unregistered connection {}", connection_id);
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ask `old_connection` to leave and wait until it has torn down.
    ///
    /// The old connection receives a new-session notice first. If it has not
    /// terminated within `timeout`, it is cancelled and given `release_timeout`
    /// more to finish in-flight work. Every outcome except `Stuck` and
    /// `Abandoned` means the old connection no longer runs. `waiter` aborts
    /// the wait when the asking connection goes away.
    pub async fn supersede(
        &self,
        old_connection: &str,
        notice: &str,
        timeout: Duration,
        release_timeout: Duration,
        waiter: &CancellationToken,
    ) -> Takeover {
        let Some(old) = self.get(old_connection) else {
            return Takeover::NotConnected;
        };

        info!("Superseding connection {}", old_connection);
        if let Err(e) = old.outbound.try_send(ServerEvent::NewSession {
            notice: notice.to_string(),
        }) {
            debug!(
                "could not queue new-session notice for {}: {}",
                old_connection, e
            );
        }
        old.superseded.cancel();

        tokio::select! {
            _ = old.terminated.cancelled() => return Takeover::Released,
            _ = waiter.cancelled() => return Takeover::Abandoned,
            _ = tokio::time::sleep(timeout) => {}
        }

        warn!(
            "Connection {} did not release within {:?}, forcing",
            old_connection, timeout
        );
        old.cancel.cancel();

        tokio::select! {
            _ = old.terminated.cancelled() => Takeover::Forced,
            _ = waiter.cancelled() => Takeover::Abandoned,
            _ = tokio::time::sleep(release_timeout) => {
                warn!(
                    "Connection {} still tearing down after {:?}",
                    old_connection, release_timeout
                );
                Takeover::Stuck
            }
        }
    }

    /// Wait until every connection has unregistered, or `timeout` passes.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}
