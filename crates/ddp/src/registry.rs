//! Live-connection registry.
//!
//! All changes to the connection set go through one admission loop task, fed
//! by a bounded request queue. Queries run on the same loop, so they always
//! see a consistent set.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ADMISSION_QUEUE_SIZE: usize = 1024;

struct ConnectionEntry {
    peer: Option<SocketAddr>,
    close: CancellationToken,
    session: Option<String>,
}

enum RegistryCommand {
    Register {
        id: u64,
        entry: ConnectionEntry,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        id: u64,
    },
    ClaimSession {
        id: u64,
        session: String,
        reply: oneshot::Sender<bool>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

pub struct Registry {
    tx: mpsc::Sender<RegistryCommand>,
    rx: Mutex<Option<mpsc::Receiver<RegistryCommand>>>,
    next_id: AtomicU64,
    max_connections: Option<usize>,
}

impl Registry {
    pub fn new(max_connections: Option<usize>) -> Self {
        let (tx, rx) = mpsc::channel(ADMISSION_QUEUE_SIZE);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Spawn the admission loop if it isn't running yet. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(rx) = rx {
            tokio::spawn(admission_loop(rx, self.max_connections));
        }
    }

    /// Admit a connection. Returns its registry id, or `None` when the server
    /// is at capacity or shutting down.
    pub async fn register(&self, peer: Option<SocketAddr>, close: CancellationToken) -> Option<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ConnectionEntry {
            peer,
            close,
            session: None,
        };
        let admitted = self
            .request(|reply| RegistryCommand::Register { id, entry, reply })
            .await
            .unwrap_or(false);
        admitted.then_some(id)
    }

    pub async fn unregister(&self, id: u64) {
        self.start();
        if self.tx.send(RegistryCommand::Unregister { id }).await.is_err() {
            warn!(conn_id = id, "registry stopped before unregister");
        }
    }

    /// Record `session` for connection `id`. Fails if another live connection
    /// already holds it.
    pub async fn claim_session(&self, id: u64, session: String) -> bool {
        self.request(|reply| RegistryCommand::ClaimSession { id, session, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn connection_count(&self) -> usize {
        self.request(|reply| RegistryCommand::Count { reply })
            .await
            .unwrap_or(0)
    }

    /// Session ids of every connection past its handshake.
    pub async fn session_ids(&self) -> Vec<String> {
        self.request(|reply| RegistryCommand::Sessions { reply })
            .await
            .unwrap_or_default()
    }

    /// Close every live connection and refuse new ones. Returns how many
    /// connections were signalled.
    pub async fn shutdown(&self) -> usize {
        self.request(|reply| RegistryCommand::Shutdown { reply })
            .await
            .unwrap_or(0)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Option<T> {
        self.start();
        let (reply, response) = oneshot::channel();
        self.tx.send(build(reply)).await.ok()?;
        response.await.ok()
    }
}

async fn admission_loop(mut rx: mpsc::Receiver<RegistryCommand>, max_connections: Option<usize>) {
    let mut connections: IndexMap<u64, ConnectionEntry> = IndexMap::new();
    let mut closing = false;

    while let Some(command) = rx.recv().await {
        match command {
            RegistryCommand::Register { id, entry, reply } => {
                let full = max_connections.is_some_and(|max| connections.len() >= max);
                let admitted = !closing && !full;
                if admitted {
                    debug!(conn_id = id, peer = ?entry.peer, "registered connection");
                    connections.insert(id, entry);
                } else {
                    warn!(
                        conn_id = id,
                        peer = ?entry.peer,
                        live = connections.len(),
                        closing,
                        "connection refused"
                    );
                }
                let _ = reply.send(admitted);
            }
            RegistryCommand::Unregister { id } => {
                if connections.shift_remove(&id).is_some() {
                    debug!(conn_id = id, live = connections.len(), "unregistered connection");
                }
            }
            RegistryCommand::ClaimSession { id, session, reply } => {
                let taken = connections
                    .iter()
                    .any(|(other, entry)| {
                        *other != id && entry.session.as_deref() == Some(session.as_str())
                    });
                if !taken {
                    if let Some(entry) = connections.get_mut(&id) {
                        entry.session = Some(session);
                    }
                }
                let _ = reply.send(!taken);
            }
            RegistryCommand::Count { reply } => {
                let _ = reply.send(connections.len());
            }
            RegistryCommand::Sessions { reply } => {
                let sessions = connections
                    .values()
                    .filter_map(|entry| entry.session.clone())
                    .collect();
                let _ = reply.send(sessions);
            }
            RegistryCommand::Shutdown { reply } => {
                closing = true;
                info!(live = connections.len(), "closing all connections");
                for entry in connections.values() {
                    entry.close.cancel();
                }
                let _ = reply.send(connections.len());
            }
        }
    }
    debug!("registry admission loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = Registry::new(None);
        let a = registry.register(None, CancellationToken::new()).await.unwrap();
        let b = registry.register(None, CancellationToken::new()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.connection_count().await, 2);

        registry.unregister(a).await;
        assert_eq!(registry.connection_count().await, 1);
        // Unknown ids are ignored
        registry.unregister(a).await;
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_max_connections_is_enforced() {
        let registry = Registry::new(Some(1));
        let first = registry.register(None, CancellationToken::new()).await;
        assert!(first.is_some());
        assert!(registry.register(None, CancellationToken::new()).await.is_none());

        registry.unregister(first.unwrap()).await;
        assert!(registry.register(None, CancellationToken::new()).await.is_some());
    }

    #[tokio::test]
    async fn test_session_claims_are_unique_among_live_connections() {
        let registry = Registry::new(None);
        let a = registry.register(None, CancellationToken::new()).await.unwrap();
        let b = registry.register(None, CancellationToken::new()).await.unwrap();

        assert!(registry.claim_session(a, "S1".into()).await);
        assert!(!registry.claim_session(b, "S1".into()).await);
        assert!(registry.claim_session(b, "S2".into()).await);

        let mut sessions = registry.session_ids().await;
        sessions.sort();
        assert_eq!(sessions, vec!["S1", "S2"]);

        // A closed connection releases its session
        registry.unregister(a).await;
        assert!(registry.claim_session(b, "S1".into()).await);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_connections_and_refuses_new_ones() {
        let registry = Registry::new(None);
        let close = CancellationToken::new();
        registry.register(None, close.clone()).await.unwrap();

        assert_eq!(registry.shutdown().await, 1);
        assert!(close.is_cancelled());
        assert!(registry.register(None, CancellationToken::new()).await.is_none());
    }
}
