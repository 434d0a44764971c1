//! Publications and the handle given to them.
//!
//! A publication handler receives a [`Subscription`] and may push document
//! writes through it for as long as the subscription lives, from the handler
//! itself or from any task it spawns. Writes are marshalled onto the owning
//! connection's dispatch loop; the handle never touches the transport.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{DdpError, PublishError};
use crate::protocol::Fields;

// ==================== PublicationHandler Trait ====================

/// Server-side implementation of a named publication.
///
/// Returning `Err` stops the subscription with that error, after any writes
/// already made through the handle are applied.
#[async_trait]
pub trait PublicationHandler: Send + Sync + 'static {
    async fn publish(&self, subscription: Subscription) -> Result<(), DdpError>;
}

#[async_trait]
impl<F, Fut> PublicationHandler for F
where
    F: Fn(Subscription) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DdpError>> + Send + 'static,
{
    async fn publish(&self, subscription: Subscription) -> Result<(), DdpError> {
        (self)(subscription).await
    }
}

/// Publication name to handler table, fixed once the server is built.
#[derive(Clone, Default)]
pub struct Publications {
    handlers: HashMap<String, Arc<dyn PublicationHandler>>,
}

impl Publications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn PublicationHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PublicationHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ==================== Commands ====================

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PublicationOp {
    Added {
        collection: String,
        id: String,
        fields: Fields,
    },
    Changed {
        collection: String,
        id: String,
        fields: Fields,
        cleared: Vec<String>,
    },
    Removed {
        collection: String,
        id: String,
    },
    Ready,
    Stop,
    Error(DdpError),
}

/// A write made through a [`Subscription`], applied by the connection.
///
/// `generation` tells a live subscription apart from an earlier one that
/// used the same client-supplied id.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PublicationCommand {
    pub sub_id: String,
    pub generation: u64,
    pub op: PublicationOp,
}

/// Producer side of a connection's bounded publication queue, shared by all
/// of its subscriptions. A write that finds the queue full closes the
/// connection.
#[derive(Clone)]
pub(crate) struct CommandSender {
    tx: mpsc::Sender<PublicationCommand>,
    close: CancellationToken,
}

pub(crate) type CommandReceiver = mpsc::Receiver<PublicationCommand>;

/// Queue for `capacity` pending writes; `close` is the owning connection's
/// cancellation token.
pub(crate) fn command_channel(
    capacity: usize,
    close: CancellationToken,
) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CommandSender { tx, close }, rx)
}

// ==================== Subscription Handle ====================

type StopCallback = Box<dyn FnOnce() + Send + 'static>;

struct SubscriptionInner {
    id: String,
    name: String,
    params: Vec<Value>,
    session_id: String,
    user_id: Option<String>,
    generation: u64,
    commands: CommandSender,
    stop: CancellationToken,
    on_stop: Mutex<Vec<StopCallback>>,
}

/// Handle through which a publication feeds one subscription.
///
/// Cheap to clone. Every write fails with [`PublishError::Stopped`] once the
/// subscription is torn down (unsub, disconnect, `stop()` or `error()`).
/// Writes never block; one that finds the connection's queue full fails with
/// [`PublishError::Backpressure`] and the connection is closed.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("generation", &self.inner.generation)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        name: String,
        params: Vec<Value>,
        session_id: String,
        user_id: Option<String>,
        generation: u64,
        commands: CommandSender,
    ) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                id,
                name,
                params,
                session_id,
                user_id,
                generation,
                commands,
                stop: CancellationToken::new(),
                on_stop: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Client-supplied subscription id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Publication name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> &[Value] {
        &self.inner.params
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// User id of the connection when the subscription started.
    pub fn user_id(&self) -> Option<&str> {
        self.inner.user_id.as_deref()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Publish a document, or add fields to one this subscription publishes.
    pub fn added(&self, collection: &str, id: &str, fields: Fields) -> Result<(), PublishError> {
        self.send(PublicationOp::Added {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        })
    }

    /// Set `fields` and drop this subscription's values for `cleared`.
    pub fn changed(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        cleared: &[&str],
    ) -> Result<(), PublishError> {
        self.send(PublicationOp::Changed {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
            cleared: cleared.iter().map(|name| name.to_string()).collect(),
        })
    }

    /// Stop publishing a document.
    pub fn removed(&self, collection: &str, id: &str) -> Result<(), PublishError> {
        self.send(PublicationOp::Removed {
            collection: collection.to_string(),
            id: id.to_string(),
        })
    }

    /// Mark the initial document set as complete. Only the first call
    /// reaches the client.
    pub fn ready(&self) -> Result<(), PublishError> {
        self.send(PublicationOp::Ready)
    }

    /// End the subscription from the server side; the client gets `nosub{id}`.
    pub fn stop(&self) -> Result<(), PublishError> {
        self.send(PublicationOp::Stop)
    }

    /// End the subscription with an error; the client gets `nosub{id, error}`.
    pub fn error(&self, error: DdpError) -> Result<(), PublishError> {
        self.send(PublicationOp::Error(error))
    }

    /// Register cleanup to run when the subscription is torn down. Runs
    /// immediately if it already was.
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_stopped() {
            callback();
            return;
        }
        let mut callbacks = self
            .inner
            .on_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Teardown may have happened between the check and the lock
        if self.is_stopped() {
            drop(callbacks);
            callback();
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Resolves once the subscription is torn down.
    pub async fn stopped(&self) {
        self.inner.stop.cancelled().await
    }

    /// Cancel the handle and run stop callbacks. Called by the owning
    /// connection only.
    pub(crate) fn shutdown(&self) {
        let callbacks = {
            let mut guard = self
                .inner
                .on_stop
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.stop.cancel();
            std::mem::take(&mut *guard)
        };
        for callback in callbacks {
            callback();
        }
    }

    fn send(&self, op: PublicationOp) -> Result<(), PublishError> {
        if self.is_stopped() {
            return Err(PublishError::Stopped(self.inner.id.clone()));
        }
        let command = PublicationCommand {
            sub_id: self.inner.id.clone(),
            generation: self.inner.generation,
            op,
        };
        match self.inner.commands.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(sub = %self.inner.id, "publication queue full, closing connection");
                self.inner.commands.close.cancel();
                Err(PublishError::Backpressure(self.inner.id.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(PublishError::Stopped(self.inner.id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handle() -> (Subscription, CommandReceiver) {
        handle_with_capacity(16, CancellationToken::new())
    }

    fn handle_with_capacity(
        capacity: usize,
        close: CancellationToken,
    ) -> (Subscription, CommandReceiver) {
        let (tx, rx) = command_channel(capacity, close);
        let sub = Subscription::new(
            "3".to_string(),
            "posts".to_string(),
            vec![json!(1)],
            "session".to_string(),
            None,
            7,
            tx,
        );
        (sub, rx)
    }

    #[test]
    fn test_writes_are_queued_in_order() {
        let (sub, mut rx) = handle();
        let mut fields = Fields::new();
        fields.insert("a".to_string(), json!(1));
        sub.added("c", "d", fields).unwrap();
        sub.changed("c", "d", Fields::new(), &["a"]).unwrap();
        sub.ready().unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.sub_id, "3");
        assert_eq!(first.generation, 7);
        assert!(matches!(first.op, PublicationOp::Added { .. }));
        match rx.try_recv().unwrap().op {
            PublicationOp::Changed { cleared, .. } => assert_eq!(cleared, vec!["a"]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.try_recv().unwrap().op, PublicationOp::Ready);
    }

    #[test]
    fn test_writes_fail_after_shutdown() {
        let (sub, _rx) = handle();
        sub.shutdown();
        assert!(sub.is_stopped());
        assert_eq!(
            sub.removed("c", "d"),
            Err(PublishError::Stopped("3".to_string()))
        );
    }

    #[test]
    fn test_writes_fail_when_connection_is_gone() {
        let (sub, rx) = handle();
        drop(rx);
        assert!(sub.ready().is_err());
    }

    #[test]
    fn test_full_queue_refuses_writes_and_closes_connection() {
        let close = CancellationToken::new();
        let (sub, mut rx) = handle_with_capacity(2, close.clone());
        sub.added("c", "a", Fields::new()).unwrap();
        sub.added("c", "b", Fields::new()).unwrap();
        assert!(!close.is_cancelled());

        assert_eq!(
            sub.added("c", "overflow", Fields::new()),
            Err(PublishError::Backpressure("3".to_string()))
        );
        assert!(close.is_cancelled());

        // Nothing past the bound was queued
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_on_stop_runs_once() {
        let (sub, _rx) = handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        sub.on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.shutdown();
        sub.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Registered after teardown: runs right away
        let counter = calls.clone();
        sub.on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stopped_resolves_on_shutdown() {
        let (sub, _rx) = handle();
        let waiter = sub.clone();
        let task = tokio::spawn(async move { waiter.stopped().await });
        sub.shutdown();
        task.await.unwrap();
    }
}
