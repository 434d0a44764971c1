//! Per-connection subscription manager.
//!
//! Owns the connection's subscriptions and its [`MergeBox`]. Lives inside the
//! connection's dispatch loop, so nothing here is shared or locked; writes
//! made from publication tasks arrive as [`PublicationCommand`]s and are
//! applied by [`SubscriptionManager::apply`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::DdpError;
use crate::merge_box::MergeBox;
use crate::protocol::ServerMessage;
use crate::publication::{
    CommandSender, PublicationCommand, PublicationHandler, PublicationOp, Publications,
    Subscription,
};

/// Lifecycle of a live subscription. A stopped subscription is no longer
/// tracked; its handle reports [`Subscription::is_stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Ready,
}

struct Entry {
    state: SubscriptionState,
    handle: Subscription,
}

pub struct SubscriptionManager {
    subs: HashMap<String, Entry>,
    merge_box: MergeBox,
    next_generation: u64,
    commands: CommandSender,
}

impl SubscriptionManager {
    pub(crate) fn new(commands: CommandSender) -> Self {
        Self {
            subs: HashMap::new(),
            merge_box: MergeBox::new(),
            next_generation: 0,
            commands,
        }
    }

    /// Handle `sub{id, name, params}`.
    ///
    /// A known id is a no-op. An unknown publication yields the `nosub` to
    /// send. Otherwise the handler is started on its own task and `None` is
    /// returned; its writes come back through the command channel.
    pub fn subscribe(
        &mut self,
        publications: &Publications,
        id: String,
        name: String,
        params: Vec<Value>,
        session_id: &str,
        user_id: Option<String>,
    ) -> Option<ServerMessage> {
        if self.subs.contains_key(&id) {
            debug!(sub = %id, "duplicate sub ignored");
            return None;
        }
        let Some(handler) = publications.get(&name) else {
            debug!(sub = %id, publication = %name, "unknown publication");
            return Some(ServerMessage::NoSub {
                error: Some(DdpError::unknown_publication(&name)),
                id,
            });
        };

        self.next_generation += 1;
        let handle = Subscription::new(
            id.clone(),
            name.clone(),
            params,
            session_id.to_string(),
            user_id,
            self.next_generation,
            self.commands.clone(),
        );
        self.subs.insert(
            id.clone(),
            Entry {
                state: SubscriptionState::Pending,
                handle: handle.clone(),
            },
        );
        debug!(sub = %id, publication = %name, "subscription started");
        tokio::spawn(run_publication(handler, handle));
        None
    }

    /// Handle `unsub{id}`.
    pub fn unsubscribe(&mut self, id: &str) -> Vec<ServerMessage> {
        if !self.subs.contains_key(id) {
            return vec![ServerMessage::NoSub {
                id: id.to_string(),
                error: Some(DdpError::unknown_subscription_id(id)),
            }];
        }
        self.teardown(id, None)
    }

    /// Apply one publication write and return the events for the client.
    pub(crate) fn apply(&mut self, command: PublicationCommand) -> Vec<ServerMessage> {
        let PublicationCommand {
            sub_id,
            generation,
            op,
        } = command;
        let live = self
            .subs
            .get(&sub_id)
            .is_some_and(|entry| entry.handle.generation() == generation);
        if !live {
            return Vec::new();
        }

        match op {
            PublicationOp::Added {
                collection,
                id,
                fields,
            } => self
                .merge_box
                .added(&sub_id, &collection, &id, fields)
                .into_iter()
                .collect(),
            PublicationOp::Changed {
                collection,
                id,
                fields,
                cleared,
            } => match self
                .merge_box
                .changed(&sub_id, &collection, &id, fields, &cleared)
            {
                Ok(event) => event.into_iter().collect(),
                Err(err) => {
                    warn!(sub = %sub_id, "ignoring changed: {}", err);
                    Vec::new()
                }
            },
            PublicationOp::Removed { collection, id } => {
                match self.merge_box.removed(&sub_id, &collection, &id) {
                    Ok(event) => event.into_iter().collect(),
                    Err(err) => {
                        warn!(sub = %sub_id, "ignoring removed: {}", err);
                        Vec::new()
                    }
                }
            }
            PublicationOp::Ready => match self.subs.get_mut(&sub_id) {
                Some(entry) if entry.state == SubscriptionState::Pending => {
                    entry.state = SubscriptionState::Ready;
                    vec![ServerMessage::Ready { subs: vec![sub_id] }]
                }
                _ => Vec::new(),
            },
            PublicationOp::Stop => self.teardown(&sub_id, None),
            PublicationOp::Error(err) => self.teardown(&sub_id, Some(err)),
        }
    }

    /// Tear down every subscription without producing client events. Used
    /// when the connection closes.
    pub fn stop_all(&mut self) {
        for (id, entry) in self.subs.drain() {
            debug!(sub = %id, "subscription stopped on close");
            entry.handle.shutdown();
        }
        self.merge_box.clear();
    }

    fn teardown(&mut self, id: &str, error: Option<DdpError>) -> Vec<ServerMessage> {
        let Some(entry) = self.subs.remove(id) else {
            return Vec::new();
        };
        entry.handle.shutdown();
        let mut events = self.merge_box.remove_subscription(id);
        debug!(
            sub = %id,
            retracted = events.len(),
            visible = self.merge_box.len(),
            "subscription stopped"
        );
        events.push(ServerMessage::NoSub {
            id: id.to_string(),
            error,
        });
        events
    }

    #[cfg(test)]
    pub fn state(&self, id: &str) -> Option<SubscriptionState> {
        self.subs.get(id).map(|entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    #[cfg(test)]
    pub fn merge_box(&self) -> &MergeBox {
        &self.merge_box
    }
}

/// Drive one publication handler until it returns or the subscription stops.
async fn run_publication(handler: Arc<dyn PublicationHandler>, subscription: Subscription) {
    let outcome = tokio::select! {
        _ = subscription.stopped() => return,
        outcome = AssertUnwindSafe(handler.publish(subscription.clone())).catch_unwind() => outcome,
    };
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            debug!(sub = %subscription.id(), "publication failed: {}", err);
            let _ = subscription.error(err);
        }
        Err(_) => {
            error!(
                sub = %subscription.id(),
                publication = %subscription.name(),
                "publication handler panicked"
            );
            let _ = subscription.error(DdpError::internal());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Fields;
    use crate::publication::{CommandReceiver, command_channel};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    fn publications() -> Publications {
        let mut publications = Publications::new();
        publications.insert(
            "posts",
            Arc::new(|sub: Subscription| async move {
                sub.added("posts", "p1", fields(json!({"title": "a"})))?;
                sub.ready()?;
                Ok::<(), DdpError>(())
            }),
        );
        publications.insert(
            "featured",
            Arc::new(|sub: Subscription| async move {
                sub.added("posts", "p1", fields(json!({"title": "a", "featured": true})))?;
                sub.ready()?;
                Ok::<(), DdpError>(())
            }),
        );
        publications.insert(
            "failing",
            Arc::new(|sub: Subscription| async move {
                sub.added("posts", "p9", Fields::new())?;
                Err(DdpError::new("not-allowed", "Nope"))
            }),
        );
        publications.insert(
            "panicking",
            Arc::new(|sub: Subscription| async move {
                if !sub.is_stopped() {
                    panic!("boom");
                }
                Ok::<(), DdpError>(())
            }),
        );
        publications
    }

    fn manager() -> (SubscriptionManager, CommandReceiver) {
        let (tx, rx) = command_channel(64, CancellationToken::new());
        (SubscriptionManager::new(tx), rx)
    }

    /// Apply commands until `count` client events have been produced.
    async fn pump(
        manager: &mut SubscriptionManager,
        rx: &mut CommandReceiver,
        count: usize,
    ) -> Vec<ServerMessage> {
        let mut events = Vec::new();
        while events.len() < count {
            let command = rx.recv().await.expect("command channel closed");
            events.extend(manager.apply(command));
        }
        events
    }

    #[tokio::test]
    async fn test_subscribe_runs_handler_and_reports_ready() {
        let (mut manager, mut rx) = manager();
        let reply = manager.subscribe(&publications(), "1".into(), "posts".into(), vec![], "s", None);
        assert!(reply.is_none());
        assert_eq!(manager.state("1"), Some(SubscriptionState::Pending));

        let events = pump(&mut manager, &mut rx, 2).await;
        assert!(matches!(&events[0], ServerMessage::Added { id, .. } if id == "p1"));
        assert_eq!(events[1], ServerMessage::Ready { subs: vec!["1".into()] });
        assert_eq!(manager.state("1"), Some(SubscriptionState::Ready));
    }

    #[tokio::test]
    async fn test_unknown_publication_replies_nosub() {
        let (mut manager, _rx) = manager();
        let reply = manager
            .subscribe(&publications(), "1".into(), "nope".into(), vec![], "s", None)
            .unwrap();
        match reply {
            ServerMessage::NoSub { id, error } => {
                assert_eq!(id, "1");
                assert_eq!(error.unwrap().error, "unknown-subscription");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(manager.is_empty());
        assert!(manager.merge_box().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_sub_id_is_a_no_op() {
        let (mut manager, mut rx) = manager();
        let publications = publications();
        manager.subscribe(&publications, "1".into(), "posts".into(), vec![], "s", None);
        pump(&mut manager, &mut rx, 2).await;

        assert!(manager
            .subscribe(&publications, "1".into(), "featured".into(), vec![], "s", None)
            .is_none());
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.merge_box().asserting("posts", "p1"), vec!["1"]);
    }

    #[tokio::test]
    async fn test_overlapping_subscriptions_share_documents() {
        let (mut manager, mut rx) = manager();
        let publications = publications();
        manager.subscribe(&publications, "1".into(), "posts".into(), vec![], "s", None);
        pump(&mut manager, &mut rx, 2).await;
        manager.subscribe(&publications, "2".into(), "featured".into(), vec![], "s", None);
        let events = pump(&mut manager, &mut rx, 2).await;
        // Second subscription adds only the delta, never a second added
        assert!(matches!(
            &events[0],
            ServerMessage::Changed { fields, .. } if fields.len() == 1 && fields.contains_key("featured")
        ));

        let events = manager.unsubscribe("1");
        assert_eq!(events, vec![ServerMessage::NoSub { id: "1".into(), error: None }]);
        assert_eq!(manager.merge_box().asserting("posts", "p1"), vec!["2"]);

        let events = manager.unsubscribe("2");
        assert!(matches!(&events[0], ServerMessage::Removed { id, .. } if id == "p1"));
        assert_eq!(events[1], ServerMessage::NoSub { id: "2".into(), error: None });
        assert!(manager.merge_box().is_empty());
    }

    #[tokio::test]
    async fn test_unsub_unknown_id() {
        let (mut manager, _rx) = manager();
        let events = manager.unsubscribe("42");
        match &events[..] {
            [ServerMessage::NoSub { id, error: Some(error) }] => {
                assert_eq!(id, "42");
                assert_eq!(error.error, "unknown-subscription");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_applies_queued_writes_then_nosub() {
        let (mut manager, mut rx) = manager();
        manager.subscribe(&publications(), "1".into(), "failing".into(), vec![], "s", None);
        let events = pump(&mut manager, &mut rx, 3).await;
        assert!(matches!(&events[0], ServerMessage::Added { id, .. } if id == "p9"));
        assert!(matches!(&events[1], ServerMessage::Removed { id, .. } if id == "p9"));
        match &events[2] {
            ServerMessage::NoSub { id, error: Some(error) } => {
                assert_eq!(id, "1");
                assert_eq!(error.error, "not-allowed");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        let (mut manager, mut rx) = manager();
        manager.subscribe(&publications(), "1".into(), "panicking".into(), vec![], "s", None);
        let events = pump(&mut manager, &mut rx, 1).await;
        match &events[0] {
            ServerMessage::NoSub { error: Some(error), .. } => {
                assert_eq!(error.error, "internal-server-error");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_commands_from_reused_id_are_ignored() {
        let (mut manager, mut rx) = manager();
        let publications = publications();
        manager.subscribe(&publications, "1".into(), "posts".into(), vec![], "s", None);
        pump(&mut manager, &mut rx, 2).await;

        let stale = PublicationCommand {
            sub_id: "1".into(),
            generation: 1,
            op: PublicationOp::Removed {
                collection: "posts".into(),
                id: "p1".into(),
            },
        };
        manager.unsubscribe("1");
        manager.subscribe(&publications, "1".into(), "posts".into(), vec![], "s", None);
        pump(&mut manager, &mut rx, 2).await;

        assert!(manager.apply(stale).is_empty());
        assert_eq!(manager.merge_box().asserting("posts", "p1"), vec!["1"]);
    }

    #[tokio::test]
    async fn test_stop_all_clears_state_and_runs_callbacks() {
        let (mut manager, mut rx) = manager();
        manager.subscribe(&publications(), "1".into(), "posts".into(), vec![], "s", None);
        pump(&mut manager, &mut rx, 2).await;

        let (tx, stopped) = tokio::sync::oneshot::channel();
        let mut tx = Some(tx);
        manager.subs["1"].handle.on_stop(move || {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        });

        manager.stop_all();
        assert!(manager.is_empty());
        assert!(manager.merge_box().is_empty());
        stopped.await.unwrap();
    }
}
