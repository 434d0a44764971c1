//! Per-connection merge box.
//!
//! Several subscriptions on one connection may publish the same document.
//! The merge box keeps, for every `(collection, id)`, the set of asserting
//! subscriptions and every subscription's field values, and turns each
//! publication write into the minimal `added` / `changed` / `removed` event
//! for the client.
//!
//! Rules:
//! - the asserting set going 0 -> 1 emits `added` with the visible fields;
//! - going >0 -> 0 emits `removed` and drops all state for the key;
//! - any other write emits `changed` with only the fields whose visible value
//!   differs from what was last sent, plus `cleared` for fields that vanished.
//!
//! Conflicting values for one field are resolved by call order: the most
//! recent write by a still-asserting subscription is visible. When that
//! subscription retracts, the next most recent write becomes visible again.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use indexmap::IndexSet;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{Fields, ServerMessage};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    pub collection: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(collection: &str, id: &str) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeBoxError {
    #[error("subscription '{subscription}' does not publish {collection}/{id}")]
    NotAsserted {
        subscription: String,
        collection: String,
        id: String,
    },
}

#[derive(Debug, Default)]
struct DocumentView {
    /// Subscriptions asserting this document, in assertion order.
    asserting: IndexSet<String>,
    /// Every subscription's value per field; the last writer is visible.
    fields: BTreeMap<String, Vec<(String, Value)>>,
    /// Fields as last sent to the client.
    sent: Fields,
}

impl DocumentView {
    fn write(&mut self, subscription: &str, name: String, value: Value) {
        let writers = self.fields.entry(name).or_default();
        writers.retain(|(sub, _)| sub != subscription);
        writers.push((subscription.to_string(), value));
    }

    fn clear(&mut self, subscription: &str, name: &str) {
        if let Some(writers) = self.fields.get_mut(name) {
            writers.retain(|(sub, _)| sub != subscription);
            if writers.is_empty() {
                self.fields.remove(name);
            }
        }
    }

    fn retract(&mut self, subscription: &str) {
        self.asserting.shift_remove(subscription);
        self.fields.retain(|_, writers| {
            writers.retain(|(sub, _)| sub != subscription);
            !writers.is_empty()
        });
    }

    fn visible(&self) -> Fields {
        self.fields
            .iter()
            .filter_map(|(name, writers)| {
                writers
                    .last()
                    .map(|(_, value)| (name.clone(), value.clone()))
            })
            .collect()
    }

    /// Diff the visible fields against the last-sent snapshot and record
    /// them as sent. Returns `(changed, cleared)`.
    fn flush(&mut self) -> (Fields, Vec<String>) {
        let visible = self.visible();
        let mut changed = Fields::new();
        for (name, value) in &visible {
            if self.sent.get(name) != Some(value) {
                changed.insert(name.clone(), value.clone());
            }
        }
        let cleared = self
            .sent
            .keys()
            .filter(|name| !visible.contains_key(*name))
            .cloned()
            .collect();
        self.sent = visible;
        (changed, cleared)
    }
}

fn changed_message(
    collection: &str,
    id: &str,
    (fields, cleared): (Fields, Vec<String>),
) -> Option<ServerMessage> {
    if fields.is_empty() && cleared.is_empty() {
        return None;
    }
    Some(ServerMessage::Changed {
        collection: collection.to_string(),
        id: id.to_string(),
        fields,
        cleared,
    })
}

/// Connection-wide document view shared by all subscriptions.
#[derive(Debug, Default)]
pub struct MergeBox {
    collections: HashMap<String, HashMap<String, DocumentView>>,
    /// Keys each subscription asserts, for teardown.
    asserted: HashMap<String, BTreeSet<DocumentKey>>,
}

impl MergeBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscription `subscription` publishes a document.
    ///
    /// Emits `added` when the document becomes visible, otherwise a `changed`
    /// for the fields whose visible value moved.
    pub fn added(
        &mut self,
        subscription: &str,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Option<ServerMessage> {
        let doc = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        let was_visible = !doc.asserting.is_empty();
        doc.asserting.insert(subscription.to_string());
        for (name, value) in fields {
            doc.write(subscription, name, value);
        }
        self.asserted
            .entry(subscription.to_string())
            .or_default()
            .insert(DocumentKey::new(collection, id));

        if was_visible {
            changed_message(collection, id, doc.flush())
        } else {
            let (fields, _) = doc.flush();
            Some(ServerMessage::Added {
                collection: collection.to_string(),
                id: id.to_string(),
                fields,
            })
        }
    }

    /// Subscription `subscription` sets `fields` and drops its values for
    /// `cleared` on a document it already publishes.
    pub fn changed(
        &mut self,
        subscription: &str,
        collection: &str,
        id: &str,
        fields: Fields,
        cleared: &[String],
    ) -> Result<Option<ServerMessage>, MergeBoxError> {
        let doc = self
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .filter(|doc| doc.asserting.contains(subscription))
            .ok_or_else(|| not_asserted(subscription, collection, id))?;
        for (name, value) in fields {
            doc.write(subscription, name, value);
        }
        for name in cleared {
            doc.clear(subscription, name);
        }
        Ok(changed_message(collection, id, doc.flush()))
    }

    /// Subscription `subscription` stops publishing a document.
    pub fn removed(
        &mut self,
        subscription: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<ServerMessage>, MergeBoxError> {
        let key = DocumentKey::new(collection, id);
        let owned = self
            .asserted
            .get_mut(subscription)
            .is_some_and(|keys| keys.remove(&key));
        if !owned {
            return Err(not_asserted(subscription, collection, id));
        }
        if self
            .asserted
            .get(subscription)
            .is_some_and(|keys| keys.is_empty())
        {
            self.asserted.remove(subscription);
        }
        Ok(self.retract(subscription, &key))
    }

    /// Retract every document `subscription` publishes, as if each received
    /// `removed`. Events come out in key order.
    pub fn remove_subscription(&mut self, subscription: &str) -> Vec<ServerMessage> {
        let keys = self.asserted.remove(subscription).unwrap_or_default();
        keys.iter()
            .filter_map(|key| self.retract(subscription, key))
            .collect()
    }

    fn retract(&mut self, subscription: &str, key: &DocumentKey) -> Option<ServerMessage> {
        let docs = self.collections.get_mut(&key.collection)?;
        let doc = docs.get_mut(&key.id)?;
        doc.retract(subscription);
        if doc.asserting.is_empty() {
            docs.remove(&key.id);
            if docs.is_empty() {
                self.collections.remove(&key.collection);
            }
            return Some(ServerMessage::Removed {
                collection: key.collection.clone(),
                id: key.id.clone(),
            });
        }
        changed_message(&key.collection, &key.id, doc.flush())
    }

    /// Fields of a document as the client currently sees them.
    #[cfg(test)]
    pub fn document(&self, collection: &str, id: &str) -> Option<&Fields> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| &doc.sent)
    }

    /// Subscriptions asserting a document, in assertion order.
    #[cfg(test)]
    pub fn asserting(&self, collection: &str, id: &str) -> Vec<String> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.asserting.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys published by one subscription.
    #[cfg(test)]
    pub fn published_by(&self, subscription: &str) -> Vec<DocumentKey> {
        self.asserted
            .get(subscription)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of documents visible to the client.
    pub fn len(&self) -> usize {
        self.collections.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn clear(&mut self) {
        self.collections.clear();
        self.asserted.clear();
    }
}

fn not_asserted(subscription: &str, collection: &str, id: &str) -> MergeBoxError {
    MergeBoxError::NotAsserted {
        subscription: subscription.to_string(),
        collection: collection.to_string(),
        id: id.to_string(),
    }
}
