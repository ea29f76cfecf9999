//! Retained-message storage: a topic tree parallel to the subscription
//! tree, holding at most one payload per exact topic. A PUBLISH with the
//! retain flag and a non-empty payload creates or replaces the entry; an
//! empty payload deletes it. New subscribers get matching entries replayed
//! with the retain flag set.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use embermq_utils::Counter;

use crate::error::Result;
use crate::topic::{self, Filter, FilterToken};
use crate::types::{HashMap, Payload, QoS, TopicName};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RetainedMessage {
    pub topic: TopicName,
    pub payload: Payload,
    pub qos: QoS,
}

#[derive(Default)]
struct RetainedNode {
    children: HashMap<String, RetainedNode>,
    message: Option<RetainedMessage>,
}

impl RetainedNode {
    /// Returns true when a new entry was created (as opposed to replaced).
    fn set(&mut self, subtopics: &[&str], msg: RetainedMessage) -> bool {
        if let Some(first) = subtopics.first() {
            self.children.entry(first.to_string()).or_default().set(&subtopics[1..], msg)
        } else {
            self.message.replace(msg).is_none()
        }
    }

    /// Removes the entry at the exact path and prunes branches left behind
    /// with neither a message nor children.
    fn remove(&mut self, subtopics: &[&str]) -> bool {
        let Some(first) = subtopics.first() else {
            return self.message.take().is_some();
        };
        let Some(child) = self.children.get_mut(*first) else {
            return false;
        };
        let removed = child.remove(&subtopics[1..]);
        if child.message.is_none() && child.children.is_empty() {
            self.children.remove(*first);
        }
        removed
    }

    /// Walks the filter over this subtree. `descend` is set once a `#` has
    /// been consumed: every entry in the remaining subtree is a match.
    fn visit<F>(&self, tokens: &[FilterToken], descend: bool, f: &mut F)
    where
        F: FnMut(&RetainedMessage),
    {
        let Some(token) = tokens.first() else {
            if let Some(msg) = &self.message {
                f(msg);
            }
            if descend {
                for child in self.children.values() {
                    child.visit(tokens, true, f);
                }
            }
            return;
        };

        match token {
            FilterToken::MultiWildcard => {
                for child in self.children.values() {
                    child.visit(&tokens[1..], true, f);
                }
            }
            FilterToken::SingleWildcard => {
                for child in self.children.values() {
                    child.visit(&tokens[1..], false, f);
                }
            }
            FilterToken::Literal(s) => {
                if let Some(child) = self.children.get(s.as_str()) {
                    child.visit(&tokens[1..], false, f);
                }
            }
        }
    }

    fn collect(&self, out: &mut Vec<RetainedMessage>) {
        if let Some(msg) = &self.message {
            out.push(msg.clone());
        }
        for child in self.children.values() {
            child.collect(out);
        }
    }
}

#[derive(Default)]
struct Roots {
    root: RetainedNode,
    root_dollar: RetainedNode,
}

/// The retained-message store. Guarded by its own reader-writer lock,
/// separate from the subscription tree's; on paths that take both, this one
/// is acquired second (publish) or after the trie write lock is released
/// (subscribe replay).
pub struct RetainedMessageStore {
    tree: RwLock<Roots>,
    retaineds: Counter,
}

impl Default for RetainedMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RetainedMessageStore {
    #[inline]
    pub fn new() -> RetainedMessageStore {
        Self { tree: RwLock::new(Roots::default()), retaineds: Counter::new() }
    }

    /// Creates or replaces the entry at the exact topic; an empty payload
    /// deletes it (and creates nothing).
    pub async fn set(&self, topic: &TopicName, payload: Payload, qos: QoS) -> Result<()> {
        topic::validate_name(topic)?;
        let subtopics = topic::split(topic);

        let mut tree = self.tree.write().await;
        let root =
            if topic::is_dollar(topic) { &mut tree.root_dollar } else { &mut tree.root };

        if payload.is_empty() {
            if root.remove(&subtopics) {
                self.retaineds.dec();
            }
        } else {
            let msg = RetainedMessage { topic: topic.clone(), payload, qos };
            if root.set(&subtopics, msg) {
                self.retaineds.inc();
            }
        }
        Ok(())
    }

    /// Replays every retained entry matching the filter, capped to the
    /// subscription's maximum QoS. Order across entries is unspecified.
    /// Returns how many entries were delivered.
    pub async fn fetch_for_subscribe<F>(&self, filter: &Filter, max_qos: QoS, mut deliver: F) -> usize
    where
        F: FnMut(&TopicName, &Payload, QoS),
    {
        let tree = self.tree.read().await;
        let root = if filter.is_dollar() { &tree.root_dollar } else { &tree.root };

        let mut count = 0;
        root.visit(filter.tokens(), false, &mut |msg| {
            deliver(&msg.topic, &msg.payload, msg.qos.least(max_qos));
            count += 1;
        });
        count
    }

    /// Number of stored payloads.
    #[inline]
    pub fn count(&self) -> isize {
        self.retaineds.count()
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.retaineds.max()
    }

    /// Clones every stored entry, for the persistence layer. The lock is
    /// released when this returns; serialization happens without it.
    pub async fn snapshot(&self) -> Vec<RetainedMessage> {
        let tree = self.tree.read().await;
        let mut out = Vec::with_capacity(self.retaineds.count().max(0) as usize);
        tree.root.collect(&mut out);
        tree.root_dollar.collect(&mut out);
        out
    }

    /// Feeds restored entries back through [`set`](Self::set) semantics.
    /// Entries with an invalid topic are dropped with a warning.
    pub async fn restore(&self, messages: Vec<RetainedMessage>) {
        for msg in messages {
            if let Err(e) = self.set(&msg.topic, msg.payload.clone(), msg.qos).await {
                log::warn!("dropping restored retained message on {:?}: {}", msg.topic, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> Filter {
        s.parse().unwrap()
    }

    async fn fetch(store: &RetainedMessageStore, f: &str, max_qos: QoS) -> Vec<(String, Vec<u8>, QoS)> {
        let mut out = Vec::new();
        store
            .fetch_for_subscribe(&filter(f), max_qos, |topic, payload, qos| {
                out.push((topic.to_string(), payload.to_vec(), qos));
            })
            .await;
        out.sort();
        out
    }

    #[tokio::test]
    async fn set_and_fetch() {
        let store = RetainedMessageStore::new();
        store.set(&"home/light".into(), Payload::from("on"), QoS::AtLeastOnce).await.unwrap();
        assert_eq!(store.count(), 1);

        // S3: wildcard subscriber sees the entry, capped at min(1, 2) = 1.
        let out = fetch(&store, "home/+", QoS::ExactlyOnce).await;
        assert_eq!(out, vec![("home/light".to_string(), b"on".to_vec(), QoS::AtLeastOnce)]);

        // The subscription QoS caps the replay.
        let out = fetch(&store, "home/light", QoS::AtMostOnce).await;
        assert_eq!(out[0].2, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn replace_keeps_one_payload() {
        let store = RetainedMessageStore::new();
        store.set(&"t".into(), Payload::from("1"), QoS::AtMostOnce).await.unwrap();
        store.set(&"t".into(), Payload::from("2"), QoS::AtMostOnce).await.unwrap();
        assert_eq!(store.count(), 1);
        let out = fetch(&store, "t", QoS::ExactlyOnce).await;
        assert_eq!(out, vec![("t".to_string(), b"2".to_vec(), QoS::AtMostOnce)]);
    }

    #[tokio::test]
    async fn empty_payload_deletes() {
        let store = RetainedMessageStore::new();
        store.set(&"home/light".into(), Payload::from("on"), QoS::AtLeastOnce).await.unwrap();
        store.set(&"home/light".into(), Payload::new(), QoS::AtLeastOnce).await.unwrap();

        // S4: count back to zero, new subscribers get nothing.
        assert_eq!(store.count(), 0);
        assert!(fetch(&store, "home/+", QoS::ExactlyOnce).await.is_empty());

        // Deleting an absent entry creates no node and stays at zero.
        store.set(&"never/was".into(), Payload::new(), QoS::AtMostOnce).await.unwrap();
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn multi_level_fetch() {
        let store = RetainedMessageStore::new();
        for (t, p) in [("iot/b/x", "1"), ("iot/b/y", "2"), ("iot/b", "3"), ("x/y/z", "4")] {
            store.set(&t.into(), Payload::from(p), QoS::AtMostOnce).await.unwrap();
        }
        assert_eq!(store.count(), 4);

        let out = fetch(&store, "iot/#", QoS::AtMostOnce).await;
        assert_eq!(
            out.iter().map(|(t, _, _)| t.as_str()).collect::<Vec<_>>(),
            vec!["iot/b", "iot/b/x", "iot/b/y"]
        );

        let out = fetch(&store, "iot/b/+", QoS::AtMostOnce).await;
        assert_eq!(out.len(), 2);

        let out = fetch(&store, "+/y/z", QoS::AtMostOnce).await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn dollar_root_is_separate() {
        let store = RetainedMessageStore::new();
        store.set(&"$SYS/uptime".into(), Payload::from("x"), QoS::AtMostOnce).await.unwrap();
        store.set(&"foo/bar".into(), Payload::from("y"), QoS::AtMostOnce).await.unwrap();

        assert!(fetch(&store, "#", QoS::AtMostOnce).await.iter().all(|(t, _, _)| t == "foo/bar"));
        assert_eq!(fetch(&store, "$SYS/+", QoS::AtMostOnce).await.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let store = RetainedMessageStore::new();
        store.set(&"a/b".into(), Payload::from("1"), QoS::AtLeastOnce).await.unwrap();
        store.set(&"$SYS/x".into(), Payload::from("2"), QoS::AtMostOnce).await.unwrap();

        let snap = store.snapshot().await;
        assert_eq!(snap.len(), 2);

        let restored = RetainedMessageStore::new();
        restored.restore(snap).await;
        assert_eq!(restored.count(), 2);
        assert_eq!(fetch(&restored, "a/+", QoS::ExactlyOnce).await.len(), 1);
        assert_eq!(fetch(&restored, "$SYS/#", QoS::ExactlyOnce).await.len(), 1);
    }
}
