//! The subscription tree: one node per subtopic, walked on every PUBLISH.
//!
//! Literal subtopics live in a per-node child map; `+` and `#` each get a
//! dedicated child slot. Subscribers hold weak session references so that a
//! session dropped by the registry (clean-session reconnect, expiry) simply
//! stops matching; the periodic [`SubscriptionNode::clean`] sweep reclaims
//! the dead entries and prunes childless branches.

use std::sync::{Arc, Weak};

use crate::session::Session;
use crate::topic::FilterToken;
use crate::types::{ClientId, HashMap, QoS};

pub struct Subscription {
    pub session: Weak<Session>,
    pub qos: QoS,
}

#[derive(Default)]
pub struct SubscriptionNode {
    children: HashMap<String, SubscriptionNode>,
    child_plus: Option<Box<SubscriptionNode>>,
    child_pound: Option<Box<SubscriptionNode>>,
    subscribers: Vec<Subscription>,
}

impl SubscriptionNode {
    /// Walks the filter path from this node, creating nodes on demand, and
    /// returns the node the subscription belongs on.
    pub fn deepest_mut(&mut self, tokens: &[FilterToken]) -> &mut SubscriptionNode {
        let mut node = self;
        for token in tokens {
            node = match token {
                FilterToken::MultiWildcard => {
                    node.child_pound.get_or_insert_with(Default::default).as_mut()
                }
                FilterToken::SingleWildcard => {
                    node.child_plus.get_or_insert_with(Default::default).as_mut()
                }
                FilterToken::Literal(s) => node.children.entry(s.clone()).or_default(),
            };
        }
        node
    }

    /// Like [`deepest_mut`](Self::deepest_mut) but never creates nodes;
    /// used by unsubscribe, which must abort on a path that was never
    /// subscribed.
    pub fn find_mut(&mut self, tokens: &[FilterToken]) -> Option<&mut SubscriptionNode> {
        let mut node = self;
        for token in tokens {
            node = match token {
                FilterToken::MultiWildcard => node.child_pound.as_deref_mut()?,
                FilterToken::SingleWildcard => node.child_plus.as_deref_mut()?,
                FilterToken::Literal(s) => node.children.get_mut(s.as_str())?,
            };
        }
        Some(node)
    }

    /// Adds or replaces this session's subscription at this node. A
    /// re-subscribe replaces the stored QoS, upgrade or downgrade alike.
    /// Returns true when the subscription is new.
    pub fn add_subscriber(&mut self, session: &Arc<Session>, qos: QoS) -> bool {
        for sub in self.subscribers.iter_mut() {
            if let Some(existing) = sub.session.upgrade() {
                if existing.client_id() == session.client_id() {
                    sub.session = Arc::downgrade(session);
                    sub.qos = qos;
                    return false;
                }
            }
        }
        self.subscribers.push(Subscription { session: Arc::downgrade(session), qos });
        true
    }

    /// Removes this client's live subscription at this node. Dead weak refs
    /// are left for the sweep. Returns true when something was removed.
    pub fn remove_subscriber(&mut self, client_id: &str) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|sub| match sub.session.upgrade() {
            Some(ses) => ses.client_id() != client_id,
            None => true,
        });
        self.subscribers.len() != before
    }

    /// Invokes `f` once for every subscription matching the publish
    /// subtopics, with the subscription's maximum QoS. At the end of the
    /// path only the node's own subscribers match; before the end, a `#`
    /// child is a terminal match and literal/`+` children recurse.
    pub fn visit_matches<F>(&self, subtopics: &[&str], f: &mut F)
    where
        F: FnMut(&Arc<Session>, QoS),
    {
        if subtopics.is_empty() {
            self.visit_subscribers(f);
            return;
        }
        if let Some(pound) = &self.child_pound {
            pound.visit_subscribers(f);
        }
        if let Some(child) = self.children.get(subtopics[0]) {
            child.visit_matches(&subtopics[1..], f);
        }
        if let Some(plus) = &self.child_plus {
            plus.visit_matches(&subtopics[1..], f);
        }
    }

    fn visit_subscribers<F>(&self, f: &mut F)
    where
        F: FnMut(&Arc<Session>, QoS),
    {
        for sub in &self.subscribers {
            // The weak ref expires when the registry drops the session.
            if let Some(session) = sub.session.upgrade() {
                f(&session, sub.qos);
            }
        }
    }

    /// Bottom-up sweep: drops subscriptions whose session is gone and every
    /// branch left without a direct or transitive subscriber. Returns the
    /// number of live subscribers remaining in this subtree.
    pub fn clean(&mut self) -> usize {
        let mut in_children = 0;
        self.children.retain(|_subtopic, child| {
            let n = child.clean();
            in_children += n;
            n > 0
        });

        for slot in [&mut self.child_plus, &mut self.child_pound] {
            if let Some(node) = slot {
                let n = node.clean();
                in_children += n;
                if n == 0 {
                    log::debug!("dropping empty wildcard child");
                    *slot = None;
                }
            }
        }

        self.subscribers.retain(|sub| sub.session.strong_count() > 0);
        self.subscribers.len() + in_children
    }

    /// Flattens the tree into `(topic_filter, client_id, qos)` rows for the
    /// session snapshot. Dead subscriptions are skipped.
    pub fn collect_subscriptions(
        &self,
        composed: &str,
        at_root: bool,
        out: &mut Vec<(String, ClientId, QoS)>,
    ) {
        for sub in &self.subscribers {
            if let Some(ses) = sub.session.upgrade() {
                out.push((composed.to_string(), ses.client_id().clone(), sub.qos));
            }
        }

        for (subtopic, child) in &self.children {
            let next =
                if at_root { subtopic.clone() } else { format!("{composed}/{subtopic}") };
            child.collect_subscriptions(&next, false, out);
        }
        if let Some(plus) = &self.child_plus {
            let next = if at_root { "+".to_string() } else { format!("{composed}/+") };
            plus.collect_subscriptions(&next, false, out);
        }
        if let Some(pound) = &self.child_pound {
            let next = if at_root { "#".to_string() } else { format!("{composed}/#") };
            pound.collect_subscriptions(&next, false, out);
        }
    }
}
