//! Sessions, connections and the subscription store.
//!
//! A [`Session`] outlives the transport [`Connection`]s that serve it: the
//! registry holds sessions strongly, connections belong to their worker,
//! and the two reference each other weakly. The [`SubscriptionStore`] keeps
//! the session registry and both subscription-tree roots under a single
//! reader-writer lock, because registering a client must atomically evict
//! the previous holder of the client id and later sweeps must see a
//! consistent registry+tree pair.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};

use embermq_utils::timestamp_millis;

use crate::error::{MqttError, Result};
use crate::inflight::{Inflight, InflightMessage};
use crate::queue::{DropPolicy, PendingQueue};
use crate::stats::Stats;
use crate::topic::{self, Filter};
use crate::trie::SubscriptionNode;
use crate::types::*;

/// MQTT-3.1.2-24: the server waits one and a half keep-alive periods.
const KEEP_ALIVE_GRACE_NUM: u32 = 3;
const KEEP_ALIVE_GRACE_DEN: u32 = 2;

/// A transport connection as the core sees it. The socket itself lives in
/// the I/O layer, which consumes the [`Rx`] side of the channel; the core
/// only ever enqueues.
pub struct Connection {
    pub id: ConnectionId,
    pub client_id: ClientId,
    pub clean_session: bool,
    pub keep_alive: Duration,
    tx: Tx,
    worker: AtomicUsize,
    disconnecting: AtomicBool,
    last_activity: AtomicI64,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        client_id: ClientId,
        clean_session: bool,
        keep_alive: Duration,
    ) -> (Arc<Connection>, Rx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            id,
            client_id,
            clean_session,
            keep_alive,
            tx,
            worker: AtomicUsize::new(usize::MAX),
            disconnecting: AtomicBool::new(false),
            last_activity: AtomicI64::new(timestamp_millis()),
        });
        (conn, rx)
    }

    #[inline]
    pub fn send(&self, msg: Message) -> Result<(), Message> {
        self.tx.send(msg).map_err(|e| {
            // The transport side is gone; nobody will read this socket again.
            self.disconnecting.store(true, Ordering::SeqCst);
            e.0
        })
    }

    #[inline]
    fn forward(&self, publish: Publish) -> Result<(), Publish> {
        self.send(Message::Forward(publish)).map_err(|m| match m {
            Message::Forward(p) => p,
            _ => unreachable!(),
        })
    }

    /// Marks the connection as going away and tells the transport to close
    /// the socket. Used for session takeover and keep-alive expiry.
    #[inline]
    pub fn kick(&self) {
        self.disconnecting.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Message::Kick);
    }

    #[inline]
    pub fn mark_disconnecting(&self) {
        self.disconnecting.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn touch(&self) {
        self.last_activity.store(timestamp_millis(), Ordering::SeqCst);
    }

    #[inline]
    pub fn keep_alive_expired(&self) -> bool {
        if self.keep_alive.is_zero() {
            return false;
        }
        let grace = self.keep_alive * KEEP_ALIVE_GRACE_NUM / KEEP_ALIVE_GRACE_DEN;
        let idle = timestamp_millis() - self.last_activity.load(Ordering::SeqCst);
        idle >= grace.as_millis() as i64
    }

    #[inline]
    pub(crate) fn set_worker(&self, id: usize) {
        self.worker.store(id, Ordering::SeqCst);
    }

    #[inline]
    pub fn worker(&self) -> Option<usize> {
        match self.worker.load(Ordering::SeqCst) {
            usize::MAX => None,
            id => Some(id),
        }
    }
}

/// Client state that survives transport disconnects (absent clean-session):
/// the pending queue, the in-flight window and the identity itself.
pub struct Session {
    client_id: ClientId,
    clean_session: bool,
    pending: PendingQueue,
    inflight: Mutex<Inflight>,
    conn: Mutex<Weak<Connection>>,
    last_touch: AtomicI64,
}

impl Session {
    pub fn new(
        client_id: ClientId,
        clean_session: bool,
        max_pending: usize,
        max_inflight: usize,
    ) -> Session {
        Session {
            client_id,
            clean_session,
            pending: PendingQueue::new(max_pending, DropPolicy::Incoming),
            inflight: Mutex::new(Inflight::new(max_inflight)),
            conn: Mutex::new(Weak::new()),
            last_touch: AtomicI64::new(timestamp_millis()),
        }
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[inline]
    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[inline]
    pub fn touch(&self) {
        self.last_touch.store(timestamp_millis(), Ordering::SeqCst);
    }

    /// A session with a live connection never expires; activity keeps the
    /// touch stamp fresh for the offline case.
    #[inline]
    pub fn has_expired(&self, after: Duration) -> bool {
        if after.is_zero() || self.connection().is_some() {
            return false;
        }
        let idle = timestamp_millis() - self.last_touch.load(Ordering::SeqCst);
        idle >= after.as_millis() as i64
    }

    /// The live connection currently bound to this session, if any.
    #[inline]
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.lock().upgrade().filter(|c| !c.is_disconnecting())
    }

    /// Binds a new connection, moving any unacknowledged in-flight messages
    /// back to the head of the pending queue for redelivery.
    pub(crate) fn bind(&self, conn: &Arc<Connection>) {
        let unacked = self.inflight.lock().drain();
        for m in unacked.into_iter().rev() {
            let mut publish = m.publish;
            publish.packet_id = None;
            self.pending.push_front(publish);
        }
        *self.conn.lock() = Arc::downgrade(conn);
        self.touch();
    }

    /// Queues one message toward this session at `min(publish.qos, max_qos)`.
    /// `retained` is true only for retained replay on subscribe; normal
    /// fan-out clears the retain flag. Returns true when the message was
    /// sent or parked for later delivery.
    pub fn deliver(&self, publish: &Publish, max_qos: QoS, retained: bool) -> bool {
        let mut msg = publish.clone();
        msg.qos = publish.qos.least(max_qos);
        msg.retain = retained;
        msg.packet_id = None;
        self.touch();

        let Some(conn) = self.connection() else {
            if msg.qos != QoS::AtMostOnce && !self.clean_session {
                return self.park(msg);
            }
            return false;
        };

        match self.transmit(&conn, msg) {
            Ok(()) => true,
            Err(msg) => {
                if msg.qos != QoS::AtMostOnce {
                    self.park(msg)
                } else {
                    false
                }
            }
        }
    }

    /// Hands a message to the connection, claiming an in-flight slot for
    /// QoS>0. `Err` returns the message when the window is full or the
    /// transport is gone.
    fn transmit(&self, conn: &Arc<Connection>, mut msg: Publish) -> Result<(), Publish> {
        if msg.qos != QoS::AtMostOnce {
            let mut inflight = self.inflight.lock();
            if !inflight.has_credit() {
                return Err(msg);
            }
            match inflight.next_id() {
                Ok(id) => {
                    msg.packet_id = Some(id);
                    inflight.push(InflightMessage::new(msg.clone()));
                }
                Err(e) => {
                    log::warn!("'{}': {}", self.client_id, e);
                    return Err(msg);
                }
            }
        }
        match conn.forward(msg) {
            Ok(()) => Ok(()),
            Err(mut msg) => {
                if let Some(id) = msg.packet_id.take() {
                    self.inflight.lock().ack(&id);
                }
                Err(msg)
            }
        }
    }

    fn park(&self, msg: Publish) -> bool {
        match self.pending.push(msg) {
            Ok(None) => true,
            Ok(Some(_dropped)) => {
                log::debug!("pending queue full for '{}', dropped the oldest message", self.client_id);
                true
            }
            Err(_msg) => {
                log::debug!("pending queue full for '{}', dropping the message", self.client_id);
                false
            }
        }
    }

    /// Acknowledges an in-flight packet and pulls the next parked message
    /// into the freed slot. Returns false for unknown packet ids.
    pub fn ack(&self, packet_id: PacketId) -> bool {
        let acked = self.inflight.lock().ack(&packet_id).is_some();
        if acked {
            self.touch();
            self.flush_pending();
        }
        acked
    }

    /// Moves parked messages onto the live connection while the in-flight
    /// window has credit. Returns the number flushed.
    pub fn flush_pending(&self) -> usize {
        let mut count = 0;
        while let Some(conn) = self.connection() {
            let Some(msg) = self.pending.pop() else {
                break;
            };
            match self.transmit(&conn, msg) {
                Ok(()) => count += 1,
                Err(msg) => {
                    self.pending.push_front(msg);
                    break;
                }
            }
        }
        count
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Deep copy of everything still owed to this client: unacknowledged
    /// in-flight messages first, then the parked queue.
    pub fn queued_messages(&self) -> Vec<Publish> {
        let mut out: Vec<Publish> = self
            .inflight
            .lock()
            .messages()
            .into_iter()
            .map(|m| {
                let mut p = m.publish;
                p.packet_id = None;
                p
            })
            .collect();
        out.extend(self.pending.snapshot());
        out
    }

    pub(crate) fn restore_pending(&self, messages: Vec<Publish>) {
        for msg in messages {
            let _ = self.pending.push(msg);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_touch(&self, t: TimestampMillis) {
        self.last_touch.store(t, Ordering::SeqCst);
    }
}

/// What [`SubscriptionStore::register`] tells the transport layer.
pub struct RegisterOutcome {
    pub session: Arc<Session>,
    /// Goes into the CONNACK: a prior session existed and clean-session
    /// was not requested.
    pub session_present: bool,
    /// A previous connection with the same client id was kicked
    /// [MQTT-3.1.4-2].
    pub evicted: bool,
    /// Messages flushed from the pending queue to the new connection.
    pub flushed: usize,
}

struct StoreInner {
    root: SubscriptionNode,
    root_dollar: SubscriptionNode,
    sessions: HashMap<ClientId, Arc<Session>>,
}

/// Session registry plus subscription tree, one lock for both.
pub struct SubscriptionStore {
    inner: RwLock<StoreInner>,
    stats: Arc<Stats>,
    max_pending: usize,
    max_inflight: usize,
}

impl SubscriptionStore {
    pub fn new(stats: Arc<Stats>, max_pending: usize, max_inflight: usize) -> SubscriptionStore {
        SubscriptionStore {
            inner: RwLock::new(StoreInner {
                root: SubscriptionNode::default(),
                root_dollar: SubscriptionNode::default(),
                sessions: HashMap::default(),
            }),
            stats,
            max_pending,
            max_inflight,
        }
    }

    /// Binds a connection to its session, creating or replacing the session
    /// as clean-session demands and evicting any previous connection that
    /// holds the same client id.
    pub async fn register(&self, conn: &Arc<Connection>) -> Result<RegisterOutcome> {
        if conn.client_id.is_empty() {
            return Err(MqttError::Protocol("trying to register a client without an id".into()));
        }

        let mut inner = self.inner.write().await;

        let prior = inner.sessions.get(&conn.client_id).cloned();
        let mut evicted = false;
        if let Some(prior) = &prior {
            if let Some(old) = prior.connection() {
                log::info!("disconnecting existing client with id '{}'", conn.client_id);
                old.kick();
                evicted = true;
            }
        }

        let session_present = prior.is_some() && !conn.clean_session;
        let session = match prior {
            Some(prior) if !conn.clean_session => prior,
            _ => {
                let fresh = Arc::new(Session::new(
                    conn.client_id.clone(),
                    conn.clean_session,
                    self.max_pending,
                    self.max_inflight,
                ));
                // Replacing drops the old Arc; the trie's weak refs to it
                // die with it and the next sweep reclaims the nodes.
                if inner.sessions.insert(conn.client_id.clone(), fresh.clone()).is_none() {
                    self.stats.sessions.inc();
                }
                fresh
            }
        };

        session.bind(conn);
        let flushed = session.flush_pending();

        Ok(RegisterOutcome { session, session_present, evicted, flushed })
    }

    /// True when a live session exists for the id. Touches the session so a
    /// concurrent expiry sweep cannot delete it between this check and the
    /// caller's next use.
    pub async fn session_present(&self, client_id: &str) -> bool {
        let inner = self.inner.read().await;
        match inner.sessions.get(client_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub async fn session(&self, client_id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.sessions.get(client_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn remove_session(&self, client_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        log::debug!("removing session of client '{client_id}'");
        if inner.sessions.remove(client_id).is_some() {
            self.stats.sessions.dec();
            true
        } else {
            false
        }
    }

    /// Installs (or re-installs, replacing the QoS) a subscription for a
    /// registered client. Returns the session so the caller can replay
    /// retained messages to it; `None` when no session holds the id.
    pub async fn add_subscription(
        &self,
        client_id: &str,
        filter: &Filter,
        qos: QoS,
    ) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get(client_id).cloned()?;
        let root = if filter.is_dollar() { &mut inner.root_dollar } else { &mut inner.root };
        if root.deepest_mut(filter.tokens()).add_subscriber(&session, qos) {
            self.stats.subscriptions.inc();
        }
        Some(session)
    }

    pub async fn remove_subscription(&self, client_id: &str, filter: &Filter) -> bool {
        let mut inner = self.inner.write().await;
        let root = if filter.is_dollar() { &mut inner.root_dollar } else { &mut inner.root };
        let Some(node) = root.find_mut(filter.tokens()) else {
            return false;
        };
        let removed = node.remove_subscriber(client_id);
        if removed {
            self.stats.subscriptions.dec();
        }
        removed
    }

    /// Fans a PUBLISH out to every matching subscription, at
    /// `min(publish_qos, subscription_qos)` and with the retain flag
    /// cleared. Returns the number of sessions it was sent or queued to.
    pub async fn publish(&self, publish: &Publish) -> usize {
        let inner = self.inner.read().await;
        let root = if topic::is_dollar(&publish.topic) { &inner.root_dollar } else { &inner.root };
        let subtopics = topic::split(&publish.topic);

        let mut count = 0;
        root.visit_matches(&subtopics, &mut |session, max_qos| {
            if session.deliver(publish, max_qos, false) {
                count += 1;
            }
        });
        count
    }

    /// Drops dead subscriptions and empty branches from both roots and
    /// refreshes the subscription counter.
    pub async fn sweep(&self) -> usize {
        let mut inner = self.inner.write().await;
        let remaining = inner.root.clean() + inner.root_dollar.clean();
        self.stats.subscriptions.current_set(remaining as isize);
        remaining
    }

    /// Removes sessions idle beyond the threshold, then rebuilds the tree.
    pub async fn expire_sessions(&self, after: Duration) -> usize {
        let mut inner = self.inner.write().await;
        log::info!("cleaning out old sessions");

        let before = inner.sessions.len();
        inner.sessions.retain(|_, session| {
            if session.has_expired(after) {
                log::debug!("removing expired session from store {}", session.client_id());
                false
            } else {
                true
            }
        });
        let removed = before - inner.sessions.len();
        self.stats.sessions.decs(removed as isize);

        log::info!("rebuilding subscription tree");
        let remaining = inner.root.clean() + inner.root_dollar.clean();
        self.stats.subscriptions.current_set(remaining as isize);

        removed
    }

    /// Deep value-copy of every session and a flattened subscription table,
    /// taken under one read lock. Serialization happens without the lock.
    #[allow(clippy::type_complexity)]
    pub async fn snapshot_state(
        &self,
    ) -> (Vec<(ClientId, bool, Vec<Publish>)>, Vec<(String, ClientId, QoS)>) {
        let inner = self.inner.read().await;

        let sessions = inner
            .sessions
            .values()
            .map(|s| (s.client_id().clone(), s.clean_session(), s.queued_messages()))
            .collect();

        let mut subscriptions = Vec::new();
        inner.root.collect_subscriptions("", true, &mut subscriptions);
        inner.root_dollar.collect_subscriptions("", true, &mut subscriptions);

        (sessions, subscriptions)
    }

    pub async fn restore_session(&self, client_id: ClientId, clean_session: bool, pending: Vec<Publish>) {
        let mut inner = self.inner.write().await;
        let session = Arc::new(Session::new(
            client_id.clone(),
            clean_session,
            self.max_pending,
            self.max_inflight,
        ));
        session.restore_pending(pending);
        if inner.sessions.insert(client_id, session).is_none() {
            self.stats.sessions.inc();
        }
    }

    /// Re-installs a restored subscription. Returns false (dropping the
    /// row) when the client id is not in the restored session table.
    pub async fn restore_subscription(&self, client_id: &str, filter: &Filter, qos: QoS) -> bool {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get(client_id).cloned() else {
            return false;
        };
        let root = if filter.is_dollar() { &mut inner.root_dollar } else { &mut inner.root };
        if root.deepest_mut(filter.tokens()).add_subscriber(&session, qos) {
            self.stats.subscriptions.inc();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn store() -> SubscriptionStore {
        SubscriptionStore::new(Arc::new(Stats::new()), 64, 16)
    }

    fn conn(id: ConnectionId, client_id: &str, clean: bool) -> (Arc<Connection>, Rx) {
        Connection::new(id, client_id.into(), clean, Duration::from_secs(60))
    }

    fn filter(s: &str) -> Filter {
        s.parse().unwrap()
    }

    fn recv_forward(rx: &mut Rx) -> Option<Publish> {
        match rx.try_recv() {
            Ok(Message::Forward(p)) => Some(p),
            _ => None,
        }
    }

    #[tokio::test]
    async fn register_requires_client_id() {
        let store = store();
        let (c, _rx) = conn(1, "", false);
        assert!(matches!(store.register(&c).await, Err(MqttError::Protocol(_))));
    }

    #[tokio::test]
    async fn wildcard_delivery() {
        let store = store();
        let (c, mut rx) = conn(1, "a", false);
        store.register(&c).await.unwrap();
        store.add_subscription("a", &filter("sensors/+/temp"), QoS::AtLeastOnce).await.unwrap();

        // S1: qos is min(publish, subscription), retain cleared.
        let publish = Publish::new("sensors/kitchen/temp", "22", QoS::AtMostOnce);
        assert_eq!(store.publish(&publish).await, 1);

        let got = recv_forward(&mut rx).unwrap();
        assert_eq!(got.topic, "sensors/kitchen/temp");
        assert_eq!(&got.payload[..], b"22");
        assert_eq!(got.qos, QoS::AtMostOnce);
        assert!(!got.retain);

        assert_eq!(store.publish(&Publish::new("sensors/kitchen/hum", "x", QoS::AtMostOnce)).await, 0);
    }

    #[tokio::test]
    async fn dollar_topics_hidden_from_pound() {
        let store = store();
        let (c, mut rx) = conn(1, "b", false);
        store.register(&c).await.unwrap();
        store.add_subscription("b", &filter("#"), QoS::AtMostOnce).await.unwrap();

        // S2: $SYS does not reach the # subscriber, a plain topic does.
        assert_eq!(store.publish(&Publish::new("$SYS/uptime", "x", QoS::AtMostOnce)).await, 0);
        assert_eq!(store.publish(&Publish::new("foo/bar", "y", QoS::AtMostOnce)).await, 1);
        let got = recv_forward(&mut rx).unwrap();
        assert_eq!(got.topic, "foo/bar");
        assert!(recv_forward(&mut rx).is_none());

        store.add_subscription("b", &filter("$SYS/#"), QoS::AtMostOnce).await.unwrap();
        assert_eq!(store.publish(&Publish::new("$SYS/uptime", "x", QoS::AtMostOnce)).await, 1);
    }

    #[tokio::test]
    async fn session_takeover_kicks_old_connection() {
        let store = store();
        let (c1, mut rx1) = conn(1, "k", false);
        let out = store.register(&c1).await.unwrap();
        assert!(!out.session_present);
        assert!(!out.evicted);

        let (c2, _rx2) = conn(2, "k", false);
        let out = store.register(&c2).await.unwrap();
        assert!(out.session_present);
        assert!(out.evicted);
        assert!(c1.is_disconnecting());
        assert!(matches!(rx1.try_recv(), Ok(Message::Kick)));

        // One live session per client id.
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn queued_messages_survive_reconnect() {
        let store = store();
        let (c1, rx1) = conn(1, "k", false);
        store.register(&c1).await.unwrap();
        store.add_subscription("k", &filter("t"), QoS::AtLeastOnce).await.unwrap();

        // Transport-only disconnect.
        drop(rx1);
        drop(c1);

        // S5: the publish lands in the session's pending queue.
        assert_eq!(store.publish(&Publish::new("t", "m1", QoS::AtLeastOnce)).await, 1);
        assert_eq!(store.session("k").await.unwrap().pending_len(), 1);

        let (c2, mut rx2) = conn(2, "k", false);
        let out = store.register(&c2).await.unwrap();
        assert!(out.session_present);
        assert_eq!(out.flushed, 1);
        let got = recv_forward(&mut rx2).unwrap();
        assert_eq!(&got.payload[..], b"m1");
        assert_eq!(got.qos, QoS::AtLeastOnce);
        assert!(got.packet_id.is_some());
    }

    #[tokio::test]
    async fn clean_session_wipes_state() {
        let store = store();
        let (c1, rx1) = conn(1, "k", false);
        store.register(&c1).await.unwrap();
        store.add_subscription("k", &filter("t"), QoS::AtLeastOnce).await.unwrap();
        drop(rx1);
        drop(c1);
        store.publish(&Publish::new("t", "m1", QoS::AtLeastOnce)).await;

        // S6: clean reconnect delivers nothing and reports no session.
        let (c2, mut rx2) = conn(2, "k", true);
        let out = store.register(&c2).await.unwrap();
        assert!(!out.session_present);
        assert_eq!(out.flushed, 0);
        assert!(matches!(rx2.try_recv(), Err(TryRecvError::Empty)));

        // The old session died with the replacement; the sweep prunes its
        // subscription and the tree is empty again.
        assert_eq!(store.sweep().await, 0);
        assert_eq!(store.publish(&Publish::new("t", "m2", QoS::AtLeastOnce)).await, 0);
    }

    #[tokio::test]
    async fn qos_zero_not_queued_offline() {
        let store = store();
        let (c1, rx1) = conn(1, "k", false);
        store.register(&c1).await.unwrap();
        store.add_subscription("k", &filter("t"), QoS::ExactlyOnce).await.unwrap();
        drop(rx1);
        drop(c1);

        assert_eq!(store.publish(&Publish::new("t", "m", QoS::AtMostOnce)).await, 0);
        assert_eq!(store.session("k").await.unwrap().pending_len(), 0);
    }

    #[tokio::test]
    async fn inflight_window_parks_overflow() {
        let store = SubscriptionStore::new(Arc::new(Stats::new()), 64, 2);
        let (c, mut rx) = conn(1, "k", false);
        store.register(&c).await.unwrap();
        store.add_subscription("k", &filter("t"), QoS::AtLeastOnce).await.unwrap();

        for n in 0..4u8 {
            store.publish(&Publish::new("t", vec![n], QoS::AtLeastOnce)).await;
        }
        let session = store.session("k").await.unwrap();
        assert_eq!(session.pending_len(), 2);

        // Acking the first frees a slot and pulls the next parked message.
        let first = recv_forward(&mut rx).unwrap();
        assert!(session.ack(first.packet_id.unwrap()));
        assert_eq!(session.pending_len(), 1);
    }

    #[tokio::test]
    async fn session_present_touches() {
        let store = store();
        let (c, _rx) = conn(1, "k", false);
        store.register(&c).await.unwrap();

        assert!(store.session_present("k").await);
        assert!(!store.session_present("missing").await);
    }

    #[tokio::test]
    async fn expire_idle_sessions() {
        let store = store();
        let (c, rx) = conn(1, "idle", false);
        store.register(&c).await.unwrap();
        store.add_subscription("idle", &filter("t/#"), QoS::AtMostOnce).await.unwrap();
        drop(rx);
        drop(c);

        let session = store.session("idle").await.unwrap();
        session.set_last_touch(timestamp_millis() - 10_000);
        drop(session);

        // Not old enough yet.
        assert_eq!(store.expire_sessions(Duration::from_secs(60)).await, 0);
        assert_eq!(store.expire_sessions(Duration::from_secs(5)).await, 1);
        assert!(!store.session_present("idle").await);
        assert_eq!(store.sweep().await, 0);
    }

    #[tokio::test]
    async fn remove_session_by_id() {
        let store = store();
        let (c1, _rx1) = conn(1, "a", false);
        let (c2, _rx2) = conn(2, "b", false);
        store.register(&c1).await.unwrap();
        store.register(&c2).await.unwrap();

        assert!(store.remove_session("b").await);
        assert!(!store.remove_session("b").await);
        assert!(store.session_present("a").await);
    }

    #[tokio::test]
    async fn resubscribe_last_write_wins() {
        let store = store();
        let (c, mut rx) = conn(1, "a", false);
        store.register(&c).await.unwrap();
        store.add_subscription("a", &filter("t"), QoS::ExactlyOnce).await.unwrap();
        store.add_subscription("a", &filter("t"), QoS::AtMostOnce).await.unwrap();

        store.publish(&Publish::new("t", "m", QoS::ExactlyOnce)).await;
        let got = recv_forward(&mut rx).unwrap();
        assert_eq!(got.qos, QoS::AtMostOnce);
        assert!(recv_forward(&mut rx).is_none());
    }

    #[test]
    fn keep_alive_grace() {
        let (c, _rx) = Connection::new(1, "k".into(), false, Duration::from_millis(100));
        assert!(!c.keep_alive_expired());
        c.last_activity.store(timestamp_millis() - 200, Ordering::SeqCst);
        assert!(c.keep_alive_expired());

        let (c, _rx) = Connection::new(2, "k".into(), false, Duration::ZERO);
        c.last_activity.store(timestamp_millis() - 10_000, Ordering::SeqCst);
        assert!(!c.keep_alive_expired());
    }
}
