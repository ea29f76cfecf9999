//! The broker context: one shared handle owning the subscription store,
//! the retained store, authentication and settings, plus the operation
//! flows the transport layer calls into.
//!
//! Lock order on these paths follows the store design: PUBLISH takes the
//! retained lock (write, when the retain bit is set) before the trie read
//! lock; SUBSCRIBE takes the trie write lock and replays retained messages
//! only after it is released.

use std::ops::Deref;
use std::sync::Arc;

use crate::auth::{Authentication, AuthProvider};
use crate::credentials::CredentialStore;
use crate::error::{MqttError, Result};
use crate::persist;
use crate::retain::RetainedMessageStore;
use crate::session::{Connection, RegisterOutcome, SubscriptionStore};
use crate::settings::Settings;
use crate::stats::Stats;
use crate::topic::{self, Filter};
use crate::types::{AclAccess, AuthResult, Publish, QoS};

pub struct BrokerContextBuilder {
    settings: Settings,
    provider: Option<Box<dyn AuthProvider>>,
}

impl Default for BrokerContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerContextBuilder {
    pub fn new() -> BrokerContextBuilder {
        Self { settings: Settings::default(), provider: None }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn provider(mut self, provider: Box<dyn AuthProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Wires the stores and runs the auth startup lifecycle. Provider
    /// version or init failures abort the broker here.
    pub async fn build(self) -> Result<BrokerContext> {
        let settings = self.settings;
        let stats = Arc::new(Stats::new());

        let credentials =
            CredentialStore::new(settings.auth.password_file(), settings.auth.allow_anonymous);
        if credentials.enabled() {
            if let Err(e) = credentials.load_if_changed() {
                log::error!("error loading password file: {e}; authentication won't work");
            }
        }

        if !settings.auth.plugin_path.is_empty() && self.provider.is_none() {
            return Err(MqttError::Fatal(format!(
                "auth plugin '{}' configured but providers are compiled in; register one on the builder",
                settings.auth.plugin_path
            )));
        }

        let mut auth = Authentication::new(
            credentials,
            settings.auth.plugin_opts(),
            settings.auth.plugin_serialize_init,
            settings.auth.plugin_serialize_checks,
        );
        if let Some(provider) = self.provider {
            auth = auth.with_provider(provider)?;
        }
        auth.init().await?;
        auth.security_init(false).await?;

        let store = SubscriptionStore::new(
            stats.clone(),
            settings.mqtt.max_pending_messages,
            settings.mqtt.max_inflight_messages,
        );

        Ok(BrokerContext {
            inner: Arc::new(BrokerContextInner {
                settings,
                store,
                retained: RetainedMessageStore::new(),
                auth,
                stats,
            }),
        })
    }
}

#[derive(Clone)]
pub struct BrokerContext {
    inner: Arc<BrokerContextInner>,
}

pub struct BrokerContextInner {
    pub settings: Settings,
    pub store: SubscriptionStore,
    pub retained: RetainedMessageStore,
    pub auth: Authentication,
    pub stats: Arc<Stats>,
}

impl Deref for BrokerContext {
    type Target = BrokerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl BrokerContext {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> BrokerContextBuilder {
        BrokerContextBuilder::new()
    }

    /// CONNECT, after the transport authenticated the client: binds the
    /// connection to its session, evicting any prior holder of the id.
    pub async fn handle_connect(&self, conn: &Arc<Connection>) -> Result<RegisterOutcome> {
        self.store.register(conn).await
    }

    /// Login check for CONNECT. The credential store decides first; only
    /// its success is forwarded to the external provider.
    pub async fn handle_login(&self, username: &str, password: &str) -> AuthResult {
        self.auth.login(username, password).await
    }

    /// PUBLISH: ACL, retained update, fan-out. Returns the number of
    /// sessions the message was routed to.
    pub async fn handle_publish(
        &self,
        client_id: &str,
        username: &str,
        publish: Publish,
    ) -> Result<usize> {
        topic::validate_name(&publish.topic)?;

        let acl = self.auth.acl_check(client_id, username, &publish.topic, AclAccess::Write).await;
        if !acl.success() {
            log::debug!("publish to '{}' by '{client_id}' rejected: {}", publish.topic, acl.as_str());
            return Err(MqttError::NotAuthorized);
        }

        if publish.retain {
            self.retained.set(&publish.topic, publish.payload.clone(), publish.qos).await?;
        }

        Ok(self.store.publish(&publish).await)
    }

    /// SUBSCRIBE: ACL, trie insert, retained replay. Returns the number of
    /// retained messages replayed to the subscriber.
    pub async fn handle_subscribe(
        &self,
        client_id: &str,
        username: &str,
        topic_filter: &str,
        qos: QoS,
    ) -> Result<usize> {
        let filter: Filter = topic_filter.parse()?;

        let acl = self.auth.acl_check(client_id, username, topic_filter, AclAccess::Subscribe).await;
        if !acl.success() {
            log::debug!("subscribe to '{topic_filter}' by '{client_id}' rejected: {}", acl.as_str());
            return Err(MqttError::NotAuthorized);
        }

        let Some(session) = self.store.add_subscription(client_id, &filter, qos).await else {
            return Err(MqttError::Protocol(format!(
                "subscribe from client '{client_id}' without a registered session"
            )));
        };

        // Replay after the trie write lock is released; only the retained
        // read lock is held here.
        let replayed = self
            .retained
            .fetch_for_subscribe(&filter, qos, |topic_name, payload, eff_qos| {
                let publish = Publish::new(topic_name.clone(), payload.clone(), eff_qos);
                session.deliver(&publish, eff_qos, true);
            })
            .await;
        Ok(replayed)
    }

    pub async fn handle_unsubscribe(&self, client_id: &str, topic_filter: &str) -> Result<bool> {
        let filter: Filter = topic_filter.parse()?;
        Ok(self.store.remove_subscription(client_id, &filter).await)
    }

    /// The periodic session-expiry pass: removes idle sessions, then
    /// rebuilds the subscription tree.
    pub async fn expire_sessions(&self) -> usize {
        self.store.expire_sessions(self.settings.mqtt.expire_sessions_after()).await
    }

    /// Saves both snapshot files. Errors are returned so the scheduler can
    /// log them and retry on the next tick.
    pub async fn save_state(&self) -> Result<()> {
        persist::save_retained(&self.retained, &self.settings.persistence.retained_file).await?;
        persist::save_sessions(&self.store, &self.settings.persistence.sessions_file).await?;
        Ok(())
    }

    /// Best-effort restore at startup; missing files only warn.
    pub async fn load_state(&self) -> Result<()> {
        persist::load_retained(&self.retained, &self.settings.persistence.retained_file).await?;
        persist::load_sessions(&self.store, &self.settings.persistence.sessions_file).await?;
        Ok(())
    }

    /// SIGHUP-style reload: the provider's security lifecycle plus the
    /// password file.
    pub async fn reload(&self) {
        self.auth.reload().await;
        if let Err(e) = self.auth.reload_credentials() {
            log::error!("password file reload failed: {e}");
        }
    }

    /// Flags shutdown: provider init/reload become no-ops, in-flight checks
    /// run to completion.
    pub fn shutdown_begin(&self) {
        self.auth.set_quitting();
    }
}
