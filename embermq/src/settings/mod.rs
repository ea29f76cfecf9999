use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, File};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::de::Deserializer;
use serde::Deserialize;

use crate::error::Result;

pub use self::log::Log;

pub mod log;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

/// Command-line overrides applied on top of file and environment sources.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub cfg_name: Option<String>,
    pub workers: Option<usize>,
}

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner {
            workers: 0,
            mqtt: Mqtt::default(),
            auth: Auth::default(),
            persistence: Persistence::default(),
            log: Log::default(),
        }))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/embermq/embermq").required(false))
            .add_source(File::with_name("embermq").required(false))
            .add_source(config::Environment::with_prefix("embermq").separator("__"));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;
        if let Some(workers) = opts.workers {
            inner.workers = workers;
        }
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> Result<&'static Self> {
        Ok(SETTINGS.get().ok_or_else(|| anyhow!("Settings not initialized"))?)
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        Ok(SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))?)
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Settings {{ workers: {}, .. }}", self.workers)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    /// Worker thread count; 0 means one per available CPU.
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub persistence: Persistence,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    /// Capacity of each session's pending-delivery queue.
    #[serde(default = "Mqtt::max_pending_messages_default")]
    pub max_pending_messages: usize,

    /// QoS>0 in-flight window per session.
    #[serde(default = "Mqtt::max_inflight_messages_default")]
    pub max_inflight_messages: usize,

    /// Idle sessions older than this are removed; 0 disables expiry.
    #[serde(default = "Mqtt::expire_sessions_after_seconds_default")]
    pub expire_sessions_after_seconds: u64,

    #[serde(default = "Mqtt::expire_check_interval_default", deserialize_with = "deserialize_duration")]
    pub expire_check_interval: Duration,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            max_pending_messages: Self::max_pending_messages_default(),
            max_inflight_messages: Self::max_inflight_messages_default(),
            expire_sessions_after_seconds: Self::expire_sessions_after_seconds_default(),
            expire_check_interval: Self::expire_check_interval_default(),
        }
    }
}

impl Mqtt {
    fn max_pending_messages_default() -> usize {
        1000
    }
    fn max_inflight_messages_default() -> usize {
        20
    }
    fn expire_sessions_after_seconds_default() -> u64 {
        86_400
    }
    fn expire_check_interval_default() -> Duration {
        Duration::from_secs(300)
    }

    #[inline]
    pub fn expire_sessions_after(&self) -> Duration {
        Duration::from_secs(self.expire_sessions_after_seconds)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Auth {
    /// Path of the salted-SHA-512 password file; empty disables it.
    #[serde(default)]
    pub password_file: String,

    /// Recognized for compatibility: providers are compiled in, so a
    /// configured path without a registered provider refuses to start.
    #[serde(default)]
    pub plugin_path: String,

    /// Whether a username absent from the password file may still log in.
    #[serde(default)]
    pub allow_anonymous: bool,

    /// Serialize provider init/cleanup to one instance broker-wide.
    #[serde(default)]
    pub plugin_serialize_init: bool,

    /// Allow at most one in-flight provider check at a time.
    #[serde(default)]
    pub plugin_serialize_checks: bool,

    /// Options handed to the external provider verbatim.
    #[serde(default)]
    pub plugin_opts: BTreeMap<String, String>,

    #[serde(default = "Auth::password_reload_interval_default", deserialize_with = "deserialize_duration")]
    pub password_reload_interval: Duration,
}

impl Auth {
    fn password_reload_interval_default() -> Duration {
        Duration::from_secs(30)
    }

    #[inline]
    pub fn password_file(&self) -> Option<PathBuf> {
        if self.password_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.password_file))
        }
    }

    #[inline]
    pub fn plugin_opts(&self) -> Vec<(String, String)> {
        self.plugin_opts.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Persistence {
    #[serde(default = "Persistence::enable_default")]
    pub enable: bool,

    #[serde(default = "Persistence::retained_file_default")]
    pub retained_file: String,

    #[serde(default = "Persistence::sessions_file_default")]
    pub sessions_file: String,

    #[serde(default = "Persistence::save_interval_default", deserialize_with = "deserialize_duration")]
    pub save_interval: Duration,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            enable: Self::enable_default(),
            retained_file: Self::retained_file_default(),
            sessions_file: Self::sessions_file_default(),
            save_interval: Self::save_interval_default(),
        }
    }
}

impl Persistence {
    fn enable_default() -> bool {
        true
    }
    fn retained_file_default() -> String {
        "embermq-retained.db".into()
    }
    fn sessions_file_default() -> String {
        "embermq-sessions.db".into()
    }
    fn save_interval_default() -> Duration {
        Duration::from_secs(300)
    }
}

/// A configuration value that stays mutable at runtime (e.g. the log
/// level). Readers clone the current value.
#[derive(Debug)]
pub struct ValueMut<T>(Arc<RwLock<T>>);

impl<T> Clone for ValueMut<T> {
    fn clone(&self) -> Self {
        ValueMut(self.0.clone())
    }
}

impl<T: Clone> ValueMut<T> {
    #[inline]
    pub fn new(v: T) -> Self {
        ValueMut(Arc::new(RwLock::new(v)))
    }

    #[inline]
    pub fn get(&self) -> T {
        self.0.read().clone()
    }

    #[inline]
    pub fn set(&self, v: T) {
        *self.0.write() = v;
    }
}

impl<'de, T: Clone + Deserialize<'de>> Deserialize<'de> for ValueMut<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(ValueMut::new(T::deserialize(deserializer)?))
    }
}

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(embermq_utils::to_duration(&v))
}
