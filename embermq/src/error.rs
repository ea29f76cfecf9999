use std::str::Utf8Error;

use config::ConfigError;
use thiserror::Error;

pub type Result<T, E = MqttError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum MqttError {
    /// MQTT-level violation by a client, closes the offending connection.
    #[error("protocol error, {0}")]
    Protocol(String),
    /// Invalid topic name or topic filter.
    #[error("topic error, {0}")]
    Topic(String),
    /// The broker cannot start, e.g. an unusable auth provider.
    #[error("fatal, {0}")]
    Fatal(String),
    /// A provider lifecycle call or check returned a non-zero code.
    #[error("auth provider error, {0}")]
    AuthProvider(String),
    /// Login or ACL check was denied.
    #[error("not authorized")]
    NotAuthorized,
    /// A snapshot file could not be opened or has an unusable format.
    #[error("persistence error, {0}")]
    Persistence(String),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("utf8 error, {0}")]
    Utf8Error(#[from] Utf8Error),
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("{0}")]
    Msg(String),
}

impl From<anyhow::Error> for MqttError {
    #[inline]
    fn from(e: anyhow::Error) -> Self {
        MqttError::Anyhow(e)
    }
}

impl From<String> for MqttError {
    #[inline]
    fn from(e: String) -> Self {
        MqttError::Msg(e)
    }
}

impl From<&str> for MqttError {
    #[inline]
    fn from(e: &str) -> Self {
        MqttError::Msg(e.to_string())
    }
}

impl From<bincode::Error> for MqttError {
    #[inline]
    fn from(e: bincode::Error) -> Self {
        MqttError::Persistence(e.to_string())
    }
}
