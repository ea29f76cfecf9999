use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type ClientId = bytestring::ByteString;
pub type UserName = bytestring::ByteString;
pub type TopicName = bytestring::ByteString;
pub type TopicFilter = bytestring::ByteString;
pub type Payload = bytes::Bytes;
pub type PacketId = u16;
pub type ConnectionId = u64;
pub type Reason = bytestring::ByteString;

pub type Timestamp = embermq_utils::Timestamp;
pub type TimestampMillis = embermq_utils::TimestampMillis;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<V> = std::collections::HashSet<V, ahash::RandomState>;

/// Channel from the routing core to whatever drives a connection's socket.
pub type Tx = mpsc::UnboundedSender<Message>;
pub type Rx = mpsc::UnboundedReceiver<Message>;

/// What the core hands to a connection's transport driver.
#[derive(Debug, Clone)]
pub enum Message {
    /// An outgoing PUBLISH, already capped to the subscription QoS.
    Forward(Publish),
    /// The connection was evicted by a new connection with the same
    /// client id [MQTT-3.1.4-2]; the transport should close the socket.
    Kick,
}

#[derive(Debug, Default, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn from_u8(v: u8) -> Option<QoS> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// The effective delivery QoS, `min(publish_qos, subscription_qos)`.
    #[inline]
    pub fn least(self, other: QoS) -> QoS {
        if self.value() <= other.value() {
            self
        } else {
            other
        }
    }
}

/// An application message as the routing core sees it: the wire codec has
/// already been dealt with by the transport layer.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Publish {
    pub topic: TopicName,
    pub payload: Payload,
    pub qos: QoS,
    pub retain: bool,
    pub packet_id: Option<PacketId>,
}

impl Publish {
    #[inline]
    pub fn new<T: Into<TopicName>, P: Into<Payload>>(topic: T, payload: P, qos: QoS) -> Publish {
        Publish { topic: topic.into(), payload: payload.into(), qos, retain: false, packet_id: None }
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Outcome of a login or ACL decision.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AuthResult {
    Success,
    LoginDenied,
    AclDenied,
    Error,
}

impl AuthResult {
    /// Maps a provider return code: `0` success, `1` denied, anything else
    /// is an error in the check itself.
    #[inline]
    pub fn from_login_code(code: i32) -> AuthResult {
        match code {
            0 => AuthResult::Success,
            1 => AuthResult::LoginDenied,
            _ => AuthResult::Error,
        }
    }

    #[inline]
    pub fn from_acl_code(code: i32) -> AuthResult {
        match code {
            0 => AuthResult::Success,
            1 => AuthResult::AclDenied,
            _ => AuthResult::Error,
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, AuthResult::Success)
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthResult::Success => "success",
            AuthResult::LoginDenied => "login denied",
            AuthResult::AclDenied => "ACL denied",
            AuthResult::Error => "error in check",
        }
    }
}

/// Kind of access an ACL check asks about; the numeric values are what an
/// external policy provider receives.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(i32)]
pub enum AclAccess {
    Read = 1,
    Write = 2,
    Subscribe = 4,
}

impl AclAccess {
    #[inline]
    pub fn value(&self) -> i32 {
        *self as i32
    }
}
