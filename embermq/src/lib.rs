#![deny(unsafe_code)]

//! # embermq
//!
//! The routing and session core of an MQTT v3.1.1 broker: the in-memory
//! state machine mapping topics to sessions, retained-message semantics,
//! per-session delivery, credential and ACL checks, and snapshot
//! persistence. Transport listeners and the wire codec live outside this
//! crate; they speak to it through [`session::Connection`] channels and the
//! [`context::BrokerContext`] operation methods.
//!
//! ```rust,no_run
//! use embermq::context::BrokerContext;
//! use embermq::settings::Settings;
//! use embermq::worker::Workers;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> embermq::Result<()> {
//!     let ctx = BrokerContext::new().settings(Settings::default()).build().await?;
//!     ctx.load_state().await?;
//!     let workers = Workers::start(ctx.clone(), 0)?;
//!     // ... hand accepted connections to workers.assign(..) ...
//!     # drop(workers);
//!     Ok(())
//! }
//! ```

/// Authentication and authorization
pub mod auth; // credential chain + external policy provider facade
pub mod credentials; // salted-SHA-512 password file store

/// Routing state
pub mod retain; // retained-message tree
pub mod session; // sessions, connections, the subscription store
pub mod trie; // subscription tree nodes

/// Topic handling
pub mod topic; // topic names, filter parsing and matching

/// Delivery plumbing
pub mod inflight; // per-session QoS>0 window
pub mod queue; // per-session pending queue

/// Runtime
pub mod context; // shared broker context and operation flows
pub mod worker; // pinned worker threads and maintenance schedule

/// Ambient services
pub mod logger; // slog pipeline behind the log facade
pub mod persist; // snapshot save/restore
pub mod settings; // configuration
pub mod stats; // broker-wide counters

pub mod error;
pub mod types;

pub use error::{MqttError, Result};
pub use types::{AclAccess, AuthResult, Publish, QoS};

pub use embermq_utils as utils;
