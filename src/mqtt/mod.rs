//! # MQTT Broker Session Module
//!
//! Manages the single authenticated, encrypted session between the device
//! and its private broker. The module owns everything between "the network
//! is up" and "a command payload is in hand":
//!
//! ```text
//! mqtt/
//! ├── error.rs    - categorized session failure causes
//! └── session.rs  - reachability probe, handshake, subscription, drain, ping
//! ```
//!
//! ## Design Philosophy
//!
//! - **Probe before handshake**: a plain socket probe runs before any TLS
//!   work, so "network path down" and "broker rejected us" stay
//!   distinguishable — they call for different remediation.
//! - **One session, one owner**: the supervisor holds the session through
//!   the [`BrokerLink`] trait; at most one session is active, and the old
//!   handle is dropped before a replacement is created.
//! - **Non-blocking drain**: inbound messages are pulled as a finite batch
//!   once per control-loop iteration instead of through free-floating
//!   callbacks.
//! - **Protocol work stays in the library**: framing, TLS, and MQTT
//!   keepalive belong to `rumqttc`; this module only orchestrates it.

pub mod error;
pub mod session;

pub use error::BrokerError;
pub use session::{BrokerLink, MqttBrokerSession};
