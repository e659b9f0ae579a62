//! Categorized broker session failures.

use std::time::Duration;
use thiserror::Error;

/// Failure causes for broker session operations.
///
/// The categories mirror what the supervisor can act on: reachability
/// problems are retried quietly, broker verdicts are logged with guidance,
/// and both feed the same bounded-retry policy.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The plain-socket probe failed; no handshake was attempted
    #[error("broker not reachable at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// The broker refused the connection without a more specific verdict
    #[error("connection refused by broker")]
    Refused,

    /// Username/password rejected or not authorized
    #[error("broker rejected credentials")]
    BadCredentials,

    /// The broker does not speak our protocol revision
    #[error("broker rejected protocol version")]
    ProtocolMismatch,

    /// The broker refused our client identifier
    #[error("broker rejected client identifier")]
    IdentifierRejected,

    /// The broker is up but not taking sessions
    #[error("broker service unavailable")]
    ServerUnavailable,

    /// No CONNACK arrived within the handshake window
    #[error("no CONNACK from broker within {0:?}")]
    HandshakeTimeout(Duration),

    /// The broker acknowledged the subscription with a failure code
    #[error("broker rejected subscription to {0}")]
    SubscribeRejected(String),

    /// `subscribe` was called twice on one open session
    #[error("session already holds a subscription")]
    AlreadySubscribed,

    /// An operation was attempted without an open session
    #[error("no open broker session")]
    NotOpen,

    /// The established transport failed mid-session
    #[error("transport failure: {0}")]
    Transport(String),
}

impl BrokerError {
    /// True for network-path problems, false for broker verdicts.
    pub fn is_reachability(&self) -> bool {
        matches!(
            self,
            BrokerError::Unreachable { .. }
                | BrokerError::HandshakeTimeout(_)
                | BrokerError::Transport(_)
        )
    }
}
