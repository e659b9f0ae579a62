//! Broker session over the synchronous `rumqttc` client.
//!
//! The event loop behind [`rumqttc::Connection`] only makes progress while
//! the connection is polled, so every operation here that enqueues a packet
//! also pumps the connection far enough for the packet to actually move.

use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, LastWill, MqttOptions, Packet,
    Publish, QoS, SubscribeReasonCode, Transport,
};
use std::collections::VecDeque;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::BrokerEndpoint;
use crate::identity::DeviceIdentity;
use crate::mqtt::error::BrokerError;

/// Bound on the plain-socket reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on waiting for the broker's CONNACK.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on waiting for the broker's SUBACK.
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);
/// How far a ping pumps the transport to surface faults.
const PING_PUMP_TIMEOUT: Duration = Duration::from_millis(250);
/// Outstanding-request capacity handed to the client.
const REQUEST_CAPACITY: usize = 10;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

/// The broker-session contract consumed by the supervisor.
pub trait BrokerLink {
    /// Probes reachability, then performs the authenticated handshake.
    fn open(&mut self) -> Result<(), BrokerError>;
    /// Subscribes to the command topic; at most once per open session.
    fn subscribe(&mut self) -> Result<(), BrokerError>;
    /// Drains currently buffered inbound payloads, in arrival order.
    fn poll_incoming(&mut self) -> Result<Vec<String>, BrokerError>;
    /// Emits a liveness heartbeat; failure means the session is unusable.
    fn ping(&mut self) -> Result<(), BrokerError>;
    /// Best-effort teardown; errors are swallowed.
    fn close(&mut self);
}

struct ActiveSession {
    client: Client,
    connection: Connection,
    subscribed: bool,
    /// Publishes observed while waiting for acknowledgments; drained first.
    pending: VecDeque<String>,
}

/// Broker session handle. Holds at most one active session at a time.
pub struct MqttBrokerSession {
    endpoint: BrokerEndpoint,
    identity: DeviceIdentity,
    active: Option<ActiveSession>,
}

impl MqttBrokerSession {
    pub fn new(endpoint: BrokerEndpoint, identity: DeviceIdentity) -> Self {
        Self {
            endpoint,
            identity,
            active: None,
        }
    }

    /// Plain socket connect/close against the broker's address.
    ///
    /// Runs before any TLS or MQTT work so a dead network path is reported
    /// as [`BrokerError::Unreachable`] instead of a handshake failure.
    fn probe_reachability(&self) -> Result<(), BrokerError> {
        let target = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        debug!("Probing broker reachability at {}", target);

        let mut addrs = target.as_str().to_socket_addrs().map_err(|e| BrokerError::Unreachable {
            endpoint: target.clone(),
            reason: e.to_string(),
        })?;
        let addr = addrs.next().ok_or_else(|| BrokerError::Unreachable {
            endpoint: target.clone(),
            reason: "hostname resolved to no addresses".to_string(),
        })?;

        TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).map_err(|e| BrokerError::Unreachable {
            endpoint: target,
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

impl BrokerLink for MqttBrokerSession {
    fn open(&mut self) -> Result<(), BrokerError> {
        // The previous handle, if any, is gone before a new one exists.
        self.active = None;

        self.probe_reachability()?;

        let mut options = MqttOptions::new(
            self.identity.as_str(),
            self.endpoint.host.clone(),
            self.endpoint.port,
        );
        options
            .set_credentials(self.endpoint.user.clone(), self.endpoint.pw.clone())
            .set_keep_alive(self.endpoint.keepalive());
        // Retained last will: the broker reports us offline if the session dies.
        options.set_last_will(LastWill::new(
            self.endpoint.status_topic.clone(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtMostOnce,
            true,
        ));
        if self.endpoint.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
        wait_for_connack(&mut connection)?;

        // Retained, so late subscribers see availability without waiting
        // for the next heartbeat.
        client
            .publish(
                self.endpoint.status_topic.clone(),
                QoS::AtMostOnce,
                true,
                PAYLOAD_ONLINE.as_bytes().to_vec(),
            )
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        info!(
            "Broker session established with {}:{} (tls={})",
            self.endpoint.host, self.endpoint.port, self.endpoint.tls
        );
        self.active = Some(ActiveSession {
            client,
            connection,
            subscribed: false,
            pending: VecDeque::new(),
        });
        Ok(())
    }

    fn subscribe(&mut self) -> Result<(), BrokerError> {
        let topic = self.endpoint.command_topic.clone();
        let session = self.active.as_mut().ok_or(BrokerError::NotOpen)?;
        if session.subscribed {
            return Err(BrokerError::AlreadySubscribed);
        }

        session
            .client
            .subscribe(topic.clone(), QoS::AtMostOnce)
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let deadline = Instant::now() + SUBACK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::Transport(
                    "no subscription acknowledgment from broker".to_string(),
                ));
            }
            match session.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(BrokerError::SubscribeRejected(topic));
                    }
                    session.subscribed = true;
                    info!("Subscribed to {}", topic);
                    return Ok(());
                }
                // Retained messages can race the acknowledgment; keep them.
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    session.pending.push_back(decode_payload(&publish));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(BrokerError::Transport(e.to_string())),
                Err(_) => {
                    return Err(BrokerError::Transport(
                        "no subscription acknowledgment from broker".to_string(),
                    ));
                }
            }
        }
    }

    fn poll_incoming(&mut self) -> Result<Vec<String>, BrokerError> {
        let session = self.active.as_mut().ok_or(BrokerError::NotOpen)?;

        let mut batch: Vec<String> = session.pending.drain(..).collect();
        loop {
            match session.connection.try_recv() {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    batch.push(decode_payload(&publish));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(BrokerError::Transport(e.to_string())),
                // Nothing more buffered right now.
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            debug!("Drained {} buffered message(s)", batch.len());
        }
        Ok(batch)
    }

    fn ping(&mut self) -> Result<(), BrokerError> {
        let status_topic = self.endpoint.status_topic.clone();
        let session = self.active.as_mut().ok_or(BrokerError::NotOpen)?;

        session
            .client
            .publish(
                status_topic,
                QoS::AtMostOnce,
                false,
                PAYLOAD_ONLINE.as_bytes().to_vec(),
            )
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        // Pump once so the heartbeat leaves the socket and a dead transport
        // surfaces here instead of on the next drain.
        match session.connection.recv_timeout(PING_PUMP_TIMEOUT) {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                session.pending.push_back(decode_payload(&publish));
                Ok(())
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(BrokerError::Transport(e.to_string())),
            Err(_) => Ok(()),
        }
    }

    fn close(&mut self) {
        if let Some(session) = self.active.take() {
            // Best-effort: the session is being abandoned either way.
            if let Err(e) = session.client.disconnect() {
                debug!("Ignoring disconnect error during teardown: {}", e);
            }
        }
    }
}

fn decode_payload(publish: &Publish) -> String {
    String::from_utf8_lossy(&publish.payload).into_owned()
}

/// Waits (bounded) for the broker's CONNACK and maps refusals to causes.
fn wait_for_connack(connection: &mut Connection) -> Result<(), BrokerError> {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BrokerError::HandshakeTimeout(HANDSHAKE_TIMEOUT));
        }
        match connection.recv_timeout(remaining) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(categorize_refusal(code)),
                };
            }
            Ok(Ok(_)) => continue,
            Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                return Err(categorize_refusal(code));
            }
            Ok(Err(e)) => return Err(BrokerError::Transport(e.to_string())),
            Err(_) => return Err(BrokerError::HandshakeTimeout(HANDSHAKE_TIMEOUT)),
        }
    }
}

fn categorize_refusal(code: ConnectReturnCode) -> BrokerError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            BrokerError::BadCredentials
        }
        ConnectReturnCode::BadClientId => BrokerError::IdentifierRejected,
        ConnectReturnCode::RefusedProtocolVersion => BrokerError::ProtocolMismatch,
        ConnectReturnCode::ServiceUnavailable => BrokerError::ServerUnavailable,
        _ => BrokerError::Refused,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn endpoint_on(port: u16) -> BrokerEndpoint {
        BrokerEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
            ..BrokerEndpoint::default()
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::detect()
    }

    /// Binds and immediately drops a listener to obtain a port that is
    /// almost certainly closed.
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    }

    #[test]
    fn probe_succeeds_against_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let session = MqttBrokerSession::new(endpoint_on(port), identity());
        session.probe_reachability().expect("probe");
    }

    #[test]
    fn open_reports_unreachable_without_handshaking() {
        let port = closed_port();
        let mut session = MqttBrokerSession::new(endpoint_on(port), identity());

        match session.open() {
            Err(BrokerError::Unreachable { endpoint, .. }) => {
                assert!(endpoint.ends_with(&port.to_string()));
            }
            other => panic!("expected Unreachable, got {:?}", other),
        }
        // No session handle was ever created.
        assert!(session.active.is_none());
    }

    #[test]
    fn operations_require_an_open_session() {
        let mut session = MqttBrokerSession::new(endpoint_on(closed_port()), identity());

        assert!(matches!(session.subscribe(), Err(BrokerError::NotOpen)));
        assert!(matches!(session.poll_incoming(), Err(BrokerError::NotOpen)));
        assert!(matches!(session.ping(), Err(BrokerError::NotOpen)));
        // Close without a session is a no-op.
        session.close();
    }

    #[test]
    fn refusal_codes_map_to_categories() {
        assert!(matches!(
            categorize_refusal(ConnectReturnCode::BadUserNamePassword),
            BrokerError::BadCredentials
        ));
        assert!(matches!(
            categorize_refusal(ConnectReturnCode::NotAuthorized),
            BrokerError::BadCredentials
        ));
        assert!(matches!(
            categorize_refusal(ConnectReturnCode::BadClientId),
            BrokerError::IdentifierRejected
        ));
        assert!(matches!(
            categorize_refusal(ConnectReturnCode::RefusedProtocolVersion),
            BrokerError::ProtocolMismatch
        ));
        assert!(matches!(
            categorize_refusal(ConnectReturnCode::ServiceUnavailable),
            BrokerError::ServerUnavailable
        ));
    }

    #[test]
    fn reachability_split_matches_remediation() {
        let unreachable = BrokerError::Unreachable {
            endpoint: "example:8883".to_string(),
            reason: "timed out".to_string(),
        };
        assert!(unreachable.is_reachability());
        assert!(BrokerError::Transport("reset".to_string()).is_reachability());
        assert!(!BrokerError::BadCredentials.is_reachability());
        assert!(!BrokerError::IdentifierRejected.is_reachability());
    }
}
