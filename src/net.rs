//! Wireless network session.
//!
//! The radio itself is an external collaborator: association is ultimately
//! owned by the host's network manager, reached through the
//! [`WirelessStation`] trait. This module contributes the session logic the
//! supervisor relies on — a join with a bounded association wait, a cheap
//! connectivity predicate, and a link refresh — and the thin `nmcli` adapter
//! that bridges the trait to the OS.
//!
//! Retry policy deliberately does not live here; the supervisor owns it.

use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::NetworkCredentials;

/// Errors raised by the network session or the radio adapter.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The link did not associate within the configured wait
    #[error("no association with {network} within {waited:?}")]
    JoinTimeout { network: String, waited: Duration },

    /// The radio adapter rejected or failed a request
    #[error("radio adapter failure: {0}")]
    Radio(String),

    /// Spawning the adapter process failed
    #[error("radio adapter unavailable: {0}")]
    Io(#[from] std::io::Error),
}

/// Primitives the wireless radio driver exposes.
///
/// Kept minimal on purpose: request association, report association, drop
/// association. Everything stateful above these three calls belongs to
/// [`NetworkSession`].
pub trait WirelessStation {
    fn request_join(&mut self, credentials: &NetworkCredentials) -> Result<(), NetworkError>;
    fn is_associated(&self) -> bool;
    fn disassociate(&mut self) -> Result<(), NetworkError>;
}

/// The network-session contract consumed by the supervisor.
pub trait NetLink {
    /// Brings the link up, blocking up to the configured timeout.
    fn join(&mut self) -> Result<(), NetworkError>;
    /// Non-blocking liveness check.
    fn is_joined(&self) -> bool;
    /// Drops and re-establishes a stuck link.
    fn leave_and_rejoin(&mut self) -> Result<(), NetworkError>;
}

/// Session logic over a [`WirelessStation`].
pub struct NetworkSession<R: WirelessStation> {
    radio: R,
    credentials: NetworkCredentials,
    join_timeout: Duration,
    poll_interval: Duration,
}

impl<R: WirelessStation> NetworkSession<R> {
    pub fn new(
        radio: R,
        credentials: NetworkCredentials,
        join_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            radio,
            credentials,
            join_timeout,
            poll_interval,
        }
    }
}

impl<R: WirelessStation> NetLink for NetworkSession<R> {
    fn join(&mut self) -> Result<(), NetworkError> {
        if self.radio.is_associated() {
            debug!("Wireless link already associated");
            return Ok(());
        }

        info!("Joining wireless network {}", self.credentials.network);
        self.radio.request_join(&self.credentials)?;

        let started = Instant::now();
        loop {
            if self.radio.is_associated() {
                info!(
                    "Wireless link up after {:?}",
                    started.elapsed()
                );
                return Ok(());
            }
            if started.elapsed() >= self.join_timeout {
                return Err(NetworkError::JoinTimeout {
                    network: self.credentials.network.clone(),
                    waited: self.join_timeout,
                });
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn is_joined(&self) -> bool {
        self.radio.is_associated()
    }

    fn leave_and_rejoin(&mut self) -> Result<(), NetworkError> {
        if self.radio.is_associated() {
            info!("Dropping wireless association to refresh the link");
            self.radio.disassociate()?;
        }
        self.join()
    }
}

/// Radio adapter delegating to the host's network manager.
///
/// `nmcli` is asked not to wait (`--wait 0`); association progress is
/// observed through [`WirelessStation::is_associated`], which keeps the
/// bounded wait in one place.
pub struct NmcliStation {
    interface: String,
}

impl NmcliStation {
    pub fn new(interface: String) -> Self {
        Self { interface }
    }

    fn run(args: &[&str]) -> Result<String, NetworkError> {
        let output = Command::new("nmcli").args(args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(NetworkError::Radio(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl WirelessStation for NmcliStation {
    fn request_join(&mut self, credentials: &NetworkCredentials) -> Result<(), NetworkError> {
        Self::run(&[
            "--wait",
            "0",
            "device",
            "wifi",
            "connect",
            &credentials.network,
            "password",
            &credentials.key,
            "ifname",
            &self.interface,
        ])
        .map(|_| ())
    }

    fn is_associated(&self) -> bool {
        match Self::run(&["-t", "-f", "DEVICE,STATE", "device"]) {
            Ok(stdout) => stdout
                .lines()
                .any(|line| line == format!("{}:connected", self.interface)),
            Err(e) => {
                warn!("Could not query link state: {}", e);
                false
            }
        }
    }

    fn disassociate(&mut self) -> Result<(), NetworkError> {
        Self::run(&["device", "disconnect", &self.interface]).map(|_| ())
    }
}
