//! Inbound command vocabulary and dispatch.
//!
//! Commands arrive as UTF-8 text on the subscribed topic. The vocabulary is
//! fixed: `up 1`, `up 0`, `down 1`, `down 0`, matched exactly after trimming
//! and ASCII-lowercasing. Everything else is logged and dropped — a garbled
//! payload must never take down the control loop.

use std::fmt;
use tracing::{debug, error, warn};

use crate::actuator::{Relay, RelayBank, RelayLevel};

/// A validated command: one relay, one target level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub relay: Relay,
    pub level: RelayLevel,
}

impl Command {
    /// Parses an already-normalized payload against the fixed vocabulary.
    fn parse(normalized: &str) -> Option<Self> {
        let (relay, level) = match normalized {
            "up 1" => (Relay::Up, RelayLevel::On),
            "up 0" => (Relay::Up, RelayLevel::Off),
            "down 1" => (Relay::Down, RelayLevel::On),
            "down 0" => (Relay::Down, RelayLevel::Off),
            _ => return None,
        };
        Some(Self { relay, level })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.relay, self.level)
    }
}

/// Maps inbound payloads onto relay actions.
pub struct CommandDispatcher {
    relays: Box<dyn RelayBank>,
}

impl CommandDispatcher {
    pub fn new(relays: Box<dyn RelayBank>) -> Self {
        Self { relays }
    }

    /// Dispatches a single payload.
    ///
    /// Never fails: unrecognized payloads and relay faults are both logged
    /// and absorbed here.
    pub fn dispatch(&mut self, payload: &str) {
        let normalized = payload.trim().to_ascii_lowercase();
        let Some(command) = Command::parse(&normalized) else {
            warn!("Unrecognized command payload: {:?}", payload);
            return;
        };

        debug!("Dispatching command: {}", command);
        if let Err(e) = self.relays.drive(command.relay, command.level) {
            error!("Failed to drive {} relay: {}", command.relay, e);
        }
    }
}
