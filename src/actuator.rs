//! Relay outputs.
//!
//! The device drives two binary actuators, named after the motion they
//! trigger. Outputs are write-only: nothing in the agent reads relay state
//! back, and the relays keep their last-commanded level through any network
//! outage (see DESIGN.md for the fail-safe discussion).

use rppal::gpio::{Gpio, OutputPin};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ActuatorPins;

/// Errors raised by the relay hardware layer.
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// GPIO access failed (missing permissions, unknown pin, unsupported board)
    #[error("GPIO access failed: {0}")]
    Gpio(#[from] rppal::gpio::Error),
}

/// The two relay channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    Up,
    Down,
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relay::Up => write!(f, "up"),
            Relay::Down => write!(f, "down"),
        }
    }
}

/// Logical relay level, independent of electrical polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayLevel {
    On,
    Off,
}

impl fmt::Display for RelayLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayLevel::On => write!(f, "on"),
            RelayLevel::Off => write!(f, "off"),
        }
    }
}

/// Seam between the dispatcher and the physical outputs.
///
/// Production uses [`GpioRelayBank`]; tests substitute a recording double.
pub trait RelayBank {
    fn drive(&mut self, relay: Relay, level: RelayLevel) -> Result<(), ActuatorError>;
}

/// Maps a logical level onto the electrical level for the configured board.
fn electrical_high(level: RelayLevel, active_low: bool) -> bool {
    matches!(level, RelayLevel::On) != active_low
}

/// Relay bank backed by two GPIO output pins.
pub struct GpioRelayBank {
    up: OutputPin,
    down: OutputPin,
    active_low: bool,
}

impl GpioRelayBank {
    /// Claims both pins and parks the relays in the OFF position.
    pub fn from_pins(pins: &ActuatorPins) -> Result<Self, ActuatorError> {
        let gpio = Gpio::new()?;
        let up = gpio.get(pins.up_pin)?.into_output();
        let down = gpio.get(pins.down_pin)?.into_output();

        let mut bank = Self {
            up,
            down,
            active_low: pins.active_low,
        };
        bank.drive(Relay::Up, RelayLevel::Off)?;
        bank.drive(Relay::Down, RelayLevel::Off)?;

        info!(
            "Claimed relay outputs: up=GPIO{} down=GPIO{} active_low={}",
            pins.up_pin, pins.down_pin, pins.active_low
        );
        Ok(bank)
    }
}

impl RelayBank for GpioRelayBank {
    fn drive(&mut self, relay: Relay, level: RelayLevel) -> Result<(), ActuatorError> {
        let pin = match relay {
            Relay::Up => &mut self.up,
            Relay::Down => &mut self.down,
        };
        if electrical_high(level, self.active_low) {
            pin.set_high();
        } else {
            pin.set_low();
        }
        debug!("Relay {} set {}", relay, level);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording relay double shared by dispatcher and supervisor tests.

    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Shared view into everything a [`RecordingRelays`] was told to do.
    #[derive(Clone, Default)]
    pub struct RelayLog(Rc<RefCell<Vec<(Relay, RelayLevel)>>>);

    impl RelayLog {
        pub fn commands(&self) -> Vec<(Relay, RelayLevel)> {
            self.0.borrow().clone()
        }

        /// Last level commanded for the given relay, if any.
        pub fn state_of(&self, relay: Relay) -> Option<RelayLevel> {
            self.0
                .borrow()
                .iter()
                .rev()
                .find(|(r, _)| *r == relay)
                .map(|(_, level)| *level)
        }

        fn record(&self, relay: Relay, level: RelayLevel) {
            self.0.borrow_mut().push((relay, level));
        }
    }

    pub struct RecordingRelays {
        log: RelayLog,
        fail: bool,
    }

    impl RecordingRelays {
        pub fn new() -> (Self, RelayLog) {
            let log = RelayLog::default();
            (
                Self {
                    log: log.clone(),
                    fail: false,
                },
                log,
            )
        }

        /// A bank whose every drive call fails, for error-absorption tests.
        pub fn failing() -> (Self, RelayLog) {
            let log = RelayLog::default();
            (
                Self {
                    log: log.clone(),
                    fail: true,
                },
                log,
            )
        }
    }

    impl RelayBank for RecordingRelays {
        fn drive(&mut self, relay: Relay, level: RelayLevel) -> Result<(), ActuatorError> {
            if self.fail {
                return Err(ActuatorError::Gpio(rppal::gpio::Error::PinNotAvailable(99)));
            }
            self.log.record(relay, level);
            Ok(())
        }
    }
}
