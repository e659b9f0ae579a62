//! Device identity for the broker session.
//!
//! The broker requires a stable client identifier; two devices sharing one id
//! evict each other's sessions. The identity is derived from the hardware at
//! startup and never changes for the lifetime of the process.

use std::fmt;
use std::fs;
use tracing::{debug, warn};

const CPUINFO_PATH: &str = "/proc/cpuinfo";
const MACHINE_ID_PATH: &str = "/etc/machine-id";
const FALLBACK_ID: &str = "relaylink-unidentified";

/// Opaque device identifier used as the MQTT client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Derives the identity from the hardware.
    ///
    /// Prefers the SoC serial from `/proc/cpuinfo` (present on Raspberry Pi),
    /// then the systemd machine id, then a fixed fallback. The fallback is
    /// only safe for a single-device deployment and is logged as a warning.
    pub fn detect() -> Self {
        if let Ok(text) = fs::read_to_string(CPUINFO_PATH) {
            if let Some(serial) = parse_cpuinfo_serial(&text) {
                debug!("Derived device identity from hardware serial");
                return Self(format!("relaylink-{}", serial));
            }
        }

        if let Ok(text) = fs::read_to_string(MACHINE_ID_PATH) {
            let id = text.trim();
            if !id.is_empty() {
                debug!("Derived device identity from machine id");
                return Self(format!("relaylink-{}", &id[..id.len().min(12)]));
            }
        }

        warn!("No hardware identifier found, using fallback client id");
        Self(FALLBACK_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extracts the `Serial` field from `/proc/cpuinfo` output.
fn parse_cpuinfo_serial(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Serial") {
            let serial = rest.trim_start_matches([' ', '\t', ':']).trim();
            if !serial.is_empty() {
                return Some(serial.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_pi_serial() {
        let cpuinfo = "\
processor\t: 0\n\
model name\t: ARMv7 Processor rev 4 (v7l)\n\
Hardware\t: BCM2835\n\
Serial\t\t: 00000000d25bd9e2\n\
Model\t\t: Raspberry Pi 3 Model B Rev 1.2\n";
        assert_eq!(
            parse_cpuinfo_serial(cpuinfo),
            Some("00000000d25bd9e2".to_string())
        );
    }

    #[test]
    fn missing_serial_yields_none() {
        let cpuinfo = "processor\t: 0\nmodel name\t: something x86\n";
        assert_eq!(parse_cpuinfo_serial(cpuinfo), None);
    }

    #[test]
    fn empty_serial_yields_none() {
        assert_eq!(parse_cpuinfo_serial("Serial\t\t:\n"), None);
    }
}
