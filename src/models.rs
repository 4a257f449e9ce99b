//! Core value types shared across the daemon.
//!
//! These are the types that cross component boundaries: the connection
//! state machine, security classes, scanned networks, and the error enum.
//! The signal-strength and band conversions live here as pure functions so
//! every component derives them the same way.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Wi-Fi connection lifecycle state.
///
/// `Obtaining` sits between association and address assignment: the station
/// is associated but DHCP has not produced a lease yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Associated, DHCP in progress.
    Obtaining,
    Connected,
    Failed,
}

impl ConnectionState {
    /// The wire representation used on the bus.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Obtaining => "obtaining",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security class of a network, as reported by the supplicant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Security {
    #[default]
    Open,
    Psk,
    Sae,
    Ieee8021x,
}

impl Security {
    /// Parses the supplicant's `Type` strings plus the legacy aliases
    /// clients still send ("wpa2", "wpa3").
    pub fn parse(s: &str) -> Self {
        match s {
            "psk" | "wpa2" => Self::Psk,
            "sae" | "wpa3" => Self::Sae,
            "8021x" => Self::Ieee8021x,
            _ => Self::Open,
        }
    }

    /// Whether association needs a passphrase delivered via the agent.
    pub fn wants_passphrase(self) -> bool {
        matches!(self, Self::Psk | Self::Sae)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Psk => "psk",
            Self::Sae => "sae",
            Self::Ieee8021x => "8021x",
        }
    }
}

impl Display for Security {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the host currently reaches the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionType {
    Wifi,
    Ethernet,
    Usb,
    #[default]
    Unknown,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::Ethernet => "ethernet",
            Self::Usb => "usb",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for ConnectionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Wi-Fi network visible after a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub ssid: String,
    pub security: Security,
    /// Raw RSSI in dBm.
    pub signal_dbm: i16,
    /// Derived percentage 0-100.
    pub signal: u8,
    pub connected: bool,
    pub saved: bool,
    /// MHz; 0 when the supplicant does not report it.
    pub frequency: u32,
    /// The supplicant's object path for this network.
    pub object_path: String,
}

/// Converts a raw RSSI to a 0-100 percentage.
///
/// Piecewise-linear clamp: -100 dBm and below is 0, -50 dBm and above is
/// 100, linear in between.
pub fn dbm_to_percent(dbm: i16) -> u8 {
    if dbm <= -100 {
        0
    } else if dbm >= -50 {
        100
    } else {
        (2 * (i32::from(dbm) + 100)) as u8
    }
}

/// Derives the band label from a frequency in MHz.
pub fn frequency_to_band(freq: u32) -> &'static str {
    match freq {
        2400..=2499 => "2.4GHz",
        5000..=5999 => "5GHz",
        f if f >= 6000 => "6GHz",
        _ => "unknown",
    }
}

/// Errors that can occur during daemon operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// A D-Bus communication error occurred.
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    /// The supplicant service is not on the bus, or no station exists yet.
    #[error("supplicant not available")]
    SupplicantUnavailable,

    /// The requested network was not visible after a scan.
    #[error("network not found: {0}")]
    NotFound(String),

    /// No saved profile exists for the requested SSID.
    #[error("known network not found: {0}")]
    NoSavedNetwork(String),

    /// A bus method was called with missing or malformed arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A privileged helper process failed.
    #[error("{operation} failed: {message}")]
    Helper { operation: String, message: String },

    /// Filesystem access failed (sysfs reads, profile writes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub(crate) fn helper(operation: &str, message: impl Display) -> Self {
        Self::Helper {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbm_to_percent_clamps_low() {
        assert_eq!(dbm_to_percent(-100), 0);
        assert_eq!(dbm_to_percent(-120), 0);
    }

    #[test]
    fn dbm_to_percent_clamps_high() {
        assert_eq!(dbm_to_percent(-50), 100);
        assert_eq!(dbm_to_percent(-30), 100);
        assert_eq!(dbm_to_percent(0), 100);
    }

    #[test]
    fn dbm_to_percent_linear_midrange() {
        assert_eq!(dbm_to_percent(-75), 50);
        assert_eq!(dbm_to_percent(-99), 2);
        assert_eq!(dbm_to_percent(-51), 98);
        assert_eq!(dbm_to_percent(-60), 80);
    }

    #[test]
    fn frequency_to_band_ranges() {
        assert_eq!(frequency_to_band(2412), "2.4GHz");
        assert_eq!(frequency_to_band(2484), "2.4GHz");
        assert_eq!(frequency_to_band(5180), "5GHz");
        assert_eq!(frequency_to_band(5925), "5GHz");
        assert_eq!(frequency_to_band(5999), "5GHz");
        assert_eq!(frequency_to_band(6115), "6GHz");
        assert_eq!(frequency_to_band(7115), "6GHz");
        assert_eq!(frequency_to_band(0), "unknown");
        assert_eq!(frequency_to_band(900), "unknown");
    }

    #[test]
    fn security_parse_aliases() {
        assert_eq!(Security::parse("psk"), Security::Psk);
        assert_eq!(Security::parse("wpa2"), Security::Psk);
        assert_eq!(Security::parse("sae"), Security::Sae);
        assert_eq!(Security::parse("wpa3"), Security::Sae);
        assert_eq!(Security::parse("8021x"), Security::Ieee8021x);
        assert_eq!(Security::parse("open"), Security::Open);
        assert_eq!(Security::parse(""), Security::Open);
        assert_eq!(Security::parse("wep"), Security::Open);
    }

    #[test]
    fn security_wants_passphrase() {
        assert!(Security::Psk.wants_passphrase());
        assert!(Security::Sae.wants_passphrase());
        assert!(!Security::Open.wants_passphrase());
        assert!(!Security::Ieee8021x.wants_passphrase());
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Obtaining.to_string(), "obtaining");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }

    #[test]
    fn connection_state_default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn connection_type_display() {
        assert_eq!(ConnectionType::Wifi.to_string(), "wifi");
        assert_eq!(ConnectionType::Ethernet.to_string(), "ethernet");
        assert_eq!(ConnectionType::Usb.to_string(), "usb");
        assert_eq!(ConnectionType::Unknown.to_string(), "unknown");
    }

    #[test]
    fn network_error_display() {
        assert_eq!(
            NetworkError::NotFound("Cafe".into()).to_string(),
            "network not found: Cafe"
        );
        assert_eq!(
            NetworkError::SupplicantUnavailable.to_string(),
            "supplicant not available"
        );
        assert_eq!(
            NetworkError::helper("rfkill", "exit status 1").to_string(),
            "rfkill failed: exit status 1"
        );
    }
}
