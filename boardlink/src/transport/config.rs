//! Link configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Parity setting of a UART link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    #[serde(alias = "N")]
    None,
    #[serde(alias = "E")]
    Even,
    #[serde(alias = "O")]
    Odd,
    #[serde(alias = "M")]
    Mark,
    #[serde(alias = "S")]
    Space,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
            Parity::Mark => "mark",
            Parity::Space => "space",
        };
        f.write_str(name)
    }
}

/// Number of stop bits of a UART link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "f32")]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl TryFrom<f32> for StopBits {
    type Error = String;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        if value == 1.0 {
            Ok(StopBits::One)
        } else if value == 1.5 {
            Ok(StopBits::OnePointFive)
        } else if value == 2.0 {
            Ok(StopBits::Two)
        } else {
            Err(format!("unsupported stop bits: {value}"))
        }
    }
}

/// UART link configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path (e.g. `/dev/ttyUSB0`).
    pub port: String,

    /// Line rate in baud.
    #[serde(alias = "rate")]
    pub baud_rate: u32,

    /// Parity setting.
    pub parity: Parity,

    /// Stop bits.
    pub stop_bits: StopBits,

    /// Gap after which an in-progress frame is considered complete.
    #[serde(deserialize_with = "secs")]
    pub inter_char_timeout: Duration,

    /// Silence after which the reader reports an idle (empty) frame.
    #[serde(deserialize_with = "secs")]
    pub message_timeout: Duration,

    /// Whether received frames go to the pull queue. When false the link is
    /// callback-only and `receive` always returns `None`.
    pub enqueue_frames: bool,
}

impl SerialConfig {
    /// Create a configuration for `port` with default line settings.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Set the line rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set parity and stop bits.
    pub fn with_framing(mut self, parity: Parity, stop_bits: StopBits) -> Self {
        self.parity = parity;
        self.stop_bits = stop_bits;
        self
    }

    /// Set the inter-character and message timeouts.
    pub fn with_timeouts(mut self, inter_char: Duration, message: Duration) -> Self {
        self.inter_char_timeout = inter_char;
        self.message_timeout = message;
        self
    }

    /// Run the link callback-only.
    pub fn callback_only(mut self) -> Self {
        self.enqueue_frames = false;
        self
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            parity: Parity::None,
            stop_bits: StopBits::One,
            inter_char_timeout: Duration::from_millis(500),
            message_timeout: Duration::from_secs(3),
            enqueue_frames: true,
        }
    }
}

/// Configuration of a network-attached SLCAN adapter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Adapter address, either `socket://host:port` or `host:port`.
    pub endpoint: String,

    /// CAN bus bit rate.
    #[serde(alias = "rate")]
    pub bit_rate: u32,

    /// How long a single receive poll waits before looping.
    #[serde(deserialize_with = "secs")]
    pub message_timeout: Duration,

    /// Whether received frames go to the pull queue.
    pub enqueue_frames: bool,
}

impl CanConfig {
    /// Create a configuration for the adapter at `endpoint`.
    pub fn new(endpoint: impl Into<String>, bit_rate: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            bit_rate,
            ..Self::default()
        }
    }

    /// Get the socket address for connection.
    pub fn socket_addr(&self) -> &str {
        self.endpoint
            .strip_prefix("socket://")
            .unwrap_or(&self.endpoint)
    }
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            endpoint: "socket://192.168.0.1:1234".to_string(),
            bit_rate: 500_000,
            message_timeout: Duration::from_secs(10),
            enqueue_frames: true,
        }
    }
}

/// Deserialize a duration written as (fractional) seconds.
pub(crate) fn secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(value).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_defaults() {
        let config = SerialConfig::new("/dev/ttyUSB0");
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.inter_char_timeout, Duration::from_millis(500));
        assert!(config.enqueue_frames);
    }

    #[test]
    fn test_serial_from_json() {
        let config: SerialConfig = serde_json::from_str(
            r#"{"port": "COM9", "rate": 9600, "parity": "E", "stop_bits": 2,
                "inter_char_timeout": 0.1, "message_timeout": 5}"#,
        )
        .unwrap();

        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stop_bits, StopBits::Two);
        assert_eq!(config.inter_char_timeout, Duration::from_millis(100));
        assert_eq!(config.message_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_bad_stop_bits_rejected() {
        let result: Result<SerialConfig, _> = serde_json::from_str(r#"{"stop_bits": 3}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_can_socket_addr() {
        let config = CanConfig::new("socket://10.0.0.2:3333", 250_000);
        assert_eq!(config.socket_addr(), "10.0.0.2:3333");

        let config = CanConfig::new("10.0.0.2:3333", 250_000);
        assert_eq!(config.socket_addr(), "10.0.0.2:3333");
    }
}
