//! Board profile: everything the drivers need to know about one board.

use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::channel::{PatternSet, PromptShapes};
use crate::transport::config::secs;

/// Timeouts of console and D-Bus operations.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Reply to an ordinary command.
    #[serde(deserialize_with = "secs")]
    pub command_response: Duration,

    /// Reaching the bootloader prompt.
    #[serde(deserialize_with = "secs")]
    pub bootloader: Duration,

    /// Login prompt after a reboot.
    #[serde(deserialize_with = "secs")]
    pub reboot: Duration,

    /// Login prompt after booting from the bootloader.
    #[serde(deserialize_with = "secs")]
    pub normal_mode: Duration,

    /// Network interfaces reporting ready after boot.
    #[serde(deserialize_with = "secs")]
    pub network_ready: Duration,

    /// Monitor acknowledgement after subscribing to a signal.
    #[serde(deserialize_with = "secs")]
    pub dbus_subscribe: Duration,

    /// Monitor shutdown after unsubscribing.
    #[serde(deserialize_with = "secs")]
    pub dbus_unsubscribe: Duration,

    /// Default wait for a delivered signal.
    #[serde(deserialize_with = "secs")]
    pub dbus_signal: Duration,

    /// Reply to a method call.
    #[serde(deserialize_with = "secs")]
    pub dbus_method: Duration,

    /// One probe of the console state.
    #[serde(deserialize_with = "secs")]
    pub where_am_i_probe: Duration,

    /// Interval between empty lines pushed to catch the bootloader.
    #[serde(deserialize_with = "secs")]
    pub bootloader_push: Duration,

    /// Pause after reaching the bootloader so pushed lines drain.
    #[serde(deserialize_with = "secs")]
    pub bootloader_settle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_response: Duration::from_secs(30),
            bootloader: Duration::from_secs(120),
            reboot: Duration::from_secs(120),
            normal_mode: Duration::from_secs(120),
            network_ready: Duration::from_secs(50),
            dbus_subscribe: Duration::from_secs(20),
            dbus_unsubscribe: Duration::from_secs(20),
            dbus_signal: Duration::from_secs(20),
            dbus_method: Duration::from_secs(20),
            where_am_i_probe: Duration::from_secs(5),
            bootloader_push: Duration::from_millis(500),
            bootloader_settle: Duration::from_secs(2),
        }
    }
}

/// Login credentials of the console user.
#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(deserialize_with = "secret")]
    pub password: SecretString,
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// The password in clear text.
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self::new(self.username.clone(), self.password())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("root", "")
    }
}

fn secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Storage the board boots Linux from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootDevice {
    /// Whatever the bootloader's default boot command selects.
    #[default]
    Default,
    /// On-board eMMC.
    Emmc,
}

/// Text sent to the console for each operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsoleCommands {
    /// Interrupt keystroke; also used to probe for a prompt.
    pub interrupt: String,

    /// Empty probe pushed to stop autoboot and reach the bootloader prompt.
    pub probe: String,

    /// Reboot from the Linux shell.
    pub reboot: String,

    /// Commands restarting the board from the bootloader prompt.
    pub bootloader_restarts: Vec<String>,

    /// Leave the shell.
    pub logout: String,

    /// Boot Linux with the bootloader's default command.
    pub boot: String,

    /// Boot Linux from eMMC.
    pub boot_emmc: String,
}

impl ConsoleCommands {
    /// Bootloader command starting Linux from `device`.
    pub fn boot_command(&self, device: BootDevice) -> &str {
        match device {
            BootDevice::Default => &self.boot,
            BootDevice::Emmc => &self.boot_emmc,
        }
    }

    /// Whether `command` restarts the board from the bootloader prompt.
    pub fn restarts_bootloader(&self, command: &str) -> bool {
        self.bootloader_restarts.iter().any(|c| c == command)
    }
}

impl Default for ConsoleCommands {
    fn default() -> Self {
        Self {
            interrupt: "\x03".to_string(),
            probe: String::new(),
            reboot: "reboot".to_string(),
            bootloader_restarts: vec!["reset".to_string(), "bmode emmc".to_string()],
            logout: "logout".to_string(),
            boot: "boot".to_string(),
            boot_emmc: "run bootcmd_emmc".to_string(),
        }
    }
}

/// Everything the drivers need to know about one kind of board.
///
/// Built in code with the `with_*` methods; the plain-data parts
/// ([`Timeouts`], [`Credentials`], [`ConsoleCommands`]) can also be loaded
/// with serde.
#[derive(Debug, Clone)]
pub struct BoardProfile {
    /// Profile name (e.g., "uboot_linux").
    pub name: String,

    /// Interactive prompts of the console.
    pub prompts: PromptShapes,

    /// Command vocabulary.
    pub commands: ConsoleCommands,

    /// Console login.
    pub credentials: Credentials,

    /// Operation timeouts.
    pub timeouts: Timeouts,

    /// Per network interface, the kernel line reporting its link ready.
    pub link_ready: IndexMap<String, Regex>,
}

impl BoardProfile {
    /// Create a profile with default commands, credentials and timeouts and
    /// no monitored links.
    pub fn new(name: impl Into<String>, prompts: PromptShapes) -> Self {
        Self {
            name: name.into(),
            prompts,
            commands: ConsoleCommands::default(),
            credentials: Credentials::default(),
            timeouts: Timeouts::default(),
            link_ready: IndexMap::new(),
        }
    }

    /// Set the command vocabulary.
    pub fn with_commands(mut self, commands: ConsoleCommands) -> Self {
        self.commands = commands;
        self
    }

    /// Set the login credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Monitor a network interface whose readiness is reported by `pattern`.
    pub fn with_link(
        mut self,
        interface: impl Into<String>,
        pattern: &str,
    ) -> Result<Self, regex::Error> {
        self.link_ready.insert(interface.into(), Regex::new(pattern)?);
        Ok(self)
    }

    /// Stop monitoring every network interface.
    pub fn without_links(mut self) -> Self {
        self.link_ready.clear();
        self
    }

    /// Filter matching every link-ready line.
    pub fn link_ready_lines(&self) -> PatternSet {
        self.link_ready.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_defaults() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.command_response, Duration::from_secs(30));
        assert_eq!(timeouts.network_ready, Duration::from_secs(50));
        assert_eq!(timeouts.bootloader_push, Duration::from_millis(500));
    }

    #[test]
    fn test_timeouts_from_json() {
        let timeouts: Timeouts =
            serde_json::from_str(r#"{"reboot": 240, "bootloader_push": 0.25}"#).unwrap();
        assert_eq!(timeouts.reboot, Duration::from_secs(240));
        assert_eq!(timeouts.bootloader_push, Duration::from_millis(250));
        assert_eq!(timeouts.dbus_method, Duration::from_secs(20));
    }

    #[test]
    fn test_credentials_are_redacted() {
        let credentials: Credentials =
            serde_json::from_str(r#"{"username": "root", "password": "hunter2"}"#).unwrap();
        assert_eq!(credentials.password(), "hunter2");
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }

    #[test]
    fn test_boot_command() {
        let commands = ConsoleCommands::default();
        assert_eq!(commands.boot_command(BootDevice::Default), "boot");
        assert_eq!(commands.boot_command(BootDevice::Emmc), "run bootcmd_emmc");
        assert!(commands.restarts_bootloader("reset"));
        assert!(commands.restarts_bootloader("bmode emmc"));
        assert!(!commands.restarts_bootloader("reboot"));
    }

    #[test]
    fn test_profile_links() {
        let profile = BoardProfile::new("test", PromptShapes::any_host())
            .with_link("eth0", "eth0: link becomes ready")
            .unwrap();
        assert!(profile.link_ready_lines().is_match("[ 5.1] eth0: link becomes ready"));
        assert!(profile.without_links().link_ready.is_empty());
    }
}
