//! D-Bus vocabulary of the board: signals, methods and command templates.
//!
//! Signals are watched with `dbus-monitor` started in the background of the
//! console shell; methods are called with `dbus-send --print-reply`. Both tools
//! print typed values one per line:
//!
//! ```text
//! signal time=1700000000.1 sender=:1.7 -> destination=(null destination) serial=42 path=/instance; interface=org.firmwaremanager.FirmwareInterface; member=newFirmwareAvailable
//!    string "12345"
//! ```

use std::fmt;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::channel::PatternSet;

/// Event header: the member name of a monitored signal.
static HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"member=(\w+)").expect("literal regex"));

/// Typed result: `boolean true|false` or `string "<value>"`.
static RESULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:boolean (true|false))|(?:string "(.*)")"#).expect("literal regex")
});

/// Job-control acknowledgement of a backgrounded monitor: `[1] 1234`.
static SUBSCRIPTION_ACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\d+\] (\d+)").expect("literal regex"));

/// Value decoded from a typed result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbusValue {
    Bool(bool),
    Str(String),
}

impl DbusValue {
    /// Decode the first typed result found in a line.
    pub fn decode(line: &str) -> Option<Self> {
        let caps = RESULT.captures(line)?;
        if let Some(flag) = caps.get(1) {
            return Some(DbusValue::Bool(flag.as_str() == "true"));
        }
        caps.get(2).map(|s| DbusValue::Str(s.as_str().to_string()))
    }

    /// The boolean value, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DbusValue::Bool(b) => Some(*b),
            DbusValue::Str(_) => None,
        }
    }

    /// The string value, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbusValue::Bool(_) => None,
            DbusValue::Str(s) => Some(s),
        }
    }
}

impl fmt::Display for DbusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbusValue::Bool(b) => write!(f, "{b}"),
            DbusValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for DbusValue {
    fn from(value: bool) -> Self {
        DbusValue::Bool(value)
    }
}

impl From<&str> for DbusValue {
    fn from(value: &str) -> Self {
        DbusValue::Str(value.to_string())
    }
}

/// Member name carried by an event header line.
pub fn parse_header(line: &str) -> Option<&str> {
    HEADER
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Filter for background job acknowledgements.
pub fn subscription_ack() -> PatternSet {
    PatternSet::from(&*SUBSCRIPTION_ACK)
}

/// Process id from a background job acknowledgement.
pub fn parse_subscription_ack(line: &str) -> Option<u32> {
    SUBSCRIPTION_ACK
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|pid| pid.as_str().parse().ok())
}

/// Signals and methods of one D-Bus interface, with their wire shapes.
#[derive(Debug, Clone)]
pub struct SignalCatalog {
    interface: String,
    destination: String,
    object_path: String,
    arities: IndexMap<String, usize>,
    replies: IndexMap<String, Regex>,
}

impl SignalCatalog {
    /// Create an empty catalog for an interface.
    pub fn new(
        interface: impl Into<String>,
        destination: impl Into<String>,
        object_path: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            destination: destination.into(),
            object_path: object_path.into(),
            arities: IndexMap::new(),
            replies: IndexMap::new(),
        }
    }

    /// Add a signal with the number of result lines following its header.
    pub fn with_signal(mut self, name: impl Into<String>, arity: usize) -> Self {
        self.arities.insert(name.into(), arity.max(1));
        self
    }

    /// Add a method with the shape of its reply line.
    pub fn with_method(mut self, name: impl Into<String>, reply: &str) -> Result<Self, regex::Error> {
        self.replies.insert(name.into(), Regex::new(reply)?);
        Ok(self)
    }

    /// Add a method that replies with a boolean.
    pub fn with_bool_method(mut self, name: impl Into<String>) -> Self {
        self.replies.insert(name.into(), BOOL_REPLY.clone());
        self
    }

    /// D-Bus interface name.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Result count of a known signal.
    pub fn arity(&self, signal: &str) -> Option<usize> {
        self.arities.get(signal).copied()
    }

    /// Known signal names.
    pub fn signals(&self) -> impl Iterator<Item = &str> {
        self.arities.keys().map(String::as_str)
    }

    /// Reply shape of a known method.
    pub fn reply_shape(&self, method: &str) -> Option<&Regex> {
        self.replies.get(method)
    }

    /// Filter for the lines the correlator consumes.
    pub fn record_lines(&self) -> PatternSet {
        [HEADER.clone(), RESULT.clone()].into_iter().collect()
    }

    /// Shell command starting a background monitor for one signal.
    pub fn monitor_command(&self, signal: &str) -> String {
        format!(
            "dbus-monitor --system \"type='signal',interface='{}',member='{}'\" &",
            self.interface, signal
        )
    }

    /// Shell command calling a method, optionally with one string argument.
    pub fn method_command(&self, method: &str, parameter: Option<&str>) -> String {
        let mut command = format!(
            "dbus-send --system --print-reply --dest={} {} {}.{}",
            self.destination, self.object_path, self.interface, method
        );
        if let Some(parameter) = parameter {
            command.push_str(&format!(" string:\"{parameter}\""));
        }
        command
    }

    /// Shell command listing a monitor process.
    pub fn process_check_command(&self, pid: u32) -> String {
        format!("ps | grep {pid}")
    }

    /// Shell command stopping a monitor process.
    pub fn kill_command(&self, pid: u32) -> String {
        format!("kill {pid}")
    }

    /// Shape of the `ps` line describing a running monitor process.
    pub fn monitor_process(&self, pid: u32) -> PatternSet {
        Regex::new(&format!(r"^\s*{pid}\s.*dbus-monitor"))
            .map(PatternSet::from)
            .unwrap_or_else(|_| PatternSet::empty())
    }

    /// The firmware manager service of the board.
    pub fn firmware_manager() -> Self {
        FIRMWARE_MANAGER.clone()
    }
}

impl Default for SignalCatalog {
    fn default() -> Self {
        Self::firmware_manager()
    }
}

static BOOL_REPLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"boolean (true|false)").expect("literal regex"));

static FIRMWARE_MANAGER: Lazy<SignalCatalog> = Lazy::new(|| {
    let catalog = SignalCatalog::new(
        "org.firmwaremanager.FirmwareInterface",
        "org.firmwaremanager",
        "/instance",
    )
    // Firmware events carry one value
    .with_signal("newFirmwareAvailable", 1)
    .with_signal("forcedFirmwareChecked", 1)
    .with_signal("firmwareUpdateState", 1)
    .with_signal("firmwareCheckResults", 1)
    // Package events carry the package name first
    .with_signal("newPackageAvailable", 2)
    .with_signal("forcedPackageChecked", 2)
    .with_signal("packageUpdateState", 2)
    .with_signal("packageCheckResults", 1);

    let catalog = [
        "forceUpdate",
        "suspendFirmwareUpdate",
        "resumeFirmwareUpdate",
        "rejectFirmwareUpdate",
        "forceFirmwareUpdate",
        "switchToAltFirmware",
        "suspendPackageUpdate",
        "resumePackageUpdate",
        "rejectPackageUpdate",
        "forcePackageUpdate",
    ]
    .into_iter()
    .fold(catalog, |catalog, method| catalog.with_bool_method(method));

    [
        ("getCurrentPartition", r#"string "(A|B)""#),
        ("getCurrentSWversion", r#"string "(\d+|Undefined)""#),
        ("getAltSWversion", r#"string "(\d+|Undefined)""#),
        ("getSwVersion", r#"string "\d+\.\d+""#),
        ("getCurrentBootDev", r#"string "(eMMC|SD-card)""#),
    ]
    .into_iter()
    .try_fold(catalog, |catalog, (method, reply)| catalog.with_method(method, reply))
    .expect("literal regex")
});
