//! Error types for boardlink.
//!
//! Waits never fail with an error: a wait that runs out of time resolves to
//! `None` or `false`. The types here cover what cannot be expressed as an
//! absent value.

use std::io;
use thiserror::Error;

/// Main error type for boardlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level errors (opening, reconfiguring, writing)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Event correlation errors
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Board profile and builder errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link could not be opened or configured. Fatal to the transport
    /// instance; there is no automatic retry.
    #[error("Connection failed to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The requested link parameters cannot be applied.
    #[error("Invalid link configuration: {message}")]
    InvalidConfig { message: String },

    /// Writing to the link failed.
    #[error("Write failed on {endpoint}: {source}")]
    Write {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The transport has been closed.
    #[error("Transport not open")]
    NotOpen,
}

/// A line of adapter output that could not be decoded.
///
/// Never fatal: the reader logs it, drops the offending unit and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot decode {kind} from {text:?}")]
pub struct DecodeError {
    /// What was being decoded.
    pub kind: &'static str,
    /// The offending text.
    pub text: String,
}

impl DecodeError {
    pub(crate) fn new(kind: &'static str, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// The remote monitor produced lines outside the expected record shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A new event header arrived before the previous record was complete.
    /// The partial record was discarded.
    #[error(
        "header for '{received}' arrived while '{pending}' still expected results \
         ({collected} collected); partial record discarded"
    )]
    HeaderDuringAccumulation {
        pending: String,
        received: String,
        collected: usize,
    },
}

/// Board profile and builder errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required setting is missing or inconsistent.
    #[error("Invalid board profile: {message}")]
    InvalidProfile { message: String },

    /// A prompt or filter pattern does not compile.
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Result type alias using boardlink's Error.
pub type Result<T> = std::result::Result<T, Error>;
