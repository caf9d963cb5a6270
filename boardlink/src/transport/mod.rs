//! Physical links to the board.
//!
//! Every link is owned by a [`TransportReader`] which runs one background
//! read task, fans frames out to raw callbacks and optionally queues them for
//! pull-style consumers. Two links are provided: a UART ([`SerialLink`]) and
//! a CAN bus reached through a network SLCAN adapter ([`SlcanLink`]).

pub mod config;
pub mod reader;
pub mod serial;
pub mod slcan;

pub use config::{CanConfig, Parity, SerialConfig, StopBits};
pub use reader::{
    Frame, FrameReader, FrameWriter, Link, LinkFrame, RawCallback, TransportReader,
};
pub use serial::{ByteReader, ByteWriter, SerialLink, SerialTransport};
pub use slcan::{CanFrame, CanTransport, SlcanLink};
