//! Board profiles.
//!
//! A [`BoardProfile`] bundles the prompt shapes, command vocabulary,
//! credentials, timeouts and monitored network links of one kind of board.

pub mod profile;
pub mod uboot_linux;

pub use profile::{BoardProfile, BootDevice, ConsoleCommands, Credentials, Timeouts};
