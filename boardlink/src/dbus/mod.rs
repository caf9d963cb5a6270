//! D-Bus access through the console shell.
//!
//! The board's D-Bus services are reached with `dbus-monitor` and `dbus-send`
//! run in the logged-in console. [`SignalCorrelator`] reassembles the
//! monitors' multi-line output into [`SignalRecord`]s and turns method calls
//! into request/response exchanges.

pub mod assembler;
pub mod catalog;
pub mod correlator;

pub use assembler::{PendingSignal, SignalAssembler, SignalRecord};
pub use catalog::{DbusValue, SignalCatalog};
pub use correlator::{MAX_VIOLATIONS, SignalCorrelator};
