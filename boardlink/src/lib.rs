//! # Boardlink
//!
//! Async plumbing for driving an embedded Linux board in test automation:
//! its serial console, a CAN bus behind a network SLCAN adapter, and the
//! D-Bus services reached through the console shell.
//!
//! ## Layers
//!
//! - [`transport`]: background readers over a UART or an SLCAN adapter,
//!   fanning frames out to a pull queue and raw callbacks
//! - [`channel`]: the console as logical lines, with pull and filtered push
//!   delivery and a skip list
//! - [`dbus`]: signal records reassembled from `dbus-monitor` output and
//!   method calls through `dbus-send`
//! - [`driver`]: bootloader / login / shell transitions and the network
//!   readiness barrier
//! - [`platform`]: board profiles (prompts, commands, credentials, timeouts)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use boardlink::ConsoleBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), boardlink::Error> {
//!     let console = ConsoleBuilder::new("/dev/ttyUSB0")
//!         .hostname("imx6-board")
//!         .password("secret")
//!         .build()
//!         .await?;
//!
//!     if console.machine().login(true).await {
//!         console.dbus().subscribe("newFirmwareAvailable").await?;
//!         if let Some(signal) = console.dbus().get_signal(Duration::from_secs(60)).await {
//!             println!("{} {:?}", signal.name, signal.results);
//!         }
//!     }
//!
//!     console.close().await
//! }
//! ```

pub mod callback;
pub mod channel;
pub mod dbus;
pub mod driver;
pub mod error;
pub mod platform;
pub mod transport;

// Re-export main types for convenience
pub use callback::CallbackHandle;
pub use channel::{ConsoleSession, PatternSet, PromptShapes};
pub use dbus::{DbusValue, SignalCatalog, SignalCorrelator, SignalRecord};
pub use driver::{Console, ConsoleBuilder, LinkReadiness, SessionState, SessionStateMachine};
pub use error::Error;
pub use platform::{BoardProfile, BootDevice, Credentials, Timeouts};
pub use transport::{CanConfig, CanFrame, CanTransport, SerialConfig, SerialTransport};
