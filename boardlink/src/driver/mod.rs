//! High-level console driving.
//!
//! The driver layer moves the board between bootloader, login prompt and
//! shell, waits for network links after boot, and wires a console together
//! with its consumers.

mod builder;
mod links;
mod machine;
mod state;

pub use builder::{Console, ConsoleBuilder};
pub use links::LinkReadiness;
pub use machine::SessionStateMachine;
pub use state::SessionState;
