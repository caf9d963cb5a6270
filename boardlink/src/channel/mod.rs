//! Line channel over the console byte stream.
//!
//! This module turns raw console chunks into logical lines and delivers them
//! to pulling consumers and filtered push callbacks.

pub mod callbacks;
pub mod decoder;
pub mod patterns;
pub mod session;

pub use callbacks::{CallbackRegistry, LineCallback, SkipSet};
pub use decoder::LineDecoder;
pub use patterns::{PatternSet, PromptShapes};
pub use session::{ConsoleSession, DEFAULT_EOL};
