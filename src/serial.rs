//! One session per device: exclusive ownership of the port, a reader
//! thread assembling lines, a trailing output window, and observers
//! notified of every update.

/// Splits incoming byte chunks into delimited lines.
pub(crate) mod lines;

/// Where a session's bytes come from: a real port or a mock.
pub(crate) mod source;

mod manager;

pub use manager::{ObserverId, SessionManager, DEFAULT_BAUD, OUTPUT_WINDOW};
