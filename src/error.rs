use thiserror::Error;

use crate::auth::Slot;

/// Errors that may occur in this library.
///
/// The `Display` text of the client-facing variants is exactly what goes
/// over the wire inside an `error` message.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested device index is not present in the current scan.
    #[error("Device {0} not found or invalid")]
    NoSuchDevice(usize),

    /// The handshake payload could not be parsed.
    #[error("Invalid JSON in authentication message")]
    BadHandshake,

    /// No identity could be resolved from the handshake.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The identity does not hold the current booking slot.
    #[error("You must have booked the current time slot ({slot}) to access device {device}")]
    NotBooked {
        /// The slot that would have to be booked.
        slot: Slot,

        /// The device that was asked for.
        device: usize,
    },

    /// The serial port could not be opened.
    /// Permissions, port busy, device gone.
    #[error("Could not open port at {path}, problem: {problem}")]
    PortOpen {
        /// The path to the port.
        path: String,

        /// Why opening failed.
        problem: String,
    },

    /// A reader could not be started for the device.
    #[error("Failed to start reading from device {0}")]
    SessionStart(usize),

    /// The configuration file is not usable.
    #[error("Bad config: {0}")]
    BadConfig(String),
}

impl Error {
    /// The bad-config explanation, if that's what this error is.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(problem) = self {
            Ok(problem)
        } else {
            Err(self)
        }
    }
}
