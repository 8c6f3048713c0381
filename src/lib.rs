#![deny(missing_docs)]

//! Labport owns the serial devices of a shared hardware lab.
//!
//! Each device is read on a dedicated blocking thread. Output is
//! reassembled into complete text lines, kept in a trailing window,
//! and fanned out over websockets to any number of live subscribers.
//!
//! Subscribing is gated: a client must present an identity the
//! external authenticator resolves, and that identity must hold the
//! current booking slot (a wall-clock hour).
//!
//! Devices without hardware attached can be simulated with `mock:`
//! port paths, which is how the integration tests drive the pipeline.

/// The wire protocol: the handshake clients send, and the messages the server pushes.
pub mod actions;

/// Identity resolution and booking-slot authorization.
pub mod auth;

/// Fans a device's output out to its live subscribers.
pub mod broadcast;

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging initialization.
pub mod logging;

/// In-memory stand-ins for serial devices.
pub mod mock;

/// Discovers attached serial devices and classifies their board model.
pub mod registry;

/// Owns serial ports and their reader threads.
pub mod serial;

/// Code relating to setting up the server.
pub mod server;

/// Flashing firmware onto a device via the external upload tool.
pub mod upload;

/// Handles incoming websockets.
pub(crate) mod websocket;
