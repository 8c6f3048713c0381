use std::fmt::Display;
use std::sync::Arc;

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::{actions::Handshake, config::AccessEntry};

/// An opaque user key.
///
/// This subsystem never interprets it; it only compares it against
/// booking records.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    name: Arc<String>,
}

impl Identity {
    /// Create a new identity.
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::new(name.into()),
        }
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A booking slot: one wall-clock hour, 0-23.
///
/// Displays as the window it covers, e.g. `08:00-09:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot(u32);

impl Slot {
    /// The slot covering the given hour. Wraps at 24.
    pub fn new(hour: u32) -> Self {
        Self(hour % 24)
    }

    /// The slot covering the local wall clock right now.
    pub fn current() -> Self {
        Self::new(chrono::Local::now().hour())
    }

    /// The hour this slot starts at.
    pub fn hour(&self) -> u32 {
        self.0
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = (self.0 + 1) % 24;
        write!(f, "{:02}:00-{end:02}:00", self.0)
    }
}

/// Resolves a handshake to an identity, or doesn't.
///
/// Token verification and credential checking live outside this
/// subsystem; implementations are injected at server construction.
pub trait Authenticator: Send + Sync {
    /// `Some` iff the handshake belongs to a known identity.
    fn verify(&self, handshake: &Handshake) -> Option<Identity>;
}

/// Answers whether an identity holds a booking slot.
pub trait BookingStore: Send + Sync {
    /// `true` iff `identity` has booked `slot`.
    fn is_booked_at(&self, identity: &Identity, slot: Slot) -> bool;
}

/// Access table loaded from the configuration file.
///
/// The binary's stand-in for an external token service and booking
/// database: each entry names an identity, how it authenticates, and
/// which hours it has booked.
pub struct AccessTable {
    entries: Vec<AccessEntry>,
}

impl AccessTable {
    /// A table over the given entries.
    pub fn new(entries: Vec<AccessEntry>) -> Self {
        Self { entries }
    }
}

impl Authenticator for AccessTable {
    fn verify(&self, handshake: &Handshake) -> Option<Identity> {
        let entry = match handshake {
            Handshake::Token { token } => self
                .entries
                .iter()
                .find(|entry| entry.token.as_deref() == Some(token)),
            Handshake::Credentials { email, password } => self.entries.iter().find(|entry| {
                entry.email.as_deref() == Some(email) && entry.password.as_deref() == Some(password)
            }),
        };

        entry.map(|entry| Identity::new(&entry.identity))
    }
}

impl BookingStore for AccessTable {
    fn is_booked_at(&self, identity: &Identity, slot: Slot) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.identity == identity.as_str() && entry.hours.contains(&slot.hour()))
    }
}
