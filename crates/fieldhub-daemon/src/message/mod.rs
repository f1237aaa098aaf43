//! Message and identity types shared across the daemon.
//!
//! Everything that flows over the bus is a [`Msg`] published under a
//! [`Topic`]. Externally sourced messages use their first byte as the
//! topic; the daemon adds a few synthetic topics for connection and sync
//! lifecycle events.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Pattern matching a receiver serial number.
pub const SERNO_PATTERN: &str = "SG-[0-9A-Za-z]{12}";

static SERNO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{SERNO_PATTERN}$")).expect("static regex is valid")
});

/// Sender of synthetic, internally generated messages.
pub const SENDER_SELF: &str = "me";

/// A receiver serial number, e.g. `SG-1234BBBK9812`.
///
/// Construction validates against [`SERNO_PATTERN`]; comparison is
/// byte-exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serno(String);

impl Serno {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `s` is an admissible serial number.
    pub fn is_valid(s: &str) -> bool {
        SERNO_RE.is_match(s)
    }
}

impl FromStr for Serno {
    type Err = InvalidSerno;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidSerno(s.to_string()))
        }
    }
}

impl fmt::Display for Serno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The given string is not a receiver serial number.
#[derive(Debug, Clone, thiserror::Error)]
#[error("not a receiver serial number: {0:?}")]
pub struct InvalidSerno(pub String);

/// A bus topic: a short tag routing messages to subscribers.
///
/// Externally sourced messages use their first byte; synthetic topics are
/// the digit constants below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic(pub char);

impl Topic {
    /// Receiver disconnected from ssh.
    pub const DISCONNECT: Topic = Topic('0');
    /// Receiver connected via ssh.
    pub const CONNECT: Topic = Topic('1');
    /// Data sync with the upstream service was launched.
    pub const SYNC_LAUNCHED: Topic = Topic('2');
    /// Data sync has been scheduled for a future time.
    pub const SYNC_PENDING: Topic = Topic('3');
    /// From receiver: GPS fix.
    pub const GPS: Topic = Topic('G');
    /// From receiver: machine information.
    pub const MACHINE_INFO: Topic = Topic('M');
    /// From receiver: time sync.
    pub const TIME_SYNC: Topic = Topic('C');
    /// From receiver: setting for a device.
    pub const DEVICE_SETTING: Topic = Topic('S');
    /// From receiver: device was added.
    pub const DEVICE_ADDED: Topic = Topic('A');
    /// From receiver: device was removed.
    pub const DEVICE_REMOVED: Topic = Topic('R');
    /// From receiver: tag was detected.
    pub const TAG_DETECTED: Topic = Topic('p');

    /// Topic for an externally sourced message: its first byte.
    pub fn of_text(text: &str) -> Option<Topic> {
        text.as_bytes().first().map(|&b| Topic(b as char))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message observed by (or generated inside) the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    /// Timestamp; `None` means "fill in at consumption".
    pub ts: Option<DateTime<Utc>>,
    /// Typically a receiver serial number, or [`SENDER_SELF`] for
    /// internally generated messages.
    pub sender: String,
    /// Opaque payload, typically JSON- or CSV-formatted.
    pub text: String,
}

impl Msg {
    /// A message stamped with the current wall clock.
    pub fn now(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            ts: Some(Utc::now()),
            sender: sender.into(),
            text: text.into(),
        }
    }

    /// Sender parsed as a serial number, when it is one.
    pub fn sender_serno(&self) -> Option<Serno> {
        self.sender.parse().ok()
    }
}
