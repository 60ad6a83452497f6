//! Address allocation and the on-disk naming convention.
//!
//! Every queued payload lives in a backing file named
//! `<role>_<direction>_<address>`, where the address is a 4-digit,
//! zero-padded token. The same prefixes name the fixed transfer slots
//! handed to the transport, so both endpoints agree on what belongs to whom.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of digits in an address token.
pub const ADDRESS_WIDTH: usize = 4;

/// Size of the representable address space (`0000..=9999`).
pub const ADDRESS_SPACE: u32 = 10_000;

/// Key of the serialized queue sequence.
pub const QUEUE_KEY: &str = "file-queue";

/// Key of the serialized configuration.
pub const CONFIG_KEY: &str = "delivert_config";

/// Identity of a queued payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address(u32);

impl Address {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Fixed-width token. Keeps only the last four digits, so values past the
    /// address space wrap instead of widening the file name.
    pub fn token(&self) -> String {
        format!("{:0width$}", self.0 % ADDRESS_SPACE, width = ADDRESS_WIDTH)
    }

    /// Parse an all-digit token.
    pub fn parse(token: &str) -> Option<Self> {
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        token.parse().ok().map(Self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.token()
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Address::parse(&s).ok_or_else(|| format!("invalid address token: {:?}", s))
    }
}

/// Next address after the highest one currently on disk.
///
/// Never refuses: checking the result against the namespace ceiling is the
/// caller's job.
pub fn next_address(current_max_offset: u32) -> Address {
    Address(current_max_offset.saturating_add(1))
}

/// Which side of the link this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Persists a backlog when the transport is unavailable (watch role).
    Buffering,
    /// Always transfers immediately, no durable backlog (companion role).
    Transient,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Buffering => "watch",
            Endpoint::Transient => "companion",
        }
    }

    /// Prefix shared by this endpoint's payload files and transfer names.
    pub fn prefix(&self) -> &'static str {
        match self {
            Endpoint::Buffering => "delivert_watch_",
            Endpoint::Transient => "delivert_companion_",
        }
    }

    /// The opposite endpoint, whose artifacts arrive here as inbound files.
    pub fn peer(&self) -> Endpoint {
        match self {
            Endpoint::Buffering => Endpoint::Transient,
            Endpoint::Transient => Endpoint::Buffering,
        }
    }

    /// Backing file name for a queued payload.
    pub fn payload_name(&self, address: Address) -> String {
        format!("{}{}", self.prefix(), address.token())
    }

    /// Transport-level name for a transfer slot. Slot indices are not padded.
    pub fn transfer_name(&self, slot: usize) -> String {
        format!("{}{}", self.prefix(), slot)
    }

    /// Recover the address from a payload file name belonging to this endpoint.
    pub fn parse_payload_name(&self, name: &str) -> Option<Address> {
        name.strip_prefix(self.prefix()).and_then(Address::parse)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
