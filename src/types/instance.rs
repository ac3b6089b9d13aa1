use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Primary key of an instance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub i32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the tenant account that owns instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub i32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A durable instance record as stored by the persistence layer.
///
/// `pairing_identity` and `qr_code` use empty strings for "absent", matching
/// the column defaults; use the accessor methods to get `Option`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRow {
    pub id: InstanceId,
    pub account_id: AccountId,
    pub name: String,
    pub token: String,
    pub webhook: String,
    pub pairing_identity: String,
    pub qr_code: String,
    pub connected: bool,
    pub events: String,
    pub expiration: Option<i64>,
}

impl InstanceRow {
    pub fn pairing_identity(&self) -> Option<&str> {
        non_empty(&self.pairing_identity)
    }

    pub fn qr_code(&self) -> Option<&str> {
        non_empty(&self.qr_code)
    }

    pub fn event_filter(&self) -> EventFilter {
        EventFilter::parse(&self.events)
    }

    /// Whether the instance expired before `now`. Rows without an expiration
    /// never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            Some(ts) if ts > 0 => ts <= now.timestamp(),
            _ => false,
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}

/// Fields supplied when an instance is created by account management.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewInstance {
    pub account_id: i32,
    pub name: String,
    pub token: String,
    pub webhook: String,
    pub events: String,
    pub expiration: Option<i64>,
}

/// Kinds of protocol events a tenant can subscribe its webhook to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Message,
    ReadReceipt,
    Presence,
    HistorySync,
    ChatPresence,
    Connection,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Message,
        EventKind::ReadReceipt,
        EventKind::Presence,
        EventKind::HistorySync,
        EventKind::ChatPresence,
        EventKind::Connection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "Message",
            EventKind::ReadReceipt => "ReadReceipt",
            EventKind::Presence => "Presence",
            EventKind::HistorySync => "HistorySync",
            EventKind::ChatPresence => "ChatPresence",
            EventKind::Connection => "Connection",
        }
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or(())
    }
}

/// Parsed event-subscription filter of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFilter {
    #[default]
    All,
    Only(Vec<EventKind>),
}

impl EventFilter {
    /// Parses the stored comma-separated filter. An empty string or `All`
    /// subscribes to everything; unknown names are dropped.
    pub fn parse(raw: &str) -> Self {
        let mut kinds = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part.eq_ignore_ascii_case("all") {
                return EventFilter::All;
            }
            match part.parse::<EventKind>() {
                Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
                Ok(_) => {}
                Err(()) => log::debug!("Ignoring unknown event kind {part:?} in filter"),
            }
        }
        if kinds.is_empty() {
            EventFilter::All
        } else {
            EventFilter::Only(kinds)
        }
    }

    pub fn allows(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(kinds) => kinds.contains(&kind),
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFilter::All => f.write_str("All"),
            EventFilter::Only(kinds) => {
                let names: Vec<&str> = kinds.iter().map(EventKind::as_str).collect();
                f.write_str(&names.join(","))
            }
        }
    }
}
