//! Events emitted by the system and the bitmask webhooks subscribe with.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Kind of an event. Each variant is a single bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventType {
    BuildSubmitted = 1 << 0,
    BuildStarted = 1 << 1,
    BuildFinished = 1 << 2,
    BuildTagged = 1 << 3,
    InviteSent = 1 << 4,
    InviteAccepted = 1 << 5,
    InviteRejected = 1 << 6,
    Namespaces = 1 << 7,
    Cron = 1 << 8,
    Images = 1 << 9,
    Objects = 1 << 10,
    Variables = 1 << 11,
    SshKeys = 1 << 12,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl EventType {
    pub const ALL: [EventType; 13] = [
        EventType::BuildSubmitted,
        EventType::BuildStarted,
        EventType::BuildFinished,
        EventType::BuildTagged,
        EventType::InviteSent,
        EventType::InviteAccepted,
        EventType::InviteRejected,
        EventType::Namespaces,
        EventType::Cron,
        EventType::Images,
        EventType::Objects,
        EventType::Variables,
        EventType::SshKeys,
    ];

    pub fn bit(self) -> u32 {
        self as u32
    }

    /// Lowercased dotted wire form, as sent in the `X-Event` header.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::BuildSubmitted => "build.submitted",
            EventType::BuildStarted => "build.started",
            EventType::BuildFinished => "build.finished",
            EventType::BuildTagged => "build.tagged",
            EventType::InviteSent => "invite.sent",
            EventType::InviteAccepted => "invite.accepted",
            EventType::InviteRejected => "invite.rejected",
            EventType::Namespaces => "namespaces",
            EventType::Cron => "cron",
            EventType::Images => "images",
            EventType::Objects => "objects",
            EventType::Variables => "variables",
            EventType::SshKeys => "ssh_keys",
        }
    }

    pub fn from_bit(bit: u32) -> Option<EventType> {
        EventType::ALL.iter().copied().find(|t| t.bit() == bit)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Set of event types a webhook subscribes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);

    pub fn all() -> EventMask {
        EventType::ALL.iter().copied().map(EventMask::from).fold(EventMask::NONE, |a, b| a | b)
    }

    pub fn from_bits(bits: u32) -> EventMask {
        EventMask(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `typ` is set in the mask.
    pub fn contains(self, typ: EventType) -> bool {
        self.0 & typ.bit() == typ.bit()
    }

    /// Event types present in the mask, in declaration order.
    pub fn types(self) -> Vec<EventType> {
        EventType::ALL
            .iter()
            .copied()
            .filter(|t| self.contains(*t))
            .collect()
    }
}

impl From<EventType> for EventMask {
    fn from(t: EventType) -> Self {
        EventMask(t.bit())
    }
}

impl BitOr for EventType {
    type Output = EventMask;

    fn bitor(self, rhs: EventType) -> EventMask {
        EventMask(self.bit() | rhs.bit())
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOr<EventType> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventType) -> EventMask {
        EventMask(self.0 | rhs.bit())
    }
}

impl BitOrAssign<EventType> for EventMask {
    fn bitor_assign(&mut self, rhs: EventType) {
        self.0 |= rhs.bit();
    }
}

/// An event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub namespace_id: Option<i64>,
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(namespace_id: Option<i64>, event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace_id,
            event_type,
            data,
            created_at: Utc::now(),
        }
    }
}
