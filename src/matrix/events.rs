//! Inbound events handed from the protocol client to the dispatcher.

use std::fmt;

use serde_json::Value;

/// Stable reference to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRef {
    /// Room ID, e.g. `!abc:example.org`
    pub room_id: String,
    /// Canonical alias of the room, or its ID when it has no alias
    pub machine_name: String,
}

impl RoomRef {
    /// Creates a reference to a room without a canonical alias.
    #[cfg(test)]
    pub fn new(room_id: &str) -> Self {
        RoomRef {
            room_id: room_id.to_owned(),
            machine_name: room_id.to_owned(),
        }
    }

    /// Creates a reference to a room, using `alias` as machine name when present.
    pub fn with_alias(room_id: &str, alias: Option<&str>) -> Self {
        RoomRef {
            room_id: room_id.to_owned(),
            machine_name: alias.unwrap_or(room_id).to_owned(),
        }
    }
}

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.room_id)
    }
}

/// A text message received in a joined room.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub room: RoomRef,
    pub sender: String,
    pub event_id: String,
    pub body: String,
    /// Server-side timestamp, in milliseconds since the epoch
    pub server_timestamp: u64,
    /// Full JSON of the original event
    pub source: Value,
}

impl MessageEvent {
    /// The event type as found in the original event, `m.room.message` by default.
    pub fn event_type(&self) -> &str {
        self.source
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("m.room.message")
    }
}

/// To-device events driving a SAS verification.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationEvent {
    Start {
        sender: String,
        from_device: String,
        transaction_id: String,
        /// Proposed short authentication string methods, e.g. `["decimal", "emoji"]`
        short_authentication_string: Vec<String>,
    },
    Cancel {
        sender: String,
        transaction_id: String,
        code: String,
        reason: String,
    },
    Key {
        sender: String,
        transaction_id: String,
    },
    Mac {
        sender: String,
        transaction_id: String,
    },
}

impl VerificationEvent {
    pub fn transaction_id(&self) -> &str {
        match self {
            VerificationEvent::Start { transaction_id, .. }
            | VerificationEvent::Cancel { transaction_id, .. }
            | VerificationEvent::Key { transaction_id, .. }
            | VerificationEvent::Mac { transaction_id, .. } => transaction_id,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            VerificationEvent::Start { sender, .. }
            | VerificationEvent::Cancel { sender, .. }
            | VerificationEvent::Key { sender, .. }
            | VerificationEvent::Mac { sender, .. } => sender,
        }
    }

    /// Protocol event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            VerificationEvent::Start { .. } => "m.key.verification.start",
            VerificationEvent::Cancel { .. } => "m.key.verification.cancel",
            VerificationEvent::Key { .. } => "m.key.verification.key",
            VerificationEvent::Mac { .. } => "m.key.verification.mac",
        }
    }
}

/// Every event a sync round can hand to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Text message in a joined room
    Message(MessageEvent),
    /// SAS verification step
    Verification(VerificationEvent),
    /// Any room timeline event, messages included
    Timeline { room: RoomRef, event_type: String },
    /// Any to-device event, verification steps included
    ToDevice { sender: String, event_type: String },
    /// Typing notifications, receipts...
    Ephemeral { room: RoomRef, event_type: String },
    /// Global (`room` is `None`) or room account data
    AccountData {
        room: Option<RoomRef>,
        event_type: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_ref_machine_name() {
        let room = RoomRef::with_alias("!abc:example.org", Some("#general:example.org"));
        assert_eq!(room.machine_name, "#general:example.org");
        assert_eq!(room.to_string(), "!abc:example.org");

        let room = RoomRef::with_alias("!abc:example.org", None);
        assert_eq!(room.machine_name, "!abc:example.org");
        assert_eq!(room, RoomRef::new("!abc:example.org"));
    }

    #[test]
    fn test_message_event_type() {
        let mut event = MessageEvent {
            room: RoomRef::new("!room:example.com"),
            sender: "@alice:example.com".to_owned(),
            event_id: "$1".to_owned(),
            body: "Hello".to_owned(),
            server_timestamp: 0,
            source: json!({"type": "m.room.message"}),
        };
        assert_eq!(event.event_type(), "m.room.message");

        event.source = json!({"type": "m.custom"});
        assert_eq!(event.event_type(), "m.custom");

        event.source = json!({});
        assert_eq!(event.event_type(), "m.room.message");
    }

    #[test]
    fn test_verification_accessors() {
        let event = VerificationEvent::Cancel {
            sender: "@bob:example.org".to_owned(),
            transaction_id: "txn".to_owned(),
            code: "m.user".to_owned(),
            reason: "user cancelled".to_owned(),
        };
        assert_eq!(event.transaction_id(), "txn");
        assert_eq!(event.sender(), "@bob:example.org");
        assert_eq!(event.type_name(), "m.key.verification.cancel");
    }
}
