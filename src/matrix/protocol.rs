//! Capability interface to the Matrix protocol library.
//!
//! The session manager, the dispatcher and the verification machine only talk to
//! the homeserver through [`ProtocolClient`]. [`crate::matrix::MatrixClient`]
//! implements it on top of matrix-sdk, tests use the generated
//! [`MockProtocolClient`].

use std::time::Duration;

use mockall::automock;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::matrix::{events::InboundEvent, session::DeviceCredential};

/// Failure reported by the protocol client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Network or server hiccup, worth retrying later.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The homeserver refused the request.
    #[error("request rejected by homeserver: {0}")]
    Rejected(String),

    /// The session cannot be used anymore (e.g. the access token was revoked).
    #[error("session is no longer usable: {0}")]
    Unrecoverable(String),

    /// The local protocol state refused the operation (e.g. the verification was
    /// already cancelled).
    #[error("local protocol error: {0}")]
    LocalProtocol(String),

    #[error("unknown room {0}")]
    UnknownRoom(String),

    #[error("invalid identifier {0}")]
    Invalid(String),
}

/// Parameters of one sync round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Continuation token of the previous round, `None` to let the client use its stored one
    pub token: Option<String>,
    /// Request the full state of every joined room
    pub full_state: bool,
    /// How long the homeserver may hold the request when nothing happens
    pub timeout: Duration,
}

/// Result of one completed sync round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncRound {
    /// Continuation token for the next round
    pub next_batch: String,
    /// Events received during the round, in protocol order
    pub events: Vec<InboundEvent>,
    /// Rendering of the raw response, only filled when debug logging is enabled
    pub summary: Option<String>,
}

/// Content of an outgoing `m.text` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub body: String,
    /// `org.matrix.custom.html` rendering of the body
    pub formatted_body: Option<String>,
}

impl MessageContent {
    pub fn new(body: &str, html: Option<&str>) -> Self {
        MessageContent {
            body: body.to_owned(),
            formatted_body: html.map(str::to_owned),
        }
    }

    /// JSON content of the `m.room.message` event.
    pub fn to_json(&self) -> Value {
        let mut content = Map::new();
        content.insert("msgtype".to_owned(), Value::from("m.text"));
        content.insert("body".to_owned(), Value::from(self.body.as_str()));
        if let Some(html) = &self.formatted_body {
            content.insert(
                "format".to_owned(),
                Value::from("org.matrix.custom.html"),
            );
            content.insert("formatted_body".to_owned(), Value::from(html.as_str()));
        }
        Value::Object(content)
    }
}

/// Joined room, as listed by the `rooms` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub room_id: String,
    pub machine_name: String,
    pub name: String,
    pub member_count: u64,
    pub users: Vec<String>,
}

/// Operations mxmda needs from a Matrix protocol implementation.
#[automock]
pub trait ProtocolClient {
    /// Logs in with the opaque `auth` payload and returns the new device credential.
    async fn login(&self, auth: &Map<String, Value>) -> Result<DeviceCredential, ClientError>;
    /// Resumes a previous session without logging in.
    async fn restore(&self, credential: &DeviceCredential) -> Result<(), ClientError>;
    /// Runs one sync round.
    async fn sync_once(&self, request: SyncRequest) -> Result<SyncRound, ClientError>;

    /// Device keys need to be uploaded.
    fn should_upload_keys(&self) -> bool;
    /// Device keys of other users need to be queried.
    fn should_query_keys(&self) -> bool;
    /// One-time keys need to be claimed to start new sessions.
    fn should_claim_keys(&self) -> bool;
    fn users_for_key_claiming(&self) -> Vec<String>;
    async fn keys_upload(&self) -> Result<(), ClientError>;
    async fn keys_query(&self) -> Result<(), ClientError>;
    async fn keys_claim(&self, users: Vec<String>) -> Result<(), ClientError>;

    /// Sends an `m.room.message` to a room ID, a room alias or a user.
    async fn room_send(&self, target: &str, content: MessageContent) -> Result<(), ClientError>;
    /// Moves the `m.read` receipt of `room_id` to `event_id`.
    async fn update_receipt_marker(&self, room_id: &str, event_id: &str)
    -> Result<(), ClientError>;

    async fn accept_key_verification(
        &self,
        sender: &str,
        transaction_id: &str,
    ) -> Result<(), ClientError>;
    /// Sends this side's key of the SAS exchange.
    async fn share_key(&self, sender: &str, transaction_id: &str) -> Result<(), ClientError>;
    /// Emoji rendering of the short authentication string, once keys are exchanged.
    async fn sas_emoji(&self, sender: &str, transaction_id: &str) -> Option<String>;
    async fn confirm_short_auth_string(
        &self,
        sender: &str,
        transaction_id: &str,
    ) -> Result<(), ClientError>;
    /// Sends the final MAC and returns the devices verified by the exchange.
    async fn send_mac(&self, sender: &str, transaction_id: &str)
    -> Result<Vec<String>, ClientError>;

    /// Joins a room by ID or alias, returns the room ID.
    async fn join(&self, room: &str) -> Result<String, ClientError>;
    /// Resolves a room ID or alias to a room ID.
    async fn resolve_room(&self, room: &str) -> Result<String, ClientError>;
    async fn leave(&self, room_id: &str) -> Result<(), ClientError>;
    async fn forget(&self, room_id: &str) -> Result<(), ClientError>;
    async fn rooms(&self) -> Result<Vec<RoomInfo>, ClientError>;

    /// Releases the resources held by the client.
    async fn close(&self);
}
