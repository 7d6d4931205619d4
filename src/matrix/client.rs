//! matrix-sdk implementation of [`ProtocolClient`].
//!
//! Event handlers registered on the SDK client turn the events of a sync into
//! [`InboundEvent`]s pushed on a channel, [`MatrixClient::sync_once`] drains the
//! channel once the SDK is done with the response. The SDK keeps the encryption
//! state in its SQLite store and handles the key requests itself during every
//! sync.

use std::path::Path;

use log::{debug, info, log_enabled, warn};
use matrix_sdk::{
    Client, ClientBuildError, HttpError, Room, RoomMemberships, RoomState, SessionMeta,
    SessionTokens,
    authentication::matrix::MatrixSession,
    config::SyncSettings,
    encryption::verification::SasVerification,
    event_handler::EventHandlerHandle,
    ruma::{
        OwnedEventId, OwnedRoomId, OwnedUserId, RoomAliasId, RoomId, RoomOrAliasId, UserId,
        api::client::{error::ErrorKind, receipt::create_receipt::v3::ReceiptType},
        events::{
            AnyGlobalAccountDataEvent, AnyRoomAccountDataEvent, AnySyncEphemeralRoomEvent,
            AnySyncTimelineEvent, AnyToDeviceEvent,
            key::verification::{
                cancel::ToDeviceKeyVerificationCancelEvent,
                key::ToDeviceKeyVerificationKeyEvent,
                mac::ToDeviceKeyVerificationMacEvent,
                request::ToDeviceKeyVerificationRequestEvent,
                start::{StartMethod, ToDeviceKeyVerificationStartEvent},
            },
            receipt::ReceiptThread,
            room::message::{MessageType, OriginalSyncRoomMessageEvent},
        },
        serde::Raw,
    },
};
use serde_json::{Map, Value};
use tokio::sync::{
    Mutex,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use crate::{
    error::{Error, Result},
    matrix::{
        dispatch::LogTiers,
        events::{InboundEvent, MessageEvent, RoomRef, VerificationEvent},
        protocol::{ClientError, MessageContent, ProtocolClient, RoomInfo, SyncRequest, SyncRound},
        session::DeviceCredential,
    },
};

const DEFAULT_LOGIN_TYPE: &str = "m.login.password";
const DEVICE_DISPLAY_NAME: &str = "mxmda";

/// Matrix client backed by matrix-sdk.
pub struct MatrixClient {
    client: Client,
    events: Mutex<UnboundedReceiver<InboundEvent>>,
    handlers: Mutex<Vec<EventHandlerHandle>>,
}

impl MatrixClient {
    /// Creates a client for `homeserver`, keeping its state under `store_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientSetup`] if the homeserver URL is invalid or the store
    /// cannot be opened.
    pub async fn new(homeserver: &str, store_dir: &Path, tiers: LogTiers) -> Result<Self> {
        debug!(
            "creating matrix client for {} with store {}",
            homeserver,
            store_dir.display()
        );
        let client = Client::builder()
            .homeserver_url(homeserver)
            .sqlite_store(store_dir, None)
            .build()
            .await
            .map_err(|e: ClientBuildError| Error::ClientSetup(e.to_string()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let handlers = register_handlers(&client, &sender, tiers);

        Ok(MatrixClient {
            client,
            events: Mutex::new(receiver),
            handlers: Mutex::new(handlers),
        })
    }

    fn room(&self, room_id: &str) -> std::result::Result<Room, ClientError> {
        let room_id = RoomId::parse(room_id).map_err(|e| ClientError::Invalid(e.to_string()))?;
        self.client
            .get_room(&room_id)
            .ok_or_else(|| ClientError::UnknownRoom(room_id.to_string()))
    }

    async fn sas(
        &self,
        sender: &str,
        transaction_id: &str,
    ) -> std::result::Result<SasVerification, ClientError> {
        let user_id = parse_user_id(sender)?;
        self.client
            .encryption()
            .get_verification(&user_id, transaction_id)
            .await
            .and_then(|verification| verification.sas())
            .ok_or_else(|| {
                ClientError::LocalProtocol(format!("no SAS verification {transaction_id}"))
            })
    }

    async fn verified_devices(&self, sas: &SasVerification) -> Vec<String> {
        let other = sas.other_device();
        match self.client.encryption().get_user_devices(other.user_id()).await {
            Ok(devices) => devices
                .devices()
                .filter(|device| device.is_verified())
                .map(|device| device.device_id().to_string())
                .collect(),
            Err(e) => {
                warn!("cannot list devices of {}: {}", other.user_id(), e);
                vec![other.device_id().to_string()]
            }
        }
    }
}

impl ProtocolClient for MatrixClient {
    async fn login(
        &self,
        auth: &Map<String, Value>,
    ) -> std::result::Result<DeviceCredential, ClientError> {
        let mut data = auth.clone();
        let login_type = match data.remove("type") {
            Some(Value::String(login_type)) => login_type,
            _ => DEFAULT_LOGIN_TYPE.to_owned(),
        };
        debug!("login with {}", login_type);

        let response = self
            .client
            .matrix_auth()
            .login_custom(&login_type, data)
            .map_err(|e| ClientError::Invalid(e.to_string()))?
            .initial_device_display_name(DEVICE_DISPLAY_NAME)
            .send()
            .await?;

        Ok(DeviceCredential {
            access_token: response.access_token,
            device_id: response.device_id.to_string(),
            user_id: response.user_id.to_string(),
        })
    }

    async fn restore(&self, credential: &DeviceCredential) -> std::result::Result<(), ClientError> {
        let session = MatrixSession {
            meta: SessionMeta {
                user_id: parse_user_id(&credential.user_id)?,
                device_id: credential.device_id.as_str().into(),
            },
            tokens: SessionTokens {
                access_token: credential.access_token.clone(),
                refresh_token: None,
            },
        };
        self.client.restore_session(session).await?;
        Ok(())
    }

    async fn sync_once(&self, request: SyncRequest) -> std::result::Result<SyncRound, ClientError> {
        let mut settings = SyncSettings::default()
            .timeout(request.timeout)
            .full_state(request.full_state);
        if let Some(token) = request.token {
            settings = settings.token(token);
        }

        let response = self.client.sync_once(settings).await?;

        let mut events = vec![];
        let mut receiver = self.events.lock().await;
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }

        Ok(SyncRound {
            summary: log_enabled!(log::Level::Debug).then(|| format!("{response:?}")),
            next_batch: response.next_batch,
            events,
        })
    }

    // The SDK sends its outgoing key requests itself while syncing
    fn should_upload_keys(&self) -> bool {
        false
    }

    fn should_query_keys(&self) -> bool {
        false
    }

    fn should_claim_keys(&self) -> bool {
        false
    }

    fn users_for_key_claiming(&self) -> Vec<String> {
        vec![]
    }

    async fn keys_upload(&self) -> std::result::Result<(), ClientError> {
        Ok(())
    }

    async fn keys_query(&self) -> std::result::Result<(), ClientError> {
        Ok(())
    }

    async fn keys_claim(&self, _users: Vec<String>) -> std::result::Result<(), ClientError> {
        Ok(())
    }

    async fn room_send(
        &self,
        target: &str,
        content: MessageContent,
    ) -> std::result::Result<(), ClientError> {
        let room_id = self.resolve_room(target).await?;
        let room = self.room(&room_id)?;
        room.send_raw("m.room.message", content.to_json()).await?;
        debug!("message sent to {}", room_id);
        Ok(())
    }

    async fn update_receipt_marker(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> std::result::Result<(), ClientError> {
        let room = self.room(room_id)?;
        let event_id =
            OwnedEventId::try_from(event_id).map_err(|e| ClientError::Invalid(e.to_string()))?;
        room.send_single_receipt(ReceiptType::Read, ReceiptThread::Unthreaded, event_id)
            .await?;
        Ok(())
    }

    async fn accept_key_verification(
        &self,
        sender: &str,
        transaction_id: &str,
    ) -> std::result::Result<(), ClientError> {
        self.sas(sender, transaction_id).await?.accept().await?;
        Ok(())
    }

    // The SDK sends our key as soon as the verification is accepted
    async fn share_key(
        &self,
        sender: &str,
        transaction_id: &str,
    ) -> std::result::Result<(), ClientError> {
        let sas = self.sas(sender, transaction_id).await?;
        if sas.is_cancelled() {
            return Err(ClientError::LocalProtocol(format!(
                "verification {transaction_id} is cancelled"
            )));
        }
        Ok(())
    }

    async fn sas_emoji(&self, sender: &str, transaction_id: &str) -> Option<String> {
        let emoji = self.sas(sender, transaction_id).await.ok()?.emoji()?;
        Some(
            emoji
                .iter()
                .map(|emoji| format!("{} {}", emoji.symbol, emoji.description))
                .collect::<Vec<_>>()
                .join(", "),
        )
    }

    async fn confirm_short_auth_string(
        &self,
        sender: &str,
        transaction_id: &str,
    ) -> std::result::Result<(), ClientError> {
        self.sas(sender, transaction_id).await?.confirm().await?;
        Ok(())
    }

    async fn send_mac(
        &self,
        sender: &str,
        transaction_id: &str,
    ) -> std::result::Result<Vec<String>, ClientError> {
        let sas = self.sas(sender, transaction_id).await?;
        if sas.is_cancelled() {
            return Err(ClientError::LocalProtocol(format!(
                "verification {transaction_id} is cancelled"
            )));
        }
        if !sas.is_done() {
            sas.confirm().await?;
        }
        Ok(self.verified_devices(&sas).await)
    }

    async fn join(&self, room: &str) -> std::result::Result<String, ClientError> {
        let room = RoomOrAliasId::parse(room).map_err(|e| ClientError::Invalid(e.to_string()))?;
        let joined = self.client.join_room_by_id_or_alias(&room, &[]).await?;
        Ok(joined.room_id().to_string())
    }

    async fn resolve_room(&self, room: &str) -> std::result::Result<String, ClientError> {
        if room.starts_with('@') {
            let user_id = parse_user_id(room)?;
            return self
                .client
                .get_dm_room(&user_id)
                .map(|dm| dm.room_id().to_string())
                .ok_or_else(|| ClientError::UnknownRoom(room.to_owned()));
        }
        if room.starts_with('#') {
            let alias =
                RoomAliasId::parse(room).map_err(|e| ClientError::Invalid(e.to_string()))?;
            let response = self.client.resolve_room_alias(&alias).await?;
            return Ok(response.room_id.to_string());
        }

        let room_id: OwnedRoomId =
            RoomId::parse(room).map_err(|e| ClientError::Invalid(e.to_string()))?;
        Ok(room_id.to_string())
    }

    async fn leave(&self, room_id: &str) -> std::result::Result<(), ClientError> {
        self.room(room_id)?.leave().await?;
        Ok(())
    }

    async fn forget(&self, room_id: &str) -> std::result::Result<(), ClientError> {
        self.room(room_id)?.forget().await?;
        Ok(())
    }

    async fn rooms(&self) -> std::result::Result<Vec<RoomInfo>, ClientError> {
        let mut rooms = vec![];
        for room in self.client.joined_rooms() {
            let machine_name = room_ref(&room).machine_name;
            let users = room
                .members(RoomMemberships::JOIN)
                .await?
                .iter()
                .map(|member| member.user_id().to_string())
                .collect();
            rooms.push(RoomInfo {
                room_id: room.room_id().to_string(),
                name: room.name().unwrap_or_else(|| machine_name.clone()),
                machine_name,
                member_count: room.joined_members_count(),
                users,
            });
        }
        Ok(rooms)
    }

    async fn close(&self) {
        let handlers: Vec<_> = self.handlers.lock().await.drain(..).collect();
        debug!("removing {} event handlers", handlers.len());
        for handle in handlers {
            self.client.remove_event_handler(handle);
        }
    }
}

fn parse_user_id(user_id: &str) -> std::result::Result<OwnedUserId, ClientError> {
    UserId::parse(user_id).map_err(|e| ClientError::Invalid(format!("{user_id}: {e}")))
}

fn room_ref(room: &Room) -> RoomRef {
    let alias = room.canonical_alias().map(|alias| alias.to_string());
    RoomRef::with_alias(room.room_id().as_str(), alias.as_deref())
}

fn classify(kind: Option<&ErrorKind>, message: String) -> ClientError {
    match kind {
        Some(ErrorKind::UnknownToken { .. }) => ClientError::Unrecoverable(message),
        Some(_) => ClientError::Rejected(message),
        None => ClientError::Transport(message),
    }
}

impl From<matrix_sdk::Error> for ClientError {
    fn from(e: matrix_sdk::Error) -> Self {
        if matches!(e, matrix_sdk::Error::AuthenticationRequired) {
            return ClientError::Unrecoverable(e.to_string());
        }
        classify(e.client_api_error_kind(), e.to_string())
    }
}

impl From<HttpError> for ClientError {
    fn from(e: HttpError) -> Self {
        classify(e.client_api_error_kind(), e.to_string())
    }
}

/// Registers the handlers feeding the event channel.
fn register_handlers(
    client: &Client,
    sender: &UnboundedSender<InboundEvent>,
    tiers: LogTiers,
) -> Vec<EventHandlerHandle> {
    let mut handles = vec![];

    let tx = sender.clone();
    handles.push(client.add_event_handler(
        move |raw: Raw<OriginalSyncRoomMessageEvent>, room: Room| {
            let tx = tx.clone();
            async move {
                // Ignore messages from non-joined rooms
                if room.state() != RoomState::Joined {
                    return;
                }
                let event = match raw.deserialize() {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("ignoring malformed message in {}: {}", room.room_id(), e);
                        return;
                    }
                };
                // Only handle text messages
                let MessageType::Text(text) = event.content.msgtype else {
                    return;
                };
                let source = serde_json::from_str(raw.json().get()).unwrap_or_default();

                let _ = tx.send(InboundEvent::Message(MessageEvent {
                    room: room_ref(&room),
                    sender: event.sender.to_string(),
                    event_id: event.event_id.to_string(),
                    body: text.body,
                    server_timestamp: u64::from(event.origin_server_ts.0),
                    source,
                }));
            }
        },
    ));

    // Accept verification requests so that peers go on with a SAS start
    handles.push(client.add_event_handler(
        |event: ToDeviceKeyVerificationRequestEvent, client: Client| async move {
            let Some(request) = client
                .encryption()
                .get_verification_request(&event.sender, &event.content.transaction_id)
                .await
            else {
                return;
            };
            info!(
                "accepting verification request {} from {}",
                event.content.transaction_id, event.sender
            );
            if let Err(e) = request.accept().await {
                warn!("cannot accept verification request: {}", e);
            }
        },
    ));

    let tx = sender.clone();
    handles.push(client.add_event_handler(
        move |event: ToDeviceKeyVerificationStartEvent| {
            let tx = tx.clone();
            async move {
                let short_authentication_string = match &event.content.method {
                    StartMethod::SasV1(sas) => sas
                        .short_authentication_string
                        .iter()
                        .map(|method| method.as_str().to_owned())
                        .collect(),
                    _ => vec![],
                };
                let _ = tx.send(InboundEvent::Verification(VerificationEvent::Start {
                    sender: event.sender.to_string(),
                    from_device: event.content.from_device.to_string(),
                    transaction_id: event.content.transaction_id.to_string(),
                    short_authentication_string,
                }));
            }
        },
    ));

    let tx = sender.clone();
    handles.push(client.add_event_handler(
        move |event: ToDeviceKeyVerificationCancelEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(InboundEvent::Verification(VerificationEvent::Cancel {
                    sender: event.sender.to_string(),
                    transaction_id: event.content.transaction_id.to_string(),
                    code: event.content.code.as_str().to_owned(),
                    reason: event.content.reason,
                }));
            }
        },
    ));

    let tx = sender.clone();
    handles.push(client.add_event_handler(
        move |event: ToDeviceKeyVerificationKeyEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(InboundEvent::Verification(VerificationEvent::Key {
                    sender: event.sender.to_string(),
                    transaction_id: event.content.transaction_id.to_string(),
                }));
            }
        },
    ));

    let tx = sender.clone();
    handles.push(client.add_event_handler(
        move |event: ToDeviceKeyVerificationMacEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(InboundEvent::Verification(VerificationEvent::Mac {
                    sender: event.sender.to_string(),
                    transaction_id: event.content.transaction_id.to_string(),
                }));
            }
        },
    ));

    if tiers.info {
        let tx = sender.clone();
        handles.push(client.add_event_handler(
            move |event: AnySyncTimelineEvent, room: Room| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(InboundEvent::Timeline {
                        room: room_ref(&room),
                        event_type: event.event_type().to_string(),
                    });
                }
            },
        ));

        let tx = sender.clone();
        handles.push(client.add_event_handler(move |event: AnyToDeviceEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(InboundEvent::ToDevice {
                    sender: event.sender().to_string(),
                    event_type: event.event_type().to_string(),
                });
            }
        }));
    }

    if tiers.debug {
        let tx = sender.clone();
        handles.push(client.add_event_handler(
            move |event: AnySyncEphemeralRoomEvent, room: Room| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(InboundEvent::Ephemeral {
                        room: room_ref(&room),
                        event_type: event.event_type().to_string(),
                    });
                }
            },
        ));

        let tx = sender.clone();
        handles.push(client.add_event_handler(
            move |event: AnyGlobalAccountDataEvent| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(InboundEvent::AccountData {
                        room: None,
                        event_type: event.event_type().to_string(),
                    });
                }
            },
        ));

        let tx = sender.clone();
        handles.push(client.add_event_handler(
            move |event: AnyRoomAccountDataEvent, room: Room| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(InboundEvent::AccountData {
                        room: Some(room_ref(&room)),
                        event_type: event.event_type().to_string(),
                    });
                }
            },
        ));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify(Some(&ErrorKind::NotFound), "M_NOT_FOUND".to_owned()),
            ClientError::Rejected(_)
        ));
        assert!(matches!(
            classify(None, "connection reset".to_owned()),
            ClientError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_identifiers_are_rejected_locally() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let client = MatrixClient::new(
            "https://matrix.example.org",
            temp_dir.path(),
            LogTiers::default(),
        )
        .await
        .unwrap();

        assert!(matches!(
            client.resolve_room("not-a-room").await,
            Err(ClientError::Invalid(_))
        ));
        assert_eq!(
            client.resolve_room("!abc:example.org").await.unwrap(),
            "!abc:example.org"
        );
        assert!(matches!(
            client.update_receipt_marker("!abc:example.org", "$1").await,
            Err(ClientError::UnknownRoom(_))
        ));
        assert!(matches!(
            client.accept_key_verification("bob", "txn").await,
            Err(ClientError::Invalid(_))
        ));
        assert!(client.sas_emoji("@bob:example.org", "txn").await.is_none());
        assert!(!client.should_upload_keys());

        client.close().await;
        assert!(client.handlers.lock().await.is_empty());
    }
}
