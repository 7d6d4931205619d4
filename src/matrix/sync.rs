//! Session lifecycle and synchronization loop.
//!
//! [`SessionManager`] owns the protocol client for the whole life of the
//! process:
//! 1. [`SessionManager::start`] logs in (persisting the new device) or restores
//!    the stored device, then runs a first full-state sync round
//! 2. [`SessionManager::enter_loop`] keeps syncing, dispatching the events of
//!    every round and reconciling the encryption keys, until it is asked to stop
//!    through its [`CloseHandle`] or the session becomes unusable
//!
//! A close request only interrupts the wait for the homeserver: once a round is
//! received, all its events are dispatched first. Verification confirmations sent
//! through [`SessionManager::confirmation_sender`] are applied while waiting.
//!
//! One-shot commands call [`SessionManager::sync_round`] once instead of
//! entering the loop.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::{
    sync::{
        Notify,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
    },
    time::{Duration, sleep},
};

use crate::{
    config::Config,
    error::{Error, Result},
    matrix::{
        dispatch::{Dispatcher, MessageHandler},
        protocol::{ClientError, MessageContent, ProtocolClient, SyncRequest, SyncRound},
        session::{DeviceCredential, DeviceStore},
    },
};

/// Timeout of the full-state round priming the local state.
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
/// First delay before retrying a failed sync round.
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Requests the end of [`SessionManager::enter_loop`].
///
/// A request made before the loop starts is remembered.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle(Arc<Notify>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.notify_one();
    }

    async fn requested(&self) {
        self.0.notified().await
    }
}

pub struct SessionManager<C, H> {
    client: C,
    dispatcher: Dispatcher<H>,
    device_store: DeviceStore,
    /// Opaque login payload
    auth: Map<String, Value>,
    /// Long-poll timeout of regular rounds
    timeout: Duration,
    homeserver: String,
    credential: Option<DeviceCredential>,
    /// Continuation token of the last completed round
    next_batch: Option<String>,
    close_handle: CloseHandle,
    /// Transaction IDs of verifications to confirm
    confirmations: UnboundedReceiver<String>,
    confirmation_sender: UnboundedSender<String>,
}

impl<C: ProtocolClient, H: MessageHandler> SessionManager<C, H> {
    /// Creates a session over `client`, nothing is sent before [`SessionManager::start`].
    ///
    /// `credential` is the device loaded from `device_store`, if any.
    pub fn new(
        client: C,
        dispatcher: Dispatcher<H>,
        config: &Config,
        homeserver: &str,
        device_store: DeviceStore,
        credential: Option<DeviceCredential>,
    ) -> Self {
        let (confirmation_sender, confirmations) = mpsc::unbounded_channel();
        SessionManager {
            client,
            dispatcher,
            device_store,
            auth: config.auth.clone(),
            timeout: Duration::from_secs(config.timeout),
            homeserver: homeserver.to_owned(),
            credential,
            next_batch: None,
            close_handle: CloseHandle::default(),
            confirmations,
            confirmation_sender,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close_handle.clone()
    }

    /// Sender of the verifications [`SessionManager::enter_loop`] should confirm.
    pub fn confirmation_sender(&self) -> UnboundedSender<String> {
        self.confirmation_sender.clone()
    }

    /// Authenticates the device and primes the local state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the homeserver refuses the login or the
    /// stored device, the persistence error if the new device cannot be saved and
    /// the client error of the first sync round.
    pub async fn start(&mut self) -> Result<()> {
        match &self.credential {
            Some(credential) => {
                info!(
                    "restoring device {} of {} on {}",
                    credential.device_id, credential.user_id, self.homeserver
                );
                self.client
                    .restore(credential)
                    .await
                    .map_err(authentication_error)?;
            }
            None => {
                info!("logging in on {}", self.homeserver);
                let credential = self
                    .client
                    .login(&self.auth)
                    .await
                    .map_err(authentication_error)?;
                info!(
                    "logged in as {} with new device {}",
                    credential.user_id, credential.device_id
                );
                // The device must survive a crash during the first sync
                self.device_store.persist(&credential).await?;
                self.credential = Some(credential);
            }
        }

        self.sync(true, INITIAL_SYNC_TIMEOUT).await?;
        Ok(())
    }

    /// Syncs until a close request or an unrecoverable failure, then closes the session.
    ///
    /// Other failures are retried with an exponential backoff.
    pub async fn enter_loop(&mut self) -> Result<()> {
        info!("start syncing");
        let close_handle = self.close_handle();
        let mut delay = INITIAL_BACKOFF;

        let result = loop {
            let Some(fetched) = self.next_round(&close_handle).await else {
                info!("close requested");
                break Ok(());
            };

            match fetched {
                Ok(round) => {
                    self.process(round).await;
                    delay = INITIAL_BACKOFF;
                }
                Err(ClientError::Unrecoverable(reason)) => {
                    error!("session is no longer usable: {}", reason);
                    break Err(Error::Client(ClientError::Unrecoverable(reason)));
                }
                Err(e) => {
                    error!("sync failed ({}), retrying in {}s", e, delay.as_secs());
                    tokio::select! {
                        biased;
                        _ = close_handle.requested() => {
                            info!("close requested");
                            break Ok(());
                        }
                        _ = sleep(delay) => {}
                    }
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        };

        self.close().await;
        result
    }

    /// Waits for the next round, `None` when a close was requested first.
    async fn next_round(
        &mut self,
        close_handle: &CloseHandle,
    ) -> Option<std::result::Result<SyncRound, ClientError>> {
        let request = self.request(false, self.timeout);
        let fetch = self.client.sync_once(request);
        tokio::pin!(fetch);

        loop {
            tokio::select! {
                biased;
                _ = close_handle.requested() => return None,
                Some(transaction_id) = self.confirmations.recv() => {
                    let verification = self.dispatcher.verification();
                    match verification.confirm(&self.client, &transaction_id).await {
                        Ok(()) => info!("confirmed verification {}", transaction_id),
                        Err(e) => warn!("cannot confirm verification {}: {}", transaction_id, e),
                    }
                }
                round = &mut fetch => return Some(round),
            }
        }
    }

    /// Runs one regular sync round.
    pub async fn sync_round(&mut self) -> std::result::Result<(), ClientError> {
        self.sync(false, self.timeout).await
    }

    async fn sync(
        &mut self,
        full_state: bool,
        timeout: Duration,
    ) -> std::result::Result<(), ClientError> {
        let round = self
            .client
            .sync_once(self.request(full_state, timeout))
            .await?;
        self.process(round).await;
        Ok(())
    }

    fn request(&self, full_state: bool, timeout: Duration) -> SyncRequest {
        SyncRequest {
            token: self.next_batch.clone(),
            full_state,
            timeout,
        }
    }

    async fn process(&mut self, round: SyncRound) {
        self.next_batch = Some(round.next_batch.clone());
        self.dispatcher.dispatch_round(&self.client, round).await;
        self.reconcile_keys().await;
    }

    /// Issues the key maintenance requests the client reports as pending.
    pub async fn reconcile_keys(&self) {
        if self.client.should_upload_keys() {
            debug!("uploading device keys");
            if let Err(e) = self.client.keys_upload().await {
                warn!("keys upload failed: {}", e);
            }
        }

        if self.client.should_query_keys() {
            debug!("querying device keys");
            if let Err(e) = self.client.keys_query().await {
                warn!("keys query failed: {}", e);
            }
        }

        if self.client.should_claim_keys() {
            let users = self.client.users_for_key_claiming();
            debug!("claiming one-time keys of {:?}", users);
            if let Err(e) = self.client.keys_claim(users).await {
                warn!("keys claim failed: {}", e);
            }
        }
    }

    /// Sends a text message to a room ID, a room alias or a user.
    pub async fn send_message(&self, target: &str, text: &str, html: Option<&str>) -> Result<()> {
        self.client
            .room_send(target, MessageContent::new(text, html))
            .await
            .map_err(|e| {
                error!("failed to send message to {}: {}", target, e);
                Error::Client(e)
            })
    }

    /// Sends `text` rendered as a preformatted block.
    pub async fn send_preformatted(&self, target: &str, text: &str) -> Result<()> {
        let html = format!("<pre><code>{}</code></pre>", escape_html(text));
        self.send_message(target, text, Some(&html)).await
    }

    pub async fn close(&mut self) {
        debug!("closing session");
        self.client.close().await;
    }
}

fn authentication_error(e: ClientError) -> Error {
    match e {
        ClientError::Rejected(reason) | ClientError::Unrecoverable(reason) => {
            Error::Authentication(reason)
        }
        e => Error::Client(e),
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    escaped
}
