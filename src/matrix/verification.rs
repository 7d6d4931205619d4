//! Interactive SAS device verification.
//!
//! Other devices of the bot account (or other users) can verify this device with
//! the emoji flavour of short-authentication-string verification. The SAS
//! objects themselves live in the protocol client; [`KeyVerification`] tracks
//! where every transaction stands and decides what to transmit next:
//!
//! ```text
//! Started ──key──▶ KeyExchanged ──confirm──▶ MacSent ──mac──▶ Verified
//!    │                  │                       │
//!    └──────────────────┴───────cancel──────────┴──▶ Cancelled
//! ```
//!
//! With [`ConfirmPolicy::AutoConfirm`] the emojis are accepted without being
//! compared by a human. This trusts whoever answers the verification request and
//! is only suitable when the operator controls both devices. With
//! [`ConfirmPolicy::External`] the operator compares them and confirms the
//! transaction through [`KeyVerification::confirm`]; the `service` command reads
//! the transaction IDs to confirm on its standard input.
//!
//! Finished transactions are kept for [`TERMINAL_RETENTION`] so that late steps
//! stay silent, then pruned.

use std::collections::HashMap;

use log::{debug, error, info, warn};
use tokio::{
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::matrix::{
    events::VerificationEvent,
    protocol::{ClientError, ProtocolClient},
};

/// Only SAS method mxmda supports.
const EMOJI_METHOD: &str = "emoji";
/// How long verified and cancelled transactions stay tracked.
pub const TERMINAL_RETENTION: Duration = Duration::from_secs(600);

/// What to do once both sides exchanged their keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmPolicy {
    /// Confirm the emojis right away.
    AutoConfirm,
    /// Wait for an operator to call [`KeyVerification::confirm`].
    External,
}

impl ConfirmPolicy {
    pub fn from_auto_confirm(auto_confirm: bool) -> Self {
        if auto_confirm {
            ConfirmPolicy::AutoConfirm
        } else {
            ConfirmPolicy::External
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Started,
    KeyExchanged,
    MacSent,
    Verified,
    Cancelled,
}

impl VerificationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, VerificationState::Verified | VerificationState::Cancelled)
    }
}

/// A verification this device takes part in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationTransaction {
    pub transaction_id: String,
    pub state: VerificationState,
    /// Emoji rendering, known once keys are exchanged
    pub short_authentication_string: Option<String>,
    pub partner_user: String,
    pub partner_device: Option<String>,
    /// The peer's MAC arrived before our confirmation
    pub mac_received: bool,
    /// When the transaction reached a terminal state
    pub finished_at: Option<Instant>,
}

impl VerificationTransaction {
    fn new(transaction_id: &str, partner_user: &str, state: VerificationState) -> Self {
        let mut transaction = VerificationTransaction {
            transaction_id: transaction_id.to_owned(),
            state: VerificationState::Started,
            short_authentication_string: None,
            partner_user: partner_user.to_owned(),
            partner_device: None,
            mac_received: false,
            finished_at: None,
        };
        transaction.enter(state);
        transaction
    }

    fn enter(&mut self, state: VerificationState) {
        self.state = state;
        if state.is_terminal() {
            self.finished_at.get_or_insert_with(Instant::now);
        }
    }
}

/// SAS verification state machine.
pub struct KeyVerification {
    policy: ConfirmPolicy,
    /// Tracked transactions, by transaction ID
    transactions: Mutex<HashMap<String, VerificationTransaction>>,
}

impl KeyVerification {
    pub fn new(policy: ConfirmPolicy) -> Self {
        KeyVerification {
            policy,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of a transaction, `None` when unknown or abandoned.
    pub async fn state(&self, transaction_id: &str) -> Option<VerificationState> {
        self.transactions
            .lock()
            .await
            .get(transaction_id)
            .map(|transaction| transaction.state)
    }

    /// Snapshot of a tracked transaction.
    pub async fn transaction(&self, transaction_id: &str) -> Option<VerificationTransaction> {
        self.transactions.lock().await.get(transaction_id).cloned()
    }

    /// Forgets the transactions that finished more than [`TERMINAL_RETENTION`] ago.
    pub async fn prune(&self) {
        let mut transactions = self.transactions.lock().await;
        transactions.retain(|transaction_id, transaction| {
            let expired = transaction
                .finished_at
                .is_some_and(|finished_at| finished_at.elapsed() >= TERMINAL_RETENTION);
            if expired {
                debug!(
                    "forgetting verification {} ({:?})",
                    transaction_id, transaction.state
                );
            }
            !expired
        });
    }

    /// Advances the transaction the event belongs to.
    pub async fn handle<C: ProtocolClient>(&self, client: &C, event: VerificationEvent) {
        match event {
            VerificationEvent::Start {
                sender,
                from_device,
                transaction_id,
                short_authentication_string,
            } => {
                self.on_start(
                    client,
                    &sender,
                    &from_device,
                    &transaction_id,
                    &short_authentication_string,
                )
                .await
            }
            VerificationEvent::Cancel {
                sender,
                transaction_id,
                code,
                reason,
            } => self.on_cancel(&sender, &transaction_id, &code, &reason).await,
            VerificationEvent::Key {
                sender,
                transaction_id,
            } => self.on_key(client, &sender, &transaction_id).await,
            VerificationEvent::Mac {
                sender,
                transaction_id,
            } => self.on_mac(client, &sender, &transaction_id).await,
        }
    }

    /// Confirms the emojis of a transaction waiting in `KeyExchanged`.
    ///
    /// This is the confirmation step of [`ConfirmPolicy::External`]; with
    /// [`ConfirmPolicy::AutoConfirm`] it runs on its own. When the peer's MAC
    /// already arrived, the verification completes right away.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::LocalProtocol`] if the transaction is unknown or not
    /// waiting for a confirmation, and the transport error if sending fails (the
    /// transaction is then abandoned).
    pub async fn confirm<C: ProtocolClient>(
        &self,
        client: &C,
        transaction_id: &str,
    ) -> Result<(), ClientError> {
        let (sender, mac_received) = match self.transaction(transaction_id).await {
            Some(transaction) if transaction.state == VerificationState::KeyExchanged => {
                (transaction.partner_user, transaction.mac_received)
            }
            Some(transaction) => {
                return Err(ClientError::LocalProtocol(format!(
                    "verification {transaction_id} is {:?}, not waiting for a confirmation",
                    transaction.state
                )));
            }
            None => {
                return Err(ClientError::LocalProtocol(format!(
                    "unknown verification {transaction_id}"
                )));
            }
        };

        if let Err(e) = client
            .confirm_short_auth_string(&sender, transaction_id)
            .await
        {
            error!(
                "unable to send the key confirmation for {}: {}",
                transaction_id, e
            );
            self.abandon(transaction_id).await;
            return Err(e);
        }

        // A cancel may have been processed while the confirmation was in flight
        let confirmed = self
            .advance(
                transaction_id,
                VerificationState::KeyExchanged,
                VerificationState::MacSent,
            )
            .await;
        if confirmed && mac_received {
            self.complete(client, &sender, transaction_id).await;
        }
        Ok(())
    }

    async fn on_start<C: ProtocolClient>(
        &self,
        client: &C,
        sender: &str,
        from_device: &str,
        transaction_id: &str,
        methods: &[String],
    ) {
        if !methods.iter().any(|method| method == EMOJI_METHOD) {
            warn!(
                "got verification request {} without support for emojis: {:?}",
                transaction_id, methods
            );
            return;
        }

        {
            let mut transactions = self.transactions.lock().await;
            if let Some(existing) = transactions.get(transaction_id) {
                warn!(
                    "ignoring start of already known verification {} ({:?})",
                    transaction_id, existing.state
                );
                return;
            }
            let mut transaction =
                VerificationTransaction::new(transaction_id, sender, VerificationState::Started);
            transaction.partner_device = Some(from_device.to_owned());
            transactions.insert(transaction_id.to_owned(), transaction);
        }

        info!(
            "verification {} started by {} ({})",
            transaction_id, sender, from_device
        );

        if let Err(e) = client.accept_key_verification(sender, transaction_id).await {
            error!("accept_key_verification failed with {}", e);
        }

        if !self.is_in(transaction_id, VerificationState::Started).await {
            return;
        }
        if let Err(e) = client.share_key(sender, transaction_id).await {
            error!("key sharing failed with {}", e);
        }
    }

    async fn on_cancel(&self, sender: &str, transaction_id: &str, code: &str, reason: &str) {
        info!(
            "verification {} cancelled by {}: {} ({})",
            transaction_id, sender, reason, code
        );

        let mut transactions = self.transactions.lock().await;
        match transactions.get_mut(transaction_id) {
            Some(transaction) => transaction.enter(VerificationState::Cancelled),
            None => {
                // Remember it so that late steps of the same transaction are ignored
                transactions.insert(
                    transaction_id.to_owned(),
                    VerificationTransaction::new(
                        transaction_id,
                        sender,
                        VerificationState::Cancelled,
                    ),
                );
            }
        }
    }

    async fn on_key<C: ProtocolClient>(&self, client: &C, sender: &str, transaction_id: &str) {
        if !self
            .advance(
                transaction_id,
                VerificationState::Started,
                VerificationState::KeyExchanged,
            )
            .await
        {
            return;
        }

        let emoji = client
            .sas_emoji(sender, transaction_id)
            .await
            .unwrap_or_default();
        if let Some(transaction) = self.transactions.lock().await.get_mut(transaction_id) {
            transaction.short_authentication_string = Some(emoji.clone());
        }

        match self.policy {
            ConfirmPolicy::AutoConfirm => {
                warn!(
                    "got verification emojis for {}: {}; assuming they match",
                    transaction_id, emoji
                );
                // Errors are logged by confirm
                let _ = self.confirm(client, transaction_id).await;
            }
            ConfirmPolicy::External => {
                warn!(
                    "got verification emojis for {}: {}; enter {} on the service input if they match",
                    transaction_id, emoji, transaction_id
                );
            }
        }
    }

    async fn on_mac<C: ProtocolClient>(&self, client: &C, sender: &str, transaction_id: &str) {
        {
            let mut transactions = self.transactions.lock().await;
            match transactions.get_mut(transaction_id) {
                Some(transaction) if transaction.state == VerificationState::MacSent => {}
                Some(transaction) if transaction.state == VerificationState::KeyExchanged => {
                    info!(
                        "mac of verification {} arrived before the confirmation",
                        transaction_id
                    );
                    transaction.mac_received = true;
                    return;
                }
                state => {
                    warn!(
                        "ignoring mac of verification {} ({:?})",
                        transaction_id,
                        state.map(|transaction| transaction.state)
                    );
                    return;
                }
            }
        }

        self.complete(client, sender, transaction_id).await;
    }

    /// Sends our MAC of a transaction in `MacSent`.
    async fn complete<C: ProtocolClient>(&self, client: &C, sender: &str, transaction_id: &str) {
        match client.send_mac(sender, transaction_id).await {
            Ok(verified_devices) => {
                self.advance(
                    transaction_id,
                    VerificationState::MacSent,
                    VerificationState::Verified,
                )
                .await;
                info!(
                    "enrolled new device; verified devices now: {:?}",
                    verified_devices
                );
            }
            Err(ClientError::LocalProtocol(reason)) => {
                // e.g. it was cancelled by ourselves
                info!("key exchange {} cancelled: {}", transaction_id, reason);
                self.set_state(transaction_id, VerificationState::Cancelled)
                    .await;
            }
            Err(e) => {
                error!(
                    "failed to send final mac confirmation for {}: {}",
                    transaction_id, e
                );
                self.abandon(transaction_id).await;
            }
        }
    }

    async fn is_in(&self, transaction_id: &str, state: VerificationState) -> bool {
        self.state(transaction_id).await == Some(state)
    }

    /// Moves a transaction from `from` to `to`, returns whether it was in `from`.
    async fn advance(
        &self,
        transaction_id: &str,
        from: VerificationState,
        to: VerificationState,
    ) -> bool {
        let mut transactions = self.transactions.lock().await;
        match transactions.get_mut(transaction_id) {
            Some(transaction) if transaction.state == from => {
                debug!("verification {}: {:?} -> {:?}", transaction_id, from, to);
                transaction.enter(to);
                true
            }
            Some(transaction) => {
                debug!(
                    "verification {} is {:?}, expected {:?}",
                    transaction_id, transaction.state, from
                );
                false
            }
            None => {
                debug!("unknown verification {}", transaction_id);
                false
            }
        }
    }

    async fn set_state(&self, transaction_id: &str, state: VerificationState) {
        if let Some(transaction) = self.transactions.lock().await.get_mut(transaction_id) {
            transaction.enter(state);
        }
    }

    async fn abandon(&self, transaction_id: &str) {
        debug!("abandoning verification {}", transaction_id);
        self.transactions.lock().await.remove(transaction_id);
    }
}
