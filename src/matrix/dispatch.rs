//! Routing of the events of a sync round.
//!
//! Text messages go to the installed [`MessageHandler`] together with a read
//! receipt, verification steps go to [`KeyVerification`] and everything else is
//! only logged, depending on the [`LogTiers`].

use futures::join;
use log::{LevelFilter, debug, error, info, warn};

use crate::{
    error::Result,
    matrix::{
        events::{InboundEvent, MessageEvent},
        protocol::{ProtocolClient, SyncRound},
        verification::KeyVerification,
    },
};

/// Consumer of the text messages of joined rooms.
pub trait MessageHandler {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn handle_message(&self, event: &MessageEvent) -> Result<()>;
}

/// Which kinds of incidental events get logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogTiers {
    /// Generic timeline and to-device events
    pub info: bool,
    /// Sync summaries, ephemeral and account data events
    pub debug: bool,
}

impl LogTiers {
    pub fn from_level(level: LevelFilter) -> Self {
        LogTiers {
            info: level >= LevelFilter::Info,
            debug: level >= LevelFilter::Debug,
        }
    }
}

pub struct Dispatcher<H> {
    handler: Option<H>,
    verification: KeyVerification,
    tiers: LogTiers,
}

impl<H: MessageHandler> Dispatcher<H> {
    /// Creates a dispatcher, messages are ignored when `handler` is `None`.
    pub fn new(handler: Option<H>, verification: KeyVerification, tiers: LogTiers) -> Self {
        Dispatcher {
            handler,
            verification,
            tiers,
        }
    }

    pub fn verification(&self) -> &KeyVerification {
        &self.verification
    }

    /// Dispatches the events of a round, in order.
    pub async fn dispatch_round<C: ProtocolClient>(&self, client: &C, round: SyncRound) {
        self.verification.prune().await;

        if self.tiers.debug {
            if let Some(summary) = &round.summary {
                debug!("sync response: {}", summary);
            }
            debug!(
                "sync round {} with {} events",
                round.next_batch,
                round.events.len()
            );
        }

        for event in round.events {
            self.dispatch(client, event).await;
        }
    }

    pub async fn dispatch<C: ProtocolClient>(&self, client: &C, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => self.on_message(client, message).await,
            InboundEvent::Verification(verification_event) => {
                if self.tiers.info {
                    info!(
                        "{} from {} ({})",
                        verification_event.type_name(),
                        verification_event.sender(),
                        verification_event.transaction_id()
                    );
                }
                self.verification.handle(client, verification_event).await
            }
            InboundEvent::Timeline { room, event_type } => {
                if self.tiers.info {
                    info!("{}: {}", room, event_type);
                }
            }
            InboundEvent::ToDevice { sender, event_type } => {
                if self.tiers.info {
                    info!("to-device {} from {}", event_type, sender);
                }
            }
            InboundEvent::Ephemeral { room, event_type } => {
                if self.tiers.debug {
                    debug!("{}: ephemeral {}", room, event_type);
                }
            }
            InboundEvent::AccountData { room, event_type } => {
                if self.tiers.debug {
                    match room {
                        Some(room) => debug!("{}: account data {}", room, event_type),
                        None => debug!("account data {}", event_type),
                    }
                }
            }
        }
    }

    async fn on_message<C: ProtocolClient>(&self, client: &C, message: MessageEvent) {
        let Some(handler) = &self.handler else {
            return;
        };

        let (receipt, handled) = join!(
            client.update_receipt_marker(&message.room.room_id, &message.event_id),
            handler.handle_message(&message)
        );

        if let Err(e) = receipt {
            warn!(
                "failed to send read receipt for {} in {}: {}",
                message.event_id, message.room, e
            );
        }
        if let Err(e) = handled {
            error!(
                "{} failed to process {} from {}: {}",
                handler.name(),
                message.event_id,
                message.sender,
                e
            );
        }
    }
}
