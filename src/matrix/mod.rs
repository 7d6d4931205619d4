//! Matrix protocol integration.
//!
//! # Architecture
//!
//! - **Protocol**: the [`ProtocolClient`] capability trait and its matrix-sdk
//!   implementation, [`MatrixClient`]
//! - **Session**: device persistence ([`DeviceStore`]) and homeserver discovery
//! - **Sync**: the [`SessionManager`] loop handing every round to the [`Dispatcher`]
//! - **Verification**: the SAS state machine fed by the dispatcher
//!
//! # Examples
//!
//! ```no_run
//! use mxmda::{config::Config, mail::Maildir, matrix::*};
//!
//! # async fn example(config: Config) -> mxmda::error::Result<()> {
//! let homeserver = discovery::resolve_server(&config).await?;
//! let tiers = LogTiers::from_level(log::max_level());
//! let client = MatrixClient::new(&homeserver, "store".as_ref(), tiers).await?;
//! let device_store = DeviceStore::new("device.json");
//! let credential = device_store.load().await?;
//!
//! let dispatcher = Dispatcher::new(
//!     Some(Maildir::create("mail").await?),
//!     KeyVerification::new(ConfirmPolicy::AutoConfirm),
//!     tiers,
//! );
//! let mut session =
//!     SessionManager::new(client, dispatcher, &config, &homeserver, device_store, credential);
//! session.start().await?;
//! session.enter_loop().await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod discovery;
mod dispatch;
pub mod events;
pub mod protocol;
mod session;
mod sync;
pub mod verification;

pub use crate::matrix::{
    client::MatrixClient,
    dispatch::{Dispatcher, LogTiers, MessageHandler},
    protocol::{ClientError, ProtocolClient},
    session::DeviceStore,
    sync::SessionManager,
    verification::{ConfirmPolicy, KeyVerification},
};
