//! Command-line commands.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `service` | Deliver room messages to a maildir until interrupted |
//! | `join` | Join rooms by ID or alias |
//! | `leave` | Leave and forget rooms |
//! | `rooms` | List joined rooms |
//! | `msg` | Send a message to a room or a user |
//!
//! Every command loads the configuration, resolves the homeserver and starts a
//! session. `service` then keeps syncing; the other commands run their action,
//! one more sync round so the homeserver state settles, and close the session.

use std::path::PathBuf;

use clap::Subcommand;
use log::{LevelFilter, debug, warn};

use crate::{
    config::Config,
    error::Result,
    mail::Maildir,
    matrix::{
        ConfirmPolicy, DeviceStore, Dispatcher, KeyVerification, LogTiers, MatrixClient,
        MessageHandler, SessionManager, discovery::resolve_server,
    },
    utils::{existing_dir, state_path},
};

mod actions;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Deliver the messages of joined rooms to a maildir
    Service {
        /// Maildir receiving the messages
        #[arg(short, long, default_value_os_t = state_path("mail"))]
        maildir: PathBuf,
    },

    /// Join rooms
    Join {
        /// Room IDs or aliases
        #[arg(required = true)]
        rooms: Vec<String>,
    },

    /// Leave and forget rooms
    Leave {
        /// Room IDs or aliases
        #[arg(required = true)]
        rooms: Vec<String>,
    },

    /// List joined rooms
    Rooms {
        /// Only list this room (ID or canonical alias)
        #[arg(short = 'r', long = "room")]
        rooms: Vec<String>,

        /// Also list the members of each room
        #[arg(short = 'u', long)]
        list_users: bool,
    },

    /// Send a text message
    Msg {
        /// Room ID, room alias or user ID
        #[arg(short, long)]
        target: String,

        /// Send the text as a preformatted block
        #[arg(long)]
        pre: bool,

        text: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Service { .. } => "service",
            Command::Join { .. } => "join",
            Command::Leave { .. } => "leave",
            Command::Rooms { .. } => "rooms",
            Command::Msg { .. } => "msg",
        }
    }
}

/// Files and settings shared by every command.
#[derive(Debug, Clone)]
pub struct Options {
    pub config: PathBuf,
    pub device_file: PathBuf,
    pub store_dir: PathBuf,
    pub log_level: LevelFilter,
}

/// Runs `command` against the configured account.
pub async fn run(command: Command, options: &Options) -> Result<()> {
    let config = Config::load(&options.config)?;
    let homeserver = resolve_server(&config).await?;
    let tiers = LogTiers::from_level(options.log_level);

    let device_store = DeviceStore::new(&options.device_file);
    let credential = device_store.load().await?;

    let store_dir = existing_dir(&options.store_dir)?;
    let client = MatrixClient::new(&homeserver, &store_dir, tiers).await?;
    let verification = KeyVerification::new(ConfirmPolicy::from_auto_confirm(
        config.verification.auto_confirm,
    ));

    if let Command::Service { maildir } = &command {
        let handler = Maildir::create(maildir).await?;
        let dispatcher = Dispatcher::new(Some(handler), verification, tiers);
        let mut session = SessionManager::new(
            client,
            dispatcher,
            &config,
            &homeserver,
            device_store,
            credential,
        );
        session.start().await?;
        return actions::service(&mut session, !config.verification.auto_confirm).await;
    }

    // Messages are only delivered in service mode
    let dispatcher = Dispatcher::<Maildir>::new(None, verification, tiers);
    let mut session = SessionManager::new(
        client,
        dispatcher,
        &config,
        &homeserver,
        device_store,
        credential,
    );
    session.start().await?;
    let result = run_action(&command, &session).await;
    finish(&mut session).await;
    result
}

async fn run_action<H: MessageHandler>(
    command: &Command,
    session: &SessionManager<MatrixClient, H>,
) -> Result<()> {
    debug!("running {}", command.name());
    match command {
        Command::Join { rooms } => actions::join(session.client(), rooms).await,
        Command::Leave { rooms } => actions::leave(session.client(), rooms).await,
        Command::Rooms { rooms, list_users } => {
            for line in actions::rooms(session.client(), rooms, *list_users).await? {
                println!("{line}");
            }
            Ok(())
        }
        Command::Msg { target, pre, text } => actions::msg(session, target, text, *pre).await,
        // Handled by `run`
        Command::Service { .. } => Ok(()),
    }
}

/// Runs the closing sync round of a one-shot command, then closes the session.
async fn finish<H: MessageHandler>(session: &mut SessionManager<MatrixClient, H>) {
    if let Err(e) = session.sync_round().await {
        warn!("final sync failed: {}", e);
    }
    session.close().await;
}
