//! mxmda - Matrix mail delivery agent.
//!
//! mxmda logs a bot account into a Matrix homeserver and delivers the text
//! messages of the rooms it joined to a local maildir, where any mail reader can
//! pick them up. It also answers emoji verification requests so that the device
//! can be trusted by its peers, and offers a few room management commands.
//!
//! # Configuration
//!
//! `$XDG_CONFIG_HOME/mxmda/config.yml`:
//!
//! ```yaml
//! user: "@mxmda:example.org"
//! auth:
//!   type: "m.login.password"
//!   identifier:
//!     type: "m.id.user"
//!     user: "mxmda"
//!   password: "your-password"
//! ```
//!
//! See [`config`] for every setting and the `MXMDA_` environment overrides.
//!
//! # Usage
//!
//! ```bash
//! mxmda join '#general:example.org'
//! mxmda service --maildir ~/Mail/matrix
//! mxmda msg --target @alice:example.org "Hello"
//! mxmda rooms --list-users
//! ```
//!
//! The first run logs in and stores the new device in
//! `$XDG_CONFIG_HOME/mxmda/device.json`; later runs resume that device.
//!
//! # Logging
//!
//! Logs go to stderr at `info` by default. Each `-q` lowers the verbosity, each
//! `-v` raises it. `RUST_LOG` takes precedence when set.

use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{LevelFilter, error, info};

use crate::{
    commands::{Command, Options},
    error::Error,
    utils::config_path,
};

mod commands;
mod config;
mod error;
mod mail;
mod matrix;
mod utils;

/// Verbosity levels, from the most to the least verbose.
const LOG_LEVELS: [LevelFilter; 5] = [
    LevelFilter::Trace,
    LevelFilter::Debug,
    LevelFilter::Info,
    LevelFilter::Warn,
    LevelFilter::Error,
];
/// Index of `info` in [`LOG_LEVELS`].
const DEFAULT_LOG_LEVEL: usize = 2;

/// Command-line arguments for mxmda.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'f', long, default_value_os_t = config_path("config.yml"))]
    config: PathBuf,

    /// Path to the device file, written on first login
    ///
    /// It holds the access token of the device: keep it private.
    #[arg(short, long, default_value_os_t = config_path("device.json"))]
    device_file: PathBuf,

    /// Directory of the Matrix state store (encryption keys, room state)
    #[arg(short = 'N', long, default_value_os_t = config_path("store"))]
    store_dir: PathBuf,

    /// Log less, repeat for even less
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,

    /// Log more, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

/// Maps the `-v`/`-q` counts to a log level, clamped at both ends.
fn log_level(verbose: u8, quiet: u8) -> LevelFilter {
    let index = (DEFAULT_LOG_LEVEL + usize::from(quiet))
        .saturating_sub(usize::from(verbose))
        .min(LOG_LEVELS.len() - 1);
    LOG_LEVELS[index]
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Dependencies only log warnings unless RUST_LOG says otherwise
    let level = log_level(args.verbose, args.quiet);
    let env = Env::default().filter_or("RUST_LOG", format!("warn,mxmda={level}"));
    env_logger::init_from_env(env);

    info!("starting mxmda {}", env!("CARGO_PKG_VERSION"));

    let options = Options {
        config: args.config,
        device_file: args.device_file,
        store_dir: args.store_dir,
        log_level: log::max_level(),
    };
    let name = args.command.name();

    match commands::run(args.command, &options)
        .await
        .with_context(|| format!("{name} failed"))
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<Error>() {
                Some(user_error) if user_error.is_user_error() => error!("{}", user_error),
                _ => error!("{:?}", e),
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        assert_eq!(log_level(0, 0), LevelFilter::Info);
    }

    #[test]
    fn test_quiet_and_verbose() {
        assert_eq!(log_level(0, 1), LevelFilter::Warn);
        assert_eq!(log_level(0, 2), LevelFilter::Error);
        assert_eq!(log_level(1, 0), LevelFilter::Debug);
        assert_eq!(log_level(2, 0), LevelFilter::Trace);
        assert_eq!(log_level(1, 1), LevelFilter::Info);
    }

    #[test]
    fn test_log_level_is_clamped() {
        assert_eq!(log_level(0, 10), LevelFilter::Error);
        assert_eq!(log_level(10, 0), LevelFilter::Trace);
        assert_eq!(log_level(10, 1), LevelFilter::Trace);
    }

    #[test]
    fn test_parse_arguments() {
        let args = Args::parse_from([
            "mxmda", "-f", "/tmp/config.yml", "-qq", "msg", "-t", "#general:example.org", "--pre",
            "hello",
        ]);
        assert_eq!(args.config, PathBuf::from("/tmp/config.yml"));
        assert_eq!(args.quiet, 2);
        assert_eq!(
            args.command,
            Command::Msg {
                target: "#general:example.org".to_owned(),
                pre: true,
                text: "hello".to_owned(),
            }
        );
    }

    #[test]
    fn test_parse_rooms_filters() {
        let args = Args::parse_from([
            "mxmda", "-v", "rooms", "-r", "!a:example.org", "--room", "#b:example.org", "-u",
        ]);
        assert_eq!(args.verbose, 1);
        assert_eq!(
            args.command,
            Command::Rooms {
                rooms: vec!["!a:example.org".to_owned(), "#b:example.org".to_owned()],
                list_users: true,
            }
        );
    }

    #[test]
    fn test_long_verbosity_flags() {
        let args = Args::parse_from(["mxmda", "--verbose", "--verbose", "--quiet", "rooms"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.quiet, 1);
        assert_eq!(log_level(args.verbose, args.quiet), LevelFilter::Debug);
    }

    #[test]
    fn test_join_requires_rooms() {
        assert!(Args::try_parse_from(["mxmda", "join"]).is_err());
    }
}
