//! Configuration file structures for mxmda.
//!
//! The configuration is a YAML file. Every value can be overridden with an
//! environment variable using the `MXMDA_` prefix, `__` separating nested keys.
//!
//! # Configuration File Format
//!
//! ```yaml
//! # Optional, discovered through .well-known when omitted
//! homeserver: "https://matrix.example.org"
//!
//! # Fully qualified Matrix user ID of the bot account
//! user: "@mxmda:example.org"
//!
//! # Login payload, forwarded verbatim to the homeserver
//! auth:
//!   type: "m.login.password"
//!   identifier:
//!     type: "m.id.user"
//!     user: "mxmda"
//!   password: "secret-password"
//!
//! # Long-poll timeout of a sync round, in seconds
//! timeout: 30
//!
//! verification:
//!   # Confirm SAS emojis without human comparison
//!   auto_confirm: true
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```bash
//! export MXMDA_USER="@mxmda:example.org"
//! export MXMDA_AUTH__PASSWORD="secret-from-env"
//! ```

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Default long-poll timeout of a sync round, in seconds.
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Explicit homeserver base URL.
    ///
    /// When `None`, the base URL is discovered from the domain of [`Config::user`].
    #[serde(default)]
    pub homeserver: Option<String>,

    /// Fully qualified Matrix user ID, e.g. `@mxmda:example.org`.
    pub user: String,

    /// Login payload.
    ///
    /// Opaque to mxmda: the `type` key selects the login type and the remaining
    /// keys are sent as-is to the homeserver.
    pub auth: Map<String, Value>,

    /// Long-poll timeout of a sync round, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Device verification settings.
    #[serde(default)]
    pub verification: Verification,
}

/// Device verification settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Verification {
    /// Confirm SAS emojis without human comparison.
    ///
    /// When disabled, the `service` command logs the emojis and waits for the
    /// transaction ID on its standard input before confirming.
    #[serde(default = "default_auto_confirm")]
    pub auto_confirm: bool,
}

impl Default for Verification {
    fn default() -> Self {
        Verification {
            auto_confirm: default_auto_confirm(),
        }
    }
}

fn default_timeout() -> u64 {
    DEFAULT_SYNC_TIMEOUT_SECS
}

fn default_auto_confirm() -> bool {
    true
}

impl Config {
    /// Loads the configuration from a YAML file merged with `MXMDA_` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file does not exist or if the merged
    /// configuration cannot be deserialized (missing `user`, invalid types...).
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }

        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("MXMDA_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const CONFIG: &str = r#"
user: "@bob:example.org"
auth:
  type: "m.login.password"
  identifier:
    type: "m.id.user"
    user: "bob"
  password: "hunter2"
"#;

    #[test]
    fn test_load_minimal_config() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yml", CONFIG)?;

            let config = Config::load("config.yml").unwrap();
            assert_eq!(config.user, "@bob:example.org");
            assert!(config.homeserver.is_none());
            assert_eq!(config.timeout, 30);
            assert!(config.verification.auto_confirm);
            assert_eq!(config.auth["type"], "m.login.password");
            assert_eq!(config.auth["password"], "hunter2");
            assert_eq!(config.auth["identifier"]["user"], "bob");
            Ok(())
        });
    }

    #[test]
    fn test_load_full_config() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yml",
                r#"
homeserver: "https://matrix.example.org"
user: "@bob:example.org"
auth:
  type: "m.login.token"
  token: "abc"
timeout: 5
verification:
  auto_confirm: false
"#,
            )?;

            let config = Config::load("config.yml").unwrap();
            assert_eq!(
                config.homeserver.as_deref(),
                Some("https://matrix.example.org")
            );
            assert_eq!(config.timeout, 5);
            assert!(!config.verification.auto_confirm);
            assert_eq!(config.auth["token"], "abc");
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yml", CONFIG)?;
            jail.set_env("MXMDA_HOMESERVER", "https://env.example.org");
            jail.set_env("MXMDA_AUTH__PASSWORD", "from-env");

            let config = Config::load("config.yml").unwrap();
            assert_eq!(config.homeserver.as_deref(), Some("https://env.example.org"));
            assert_eq!(config.auth["password"], "from-env");
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        Jail::expect_with(|_jail| {
            let err = Config::load("nope.yml").unwrap_err();
            assert!(err.is_user_error());
            assert!(err.to_string().contains("does not exist"));
            Ok(())
        });
    }

    #[test]
    fn test_missing_user() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yml", "auth:\n  password: \"x\"\n")?;

            let err = Config::load("config.yml").unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            Ok(())
        });
    }
}
