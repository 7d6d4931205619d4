//! Utility functions for path handling.
//!
//! Default locations follow the XDG base directory layout: configuration and
//! device state live under `$XDG_CONFIG_HOME/mxmda`, mail under
//! `$XDG_STATE_HOME/mxmda`.

use std::{
    io,
    path::{Path, PathBuf},
};

/// Application directory name used under the XDG base directories.
const APP_DIR: &str = "mxmda";

/// Constructs a path by joining a directory with a file or subdirectory name.
///
/// # Examples
///
/// ```
/// # use mxmda::utils::get_path;
/// let path = get_path("/home/user/Mail", "new");
/// assert_eq!(path, std::path::PathBuf::from("/home/user/Mail/new"));
/// ```
pub fn get_path(dir_path: impl AsRef<Path>, name: &str) -> PathBuf {
    dir_path.as_ref().join(name)
}

/// Returns `$XDG_CONFIG_HOME/mxmda/<name>`.
///
/// Falls back to `$HOME/.config` when the platform gives no config directory,
/// and to the current directory as a last resort.
pub fn config_path(name: &str) -> PathBuf {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(APP_DIR).join(name)
}

/// Returns `$XDG_STATE_HOME/mxmda/<name>`.
///
/// `dirs` only knows a state directory on Linux, other platforms use
/// `$HOME/.local/state`.
pub fn state_path(name: &str) -> PathBuf {
    let base = dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("state")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(APP_DIR).join(name)
}

/// Creates `path` and its parents if needed and returns it.
pub fn existing_dir(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_get_path_simple() {
        let path = get_path("/home/user", "config.yml");
        #[cfg(unix)]
        assert_eq!(path, PathBuf::from("/home/user/config.yml"));
    }

    #[test]
    fn test_get_path_relative() {
        let path = get_path(".", "device.json");
        #[cfg(unix)]
        assert_eq!(path, PathBuf::from("./device.json"));
    }

    #[test]
    fn test_config_path_ends_with_app_dir() {
        let path = config_path("config.yml");
        assert!(path.ends_with("mxmda/config.yml"));
    }

    #[test]
    fn test_state_path_ends_with_app_dir() {
        let path = state_path("mail");
        assert!(path.ends_with("mxmda/mail"));
    }

    #[test]
    fn test_existing_dir_creates_parents() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");

        let created = existing_dir(&nested).unwrap();
        assert_eq!(created, nested);
        assert!(nested.is_dir());

        // Calling it again on an existing directory is fine
        assert!(existing_dir(&nested).is_ok());
    }
}
