use std::path::{Path, PathBuf};

use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Error, Result};

/// Identity of an authenticated device.
///
/// This is what the device-state file holds, serialized to JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCredential {
    pub access_token: String,
    pub device_id: String,
    pub user_id: String,
}

/// Device-state file manager.
///
/// The file is absent on first run, written wholesale after every successful
/// login and read at startup to resume the session without logging in again.
///
/// # Examples
///
/// ```no_run
/// use mxmda::matrix::DeviceStore;
///
/// # async fn example() -> Result<(), mxmda::error::Error> {
/// let device_store = DeviceStore::new("~/.config/mxmda/device.json");
/// let credential = device_store.load().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeviceStore {
    /// Path to the device-state file
    path: PathBuf,
}

impl DeviceStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        DeviceStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Loads the stored credential.
    ///
    /// Returns `Ok(None)` when the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file exists but cannot be read or parsed:
    /// a broken device file needs the operator's attention, silently logging in
    /// again would leave a stale device behind.
    pub async fn load(&self) -> Result<Option<DeviceCredential>> {
        debug!("read device state at {}", self.path.display());

        if !fs::try_exists(&self.path).await.unwrap_or_default() {
            debug!("no device state found");
            return Ok(None);
        }

        let device_data = fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Config(format!(
                "cannot read device file {}: {e}",
                self.path.display()
            ))
        })?;
        let credential: DeviceCredential = serde_json::from_str(&device_data).map_err(|e| {
            Error::Config(format!(
                "invalid device file {}: {e}",
                self.path.display()
            ))
        })?;

        debug!("found device {}", credential.device_id);
        Ok(Some(credential))
    }

    /// Persists the credential, replacing any previous content.
    ///
    /// The write is awaited before returning so a crash right after login cannot
    /// lose a valid session.
    pub async fn persist(&self, credential: &DeviceCredential) -> Result<()> {
        info!("updating device file, device id {}", credential.device_id);

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let serialized = serde_json::to_string_pretty(credential)?;
        fs::write(&self.path, serialized).await?;

        trace!("device state persisted");
        Ok(())
    }
}
