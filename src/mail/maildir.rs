use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info};
use tokio::fs;

use crate::{
    error::Result,
    mail::message::{event_to_mail, to_maildir_bytes},
    matrix::{MessageHandler, events::MessageEvent},
    utils::get_path,
};

const CUR: &str = "cur";
const NEW: &str = "new";
const TMP: &str = "tmp";

/// Local maildir receiving room messages.
///
/// Mails are written to `tmp/` first and renamed into `new/` once complete, so
/// a reader never sees a partial file.
#[derive(Debug, Clone)]
pub struct Maildir {
    path: PathBuf,
    /// Host part of the delivered file names
    hostname: String,
}

impl Maildir {
    /// Opens the maildir at `path`, creating `cur`, `new` and `tmp` if needed.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        for sub_dir in [CUR, NEW, TMP] {
            fs::create_dir_all(get_path(&path, sub_dir)).await?;
        }
        info!("delivering mails to {}", path.display());

        Ok(Maildir {
            path,
            hostname: hostname().await,
        })
    }

    /// Stores a complete mail under `new/`, returns its path.
    pub async fn deliver(&self, content: &[u8]) -> Result<PathBuf> {
        let name = self.unique_name();
        let tmp_path = get_path(get_path(&self.path, TMP), &name);
        let new_path = get_path(get_path(&self.path, NEW), &name);

        fs::write(&tmp_path, content).await?;
        if let Err(e) = fs::rename(&tmp_path, &new_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!("delivered {}", new_path.display());
        Ok(new_path)
    }

    /// `<secs>.<nanos>_<host>`
    fn unique_name(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        format!(
            "{}.{:09}_{}",
            now.as_secs(),
            now.subsec_nanos(),
            self.hostname
        )
    }
}

impl MessageHandler for Maildir {
    fn name(&self) -> &str {
        "maildir"
    }

    async fn handle_message(&self, event: &MessageEvent) -> Result<()> {
        let mail = event_to_mail(event)?;
        let path = self.deliver(&to_maildir_bytes(mail)?).await?;
        info!(
            "mail for {} from {} stored as {}",
            event.event_id,
            event.sender,
            path.display()
        );
        Ok(())
    }
}

/// Name of this host, with the characters maildir reserves replaced.
async fn hostname() -> String {
    let hostname = match fs::read_to_string("/proc/sys/kernel/hostname").await {
        Ok(hostname) => hostname.trim().to_owned(),
        Err(_) => std::env::var("HOSTNAME").unwrap_or_default(),
    };
    if hostname.is_empty() {
        return "localhost".to_owned();
    }
    hostname.replace('/', "\\057").replace(':', "\\072")
}
