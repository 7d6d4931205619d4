use crate::{
    error::Result,
    matrix::{MessageHandler, ProtocolClient, SessionManager},
};

/// Sends `text` to `target`, as a preformatted block when `pre` is set.
pub async fn msg<C: ProtocolClient, H: MessageHandler>(
    session: &SessionManager<C, H>,
    target: &str,
    text: &str,
    pre: bool,
) -> Result<()> {
    if pre {
        session.send_preformatted(target, text).await
    } else {
        session.send_message(target, text, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, Verification},
        mail::Maildir,
        matrix::{
            ConfirmPolicy, DeviceStore, Dispatcher, KeyVerification, LogTiers,
            protocol::MockProtocolClient,
        },
    };
    use serde_json::Map;

    fn create_session(client: MockProtocolClient) -> SessionManager<MockProtocolClient, Maildir> {
        let config = Config {
            homeserver: Some("https://matrix.example.org".to_owned()),
            user: "@bob:example.org".to_owned(),
            auth: Map::new(),
            timeout: 30,
            verification: Verification::default(),
        };
        SessionManager::new(
            client,
            Dispatcher::new(
                None,
                KeyVerification::new(ConfirmPolicy::AutoConfirm),
                LogTiers::default(),
            ),
            &config,
            "https://matrix.example.org",
            DeviceStore::new("device.json"),
            None,
        )
    }

    #[tokio::test]
    async fn test_plain_message() {
        let mut client = MockProtocolClient::new();
        client
            .expect_room_send()
            .withf(|target, content| {
                target == "@alice:example.org"
                    && content.body == "hello"
                    && content.formatted_body.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        msg(&create_session(client), "@alice:example.org", "hello", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_preformatted_message() {
        let mut client = MockProtocolClient::new();
        client
            .expect_room_send()
            .withf(|_, content| {
                content.body == "ls -l"
                    && content.formatted_body.as_deref() == Some("<pre><code>ls -l</code></pre>")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        msg(&create_session(client), "!room:example.org", "ls -l", true)
            .await
            .unwrap();
    }
}
