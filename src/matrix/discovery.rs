//! Homeserver discovery through `/.well-known/matrix/client`.
//!
//! See <https://spec.matrix.org/v1.6/client-server-api/#well-known-uri>.

use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;

use crate::{
    config::Config,
    error::{Error, Result},
};

#[derive(Debug, Deserialize)]
struct WellKnown {
    #[serde(rename = "m.homeserver")]
    homeserver: HomeserverInfo,
}

#[derive(Debug, Deserialize)]
struct HomeserverInfo {
    base_url: String,
}

/// Returns the homeserver base URL to use for `config`.
///
/// The explicit `homeserver` of the configuration wins; otherwise the base URL is
/// discovered from the domain of the configured user.
///
/// # Errors
///
/// Returns [`Error::InvalidIdentifier`] if the user has no domain part and
/// [`Error::Discovery`] if the lookup fails.
pub async fn resolve_server(config: &Config) -> Result<String> {
    if let Some(homeserver) = &config.homeserver {
        debug!("using configured homeserver {}", homeserver);
        return Ok(homeserver.clone());
    }

    let domain = server_domain(&config.user)?;
    info!("discovering homeserver of {}", domain);
    let base_url = discover(&Client::new(), &format!("https://{domain}"), domain).await?;
    info!("discovered homeserver {}", base_url);
    Ok(base_url)
}

/// Everything after the first `:` of a user ID, port included.
pub fn server_domain(user_id: &str) -> Result<&str> {
    user_id
        .strip_prefix('@')
        .and_then(|rest| rest.split_once(':'))
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
        .ok_or_else(|| Error::InvalidIdentifier(user_id.to_owned()))
}

/// Fetches `<origin>/.well-known/matrix/client` and extracts `m.homeserver.base_url`.
pub(crate) async fn discover(http: &Client, origin: &str, domain: &str) -> Result<String> {
    let url = format!("{origin}/.well-known/matrix/client");
    debug!("request {}", url);

    let discovery_error = |reason: String| Error::Discovery {
        domain: domain.to_owned(),
        reason,
    };

    let response = http
        .get(&url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| discovery_error(e.to_string()))?;

    let well_known: WellKnown = response
        .json()
        .await
        .map_err(|e| discovery_error(e.to_string()))?;

    debug!("response from {} -> {:?}", url, well_known);

    let base_url = well_known.homeserver.base_url.trim_end_matches('/');
    if base_url.is_empty() {
        return Err(discovery_error("empty m.homeserver.base_url".to_owned()));
    }
    Ok(base_url.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn create_config(homeserver: Option<&str>) -> Config {
        Config {
            homeserver: homeserver.map(str::to_owned),
            user: "@bob:example.org".to_owned(),
            auth: Map::new(),
            timeout: 30,
            verification: Default::default(),
        }
    }

    #[test]
    fn test_server_domain() {
        assert_eq!(server_domain("@bob:example.org").unwrap(), "example.org");
        assert_eq!(
            server_domain("@bob:example.org:8448").unwrap(),
            "example.org:8448"
        );
        assert!(server_domain("bob:example.org").is_err());
        assert!(server_domain("@bob").is_err());
        assert!(server_domain("@bob:").is_err());
    }

    #[tokio::test]
    async fn test_explicit_homeserver_skips_discovery() {
        let config = create_config(Some("https://hs.example.org"));
        assert_eq!(
            resolve_server(&config).await.unwrap(),
            "https://hs.example.org"
        );
    }

    #[tokio::test]
    async fn test_discover() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/.well-known/matrix/client")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"m.homeserver": {"base_url": "https://matrix.example.org/"}}"#)
            .create_async()
            .await;

        let base_url = discover(&Client::new(), &server.url(), "example.org")
            .await
            .unwrap();
        assert_eq!(base_url, "https://matrix.example.org");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_discover_missing_field() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/.well-known/matrix/client")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"m.identity_server": {"base_url": "https://id.example.org"}}"#)
            .create_async()
            .await;

        let err = discover(&Client::new(), &server.url(), "example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { ref domain, .. } if domain == "example.org"));
    }

    #[tokio::test]
    async fn test_discover_malformed_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/.well-known/matrix/client")
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let err = discover(&Client::new(), &server.url(), "example.org")
            .await
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_discover_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/.well-known/matrix/client")
            .with_status(404)
            .create_async()
            .await;

        let err = discover(&Client::new(), &server.url(), "example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }

    #[tokio::test]
    async fn test_discover_unreachable_host() {
        // Nothing listens on port 9 of the loopback interface
        let err = discover(&Client::new(), "http://127.0.0.1:9", "example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }
}
