// Device API client - talks to a single remote device
//
// This module is responsible for:
// 1. Logging in with the stored credentials and returning the access token
// 2. Fetching the histogram and cyclic-backup documents with that token
// 3. Classifying every failure into the collection error taxonomy

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DeviceRecord;

const HISTOGRAM_PATH: &str = "/retain/cyclic-backup/histogram";
const CYCLIC_BACKUP_PATH: &str = "/retain/cyclic-backup";

/// Errors that can occur during a collection cycle
///
/// None of these terminate the process. Whether the device session survives
/// the error is decided by [`CollectError::invalidates_session`].
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed document: {0}")]
    Parse(String),

    #[error("internal fault: {0}")]
    Internal(String),
}

impl CollectError {
    /// Returns true if the session must be dropped after this error
    ///
    /// Parse errors describe the shape of one document, not the connection.
    pub fn invalidates_session(&self) -> bool {
        !matches!(self, CollectError::Parse(_))
    }
}

impl From<reqwest::Error> for CollectError {
    fn from(err: reqwest::Error) -> Self {
        CollectError::Transport(err.to_string())
    }
}

/// Operations a collector needs from a device
///
/// Implemented over HTTP by [`HttpDeviceClient`]; tests substitute a
/// scripted implementation.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Logs in and returns a bearer token
    async fn login(&self) -> Result<String, CollectError>;

    /// Fetches the raw histogram document body
    async fn fetch_histogram(&self, token: &str) -> Result<String, CollectError>;

    /// Fetches the raw cyclic-backup (scalar metrics) document body
    async fn fetch_cyclic_backup(&self, token: &str) -> Result<String, CollectError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
}

/// HTTP client for one device
///
/// Certificate validation is disabled: devices serve self-signed
/// certificates on private networks.
pub struct HttpDeviceClient {
    device: DeviceRecord,
    client: reqwest::Client,
}

impl HttpDeviceClient {
    /// Creates a client with a bounded per-request timeout
    ///
    /// # Arguments
    /// * `device` - Connection record for the device
    /// * `timeout` - Upper bound on each login or fetch request
    pub fn new(device: DeviceRecord, timeout: Duration) -> Result<Self, CollectError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| CollectError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(HttpDeviceClient { device, client })
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}{}", self.device.api_url.trim_end_matches('/'), path)
    }

    async fn get(&self, path: &str, token: &str) -> Result<String, CollectError> {
        let url = self.data_url(path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(header::COOKIE, format!("authToken={token}"))
            .send()
            .await?;

        // Rejected tokens are auth failures; any other bad status is transport
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CollectError::Auth(format!("{url} returned status {status}")));
        }
        if !status.is_success() {
            return Err(CollectError::Transport(format!("{url} returned status {status}")));
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceClient {
    async fn login(&self) -> Result<String, CollectError> {
        let body = LoginRequest {
            username: &self.device.username,
            password: &self.device.password,
        };

        let response = self
            .client
            .post(&self.device.login_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CollectError::Auth(format!("login request failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(CollectError::Auth(format!("login returned status {status}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| CollectError::Auth(format!("failed to read login response: {e}")))?;

        let token = parse_login_response(&text)?;
        info!("Authentication successful: {}", self.device.login_url);
        Ok(token)
    }

    async fn fetch_histogram(&self, token: &str) -> Result<String, CollectError> {
        self.get(HISTOGRAM_PATH, token).await
    }

    async fn fetch_cyclic_backup(&self, token: &str) -> Result<String, CollectError> {
        self.get(CYCLIC_BACKUP_PATH, token).await
    }
}

/// Extracts the access token from a login response body
fn parse_login_response(body: &str) -> Result<String, CollectError> {
    let parsed: LoginResponse = serde_json::from_str(body)
        .map_err(|e| CollectError::Auth(format!("failed to parse login response: {e}")))?;

    parsed
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| CollectError::Auth("no access token in response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(api_url: &str) -> DeviceRecord {
        DeviceRecord {
            name: "plc".to_string(),
            login_url: "https://plc/login".to_string(),
            api_url: api_url.to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        }
    }

    #[test]
    fn test_session_policy() {
        assert!(CollectError::Auth("x".into()).invalidates_session());
        assert!(CollectError::Transport("x".into()).invalidates_session());
        assert!(CollectError::Internal("x".into()).invalidates_session());
        assert!(!CollectError::Parse("x".into()).invalidates_session());
    }

    #[test]
    fn test_parse_login_response() {
        assert_eq!(parse_login_response(r#"{"accessToken":"abc"}"#).unwrap(), "abc");
        assert!(matches!(parse_login_response(r#"{"token":"abc"}"#), Err(CollectError::Auth(_))));
        assert!(matches!(parse_login_response(r#"{"accessToken":""}"#), Err(CollectError::Auth(_))));
        assert!(matches!(parse_login_response(r#"{"accessToken":7}"#), Err(CollectError::Auth(_))));
        assert!(matches!(parse_login_response("<html>"), Err(CollectError::Auth(_))));
    }

    #[test]
    fn test_data_urls() {
        let client = HttpDeviceClient::new(device("https://plc/api/"), Duration::from_secs(1)).unwrap();
        assert_eq!(client.data_url(HISTOGRAM_PATH), "https://plc/api/retain/cyclic-backup/histogram");

        let client = HttpDeviceClient::new(device("https://plc/api"), Duration::from_secs(1)).unwrap();
        assert_eq!(client.data_url(CYCLIC_BACKUP_PATH), "https://plc/api/retain/cyclic-backup");
    }

    #[test]
    fn test_login_body_shape() {
        let body = serde_json::to_value(LoginRequest {
            username: "u",
            password: "p",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"username": "u", "password": "p"}));
    }
}
