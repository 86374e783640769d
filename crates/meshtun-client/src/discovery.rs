//! Relay discovery through the registry

use async_trait::async_trait;
use meshtun_proto::{AccessRequest, AccessResponse, ApiResponse, ACCESS_PATH};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Registry request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Registry rejected request: {0}")]
    Rejected(String),

    #[error("Registry returned no server address")]
    Empty,
}

/// Source of a relay address
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Returns `ip:port` of the relay to dial
    async fn discover(&self) -> Result<String, DiscoveryError>;
}

/// Discovery via `POST /tunnel/access`
pub struct RegistryClient {
    access_url: String,
    token: String,
    is_windows: bool,
    client: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, DiscoveryError> {
        Self::with_timeout(base_url, token, Duration::from_secs(10))
    }

    pub fn with_timeout(
        base_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            access_url: format!("{}{}", base_url.trim_end_matches('/'), ACCESS_PATH),
            token: token.into(),
            is_windows: cfg!(windows),
            client,
        })
    }

    /// Override the platform hint sent to the registry
    pub fn with_windows(mut self, is_windows: bool) -> Self {
        self.is_windows = is_windows;
        self
    }

    pub fn access_url(&self) -> &str {
        &self.access_url
    }
}

#[async_trait]
impl DiscoveryClient for RegistryClient {
    async fn discover(&self) -> Result<String, DiscoveryError> {
        let request = AccessRequest {
            auth_token: self.token.clone(),
            is_windows: self.is_windows,
        };

        debug!("Requesting relay from {}", self.access_url);
        let response: ApiResponse<AccessResponse> = self
            .client
            .post(&self.access_url)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        match response.into_result() {
            Err(error) => Err(DiscoveryError::Rejected(error)),
            Ok(Some(access)) if !access.server_address.is_empty() => Ok(access.server_address),
            Ok(_) => Err(DiscoveryError::Empty),
        }
    }
}
