//! HTTP endpoint checks against a ready instance.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Timeout for a single endpoint check request.
pub const CHECK_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("{url} should be accessible: {detail}")]
    Request { url: String, detail: String },

    #[error("{url} returned status {status}, expected 200")]
    Status { url: String, status: u16 },

    #[error("decoding response body from {url}: {detail}")]
    Decode { url: String, detail: String },

    #[error("version field '{0}' is empty")]
    MissingBuildInfo(&'static str),
}

/// Body of `<apiUrl>/version`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionInfo {
    pub commit: String,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct EndpointChecker {
    client: reqwest::Client,
}

impl EndpointChecker {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(CHECK_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, EndpointError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| EndpointError::Request {
                url: url.to_string(),
                detail: err.to_string(),
            })?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(EndpointError::Status {
                url: url.to_string(),
                status,
            });
        }
        let body = response.bytes().await.map_err(|err| EndpointError::Request {
            url: url.to_string(),
            detail: err.to_string(),
        })?;
        serde_json::from_slice(&body).map_err(|err| EndpointError::Decode {
            url: url.to_string(),
            detail: err.to_string(),
        })
    }

    /// The version endpoint answers 200 with `{commit, timestamp}`, both
    /// non-empty when `require_build_info` is set.
    pub async fn check_version(
        &self,
        url: &str,
        require_build_info: bool,
    ) -> Result<VersionInfo, EndpointError> {
        let info: VersionInfo = self.get_json(url).await?;
        if require_build_info {
            if info.commit.is_empty() {
                return Err(EndpointError::MissingBuildInfo("commit"));
            }
            if info.timestamp.is_empty() {
                return Err(EndpointError::MissingBuildInfo("timestamp"));
            }
        }
        Ok(info)
    }

    /// The API specification endpoint answers 200 with any JSON document.
    pub async fn check_api_spec(&self, url: &str) -> Result<serde_json::Value, EndpointError> {
        self.get_json(url).await
    }
}
