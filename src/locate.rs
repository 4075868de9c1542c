//! M-Lab Locate API client.
//!
//! The Locate API returns the nearest M-Lab servers, closest first, with
//! signed WebSocket URLs for running ndt7 tests.

use serde::Deserialize;

use crate::error::{Result, SpeedTestError};
use crate::spec::TestKind;

/// Base URL for the M-Lab Locate v2 API.
pub const LOCATE_URL: &str = "https://locate.measurementlab.net/v2/nearest/ndt/ndt7";

/// Which URL family to use when connecting to a test server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// TLS WebSocket (`wss://`).
    #[default]
    Secure,
    /// Plain-text WebSocket (`ws://`).
    Insecure,
}

/// Rough physical placement of a test server.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Location {
    /// Country the machine is located in.
    pub country: Option<String>,
    /// City the machine is located in.
    pub city: Option<String>,
}

/// The four ndt7 service URLs advertised for one machine.
///
/// Field names follow the literal keys of the Locate response `urls` object;
/// each URL carries a signed access token and is immutable once received.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceUrls {
    /// TLS download endpoint.
    #[serde(rename = "wss:///ndt/v7/download")]
    pub download_secure: Option<String>,
    /// TLS upload endpoint.
    #[serde(rename = "wss:///ndt/v7/upload")]
    pub upload_secure: Option<String>,
    /// Plain-text download endpoint.
    #[serde(rename = "ws:///ndt/v7/download")]
    pub download_insecure: Option<String>,
    /// Plain-text upload endpoint.
    #[serde(rename = "ws:///ndt/v7/upload")]
    pub upload_insecure: Option<String>,
}

impl ServiceUrls {
    /// The URL for the given mode and direction, if the locator advertised one.
    pub fn resolve(&self, mode: ConnectionMode, direction: TestKind) -> Option<&str> {
        let url = match (mode, direction) {
            (ConnectionMode::Secure, TestKind::Download) => &self.download_secure,
            (ConnectionMode::Secure, TestKind::Upload) => &self.upload_secure,
            (ConnectionMode::Insecure, TestKind::Download) => &self.download_insecure,
            (ConnectionMode::Insecure, TestKind::Upload) => &self.upload_insecure,
        };
        url.as_deref()
    }
}

/// A single measurement server returned by the Locate API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TestServer {
    /// FQDN of the server machine.
    pub machine: String,
    /// Where the machine is located.
    #[serde(default)]
    pub location: Location,
    /// Service URLs with access tokens.
    pub urls: ServiceUrls,
}

/// Top-level response from the Locate API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocateResponse {
    /// Ordered list of nearby servers (closest first).
    pub results: Vec<TestServer>,
}

/// Query the Locate API for the nearest M-Lab servers.
///
/// Returns [`SpeedTestError::OutOfCapacity`] when the API responds with 204
/// or an empty result list, and [`SpeedTestError::RateLimited`] on 429.
pub async fn nearest(
    http: &reqwest::Client,
    locate_url: &str,
    user_agent: &str,
) -> Result<Vec<TestServer>> {
    let response = http
        .get(locate_url)
        .header(reqwest::header::USER_AGENT, user_agent)
        .send()
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(SpeedTestError::RateLimited);
    }
    if status == reqwest::StatusCode::NO_CONTENT {
        return Err(SpeedTestError::OutOfCapacity);
    }
    if !status.is_success() {
        return Err(SpeedTestError::LocateStatus(status));
    }

    let locate: LocateResponse = response.json().await?;
    if locate.results.is_empty() {
        return Err(SpeedTestError::OutOfCapacity);
    }
    Ok(locate.results)
}
