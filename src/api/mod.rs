//! # API Module
//!
//! HTTP access to the tracking cloud API.
//!
//! This module handles:
//! - The `ApiRequester` trait abstracting GET/POST with JSON bodies
//! - The reqwest-backed client with bearer-token headers and a request timeout
//! - Response envelope validation (`success` flag inspection)
//! - Endpoint path constants

pub mod validate;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;

/// Device list endpoint (GET)
pub const DEVICES_INFO_PATH: &str = "/devices/info";

/// Extended telemetry endpoint (POST)
pub const DEVICE_EXTENDED_PATH: &str = "/device/info/extended";

/// Trait for API request operations to enable testing
///
/// The rest of the crate (paginator, snapshot builder, poller) talks to the
/// server exclusively through this trait, so tests can script responses
/// without a network.
#[async_trait]
pub trait ApiRequester: Send + Sync {
    /// Perform a GET request and decode the JSON body
    async fn get(&self, path: &str) -> Result<Value>;

    /// Perform a POST request with a JSON body and decode the JSON response
    async fn post(&self, path: &str, body: Value) -> Result<Value>;
}

/// Reqwest-backed client for the tracking cloud API
///
/// Owns the base URL and bearer token; attaches JSON content/accept headers
/// to every request. Non-2xx responses and network failures surface as
/// transport errors before any payload inspection happens.
pub struct CloudApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for CloudApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl CloudApiClient {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `base_url` - API base URL (trailing slashes are stripped)
    /// * `token` - Bearer token issued by the tracking portal
    /// * `timeout` - Per-request timeout; a finite timeout is mandatory
    ///
    /// # Errors
    ///
    /// Returns error if the underlying HTTP client cannot be built
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ApiRequester for CloudApiClient {
    async fn get(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let url = self.url(path);
        debug!("POST {}", url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// One recorded request, in arrival order
    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedCall {
        Get { path: String },
        Post { path: String, body: Value },
    }

    /// Mock requester with scripted responses and a call log
    ///
    /// GET responses are keyed by path; POST responses are keyed by
    /// `"<deviceid>/<type>"` taken from the request body so concurrent
    /// per-device fetches stay deterministic. Responses for one key are
    /// consumed in FIFO order (page 1, page 2, ...).
    #[derive(Clone, Default)]
    pub struct MockRequester {
        get_responses: Arc<Mutex<HashMap<String, VecDeque<Value>>>>,
        post_responses: Arc<Mutex<HashMap<String, VecDeque<Value>>>>,
        pub calls: Arc<Mutex<Vec<RecordedCall>>>,
    }

    impl MockRequester {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script_get(&self, path: &str, response: Value) {
            self.get_responses
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_default()
                .push_back(response);
        }

        /// Script one POST page response for a (device, type) pair
        pub fn script_post(&self, device_id: &str, telemetry_type: &str, response: Value) {
            self.post_responses
                .lock()
                .unwrap()
                .entry(format!("{}/{}", device_id, telemetry_type))
                .or_default()
                .push_back(response);
        }

        pub fn recorded_calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        /// Number of POST requests issued for a (device, type) pair
        pub fn post_count(&self, device_id: &str, telemetry_type: &str) -> usize {
            self.recorded_calls()
                .iter()
                .filter(|call| match call {
                    RecordedCall::Post { body, .. } => {
                        body["deviceid"] == device_id && body["type"] == telemetry_type
                    }
                    _ => false,
                })
                .count()
        }
    }

    #[async_trait]
    impl ApiRequester for MockRequester {
        async fn get(&self, path: &str) -> Result<Value> {
            self.calls.lock().unwrap().push(RecordedCall::Get {
                path: path.to_string(),
            });

            self.get_responses
                .lock()
                .unwrap()
                .get_mut(path)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| panic!("no scripted GET response for {}", path))
        }

        async fn post(&self, path: &str, body: Value) -> Result<Value> {
            let key = format!(
                "{}/{}",
                body["deviceid"].as_str().unwrap_or_default(),
                body["type"].as_str().unwrap_or_default()
            );

            self.calls.lock().unwrap().push(RecordedCall::Post {
                path: path.to_string(),
                body,
            });

            self.post_responses
                .lock()
                .unwrap()
                .get_mut(&key)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| panic!("no scripted POST response for {}", key))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_stripped() {
        let client = CloudApiClient::new(
            "https://api.example.test/v1/",
            "token",
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(client.base_url(), "https://api.example.test/v1");
        assert_eq!(client.url(DEVICES_INFO_PATH), "https://api.example.test/v1/devices/info");
    }

    #[test]
    fn test_token_trimmed() {
        let client =
            CloudApiClient::new("https://api.example.test", " token \n", Duration::from_secs(5))
                .unwrap();
        assert_eq!(client.token, "token");
    }
}
