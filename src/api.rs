use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const DEFAULT_API_BASE_URL: &str = "https://api.nylas.com";
pub const LATEST_CURSOR_PATH: &str = "/delta/latest_cursor";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
}

/// Connection settings shared by the one-shot API client and the streaming
/// transport.
#[derive(Clone)]
pub struct ClientConfig {
    base_url: String,
    pub access_token: SecretString,
    pub connect_timeout: Duration,
    /// Per-attempt timeout for one-shot requests. Streams are not bounded by it.
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl ClientConfig {
    pub fn new(access_token: SecretString) -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            access_token,
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            request_timeout: ApiDefaults::REQUEST_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Points the client at another API server.
    ///
    /// The URL must be fully qualified; trailing whitespace and slashes are
    /// dropped.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Result<Self, ApiError> {
        let base_url = base_url.into();
        let trimmed = base_url.trim_end().trim_end_matches('/');
        if !trimmed.contains("://") {
            return Err(ApiError::Config(format!(
                "api server must be a fully qualified URL, got {trimmed:?}"
            )));
        }
        reqwest::Url::parse(trimmed)
            .map_err(|err| ApiError::Config(format!("invalid api server URL: {err}")))?;
        self.base_url = trimmed.to_string();
        Ok(self)
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn validate(&self) -> Result<(), ApiError> {
        if self.access_token.expose_secret().trim().is_empty() {
            return Err(ApiError::Config("access token must not be empty".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// Client for one-shot delta API calls.
#[derive(Clone)]
pub struct DeltaApiClient {
    http: Client,
    base_url: String,
    access_token: SecretString,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl DeltaApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        config.validate()?;

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: config.base_url().to_string(),
            access_token: config.access_token.clone(),
            request_timeout: config.request_timeout,
            retry_policy: config.retry_policy.clone(),
        })
    }

    /// Fetches the newest cursor, used to start a stream with no history.
    pub async fn latest_cursor(&self) -> Result<String, ApiError> {
        let endpoint = self.endpoint(LATEST_CURSOR_PATH);
        let policy = self.retry_policy.clone();

        let cursor = retry_async(
            &policy,
            |attempt| {
                let endpoint = endpoint.clone();
                async move {
                    debug!(event = "latest_cursor_request", attempt);
                    self.send_latest_cursor(&endpoint).await
                }
            },
            ApiError::is_retryable,
        )
        .await?;

        debug!(event = "latest_cursor_fetched", cursor = %cursor);
        Ok(cursor)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_latest_cursor(&self, endpoint: &str) -> Result<String, ApiError> {
        let response = self
            .http
            .post(endpoint)
            .timeout(self.request_timeout)
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_latest_cursor(&body)
    }
}

impl fmt::Debug for DeltaApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Config(_) | Self::Parse(_) => false,
        }
    }
}

fn parse_latest_cursor(body: &str) -> Result<String, ApiError> {
    #[derive(Debug, Deserialize)]
    struct LatestCursorResponse {
        #[serde(default)]
        cursor: Option<String>,
    }

    let parsed: LatestCursorResponse =
        serde_json::from_str(body).map_err(|err| ApiError::Parse(err.to_string()))?;
    parsed
        .cursor
        .filter(|cursor| !cursor.is_empty())
        .ok_or_else(|| ApiError::Parse("response missing cursor".to_string()))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
