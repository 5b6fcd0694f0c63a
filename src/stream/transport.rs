//! Transport seam between the delta engine and the network.
//!
//! The engine only needs to issue a GET against the streaming path, look at
//! the status, and pull body chunks until it decides to stop. Dropping the
//! [`TransportResponse`] aborts the request.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::debug;

use crate::api::{ApiError, ClientConfig};
use crate::stream::proto::DeltaParams;

/// Path of the streaming endpoint, relative to the API base URL.
pub const STREAMING_PATH: &str = "/delta/streaming";

/// A single streaming request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub path: &'static str,
    pub cursor: String,
    pub params: DeltaParams,
}

impl StreamRequest {
    pub fn new(cursor: impl Into<String>, params: DeltaParams) -> Self {
        Self {
            path: STREAMING_PATH,
            cursor: cursor.into(),
            params,
        }
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.params.query_pairs(&self.cursor)
    }
}

/// Errors produced while opening or reading a stream connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Byte chunks of a response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response to a [`StreamRequest`].
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Issues streaming GET requests.
///
/// Implementations must be cheap to share across reconnects; the engine
/// holds one behind an `Arc` for the life of a [`DeltaStream`].
///
/// [`DeltaStream`]: crate::stream::engine::DeltaStream
pub trait StreamTransport: Send + Sync + 'static {
    fn open(&self, request: StreamRequest)
        -> BoxFuture<'static, Result<TransportResponse, TransportError>>;
}

/// Production transport backed by `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
    access_token: SecretString,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        config.validate()?;

        // No overall request timeout: the body stays open indefinitely and
        // liveness is the watchdog's job.
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: config.base_url().to_string(),
            access_token: config.access_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl StreamTransport for HttpTransport {
    fn open(
        &self,
        request: StreamRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let builder = self
            .http
            .get(self.endpoint(request.path))
            .bearer_auth(self.access_token.expose_secret())
            .query(&request.query_pairs());

        Box::pin(async move {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            debug!(
                event = "delta_stream_response",
                status = status.as_u16(),
                cursor = %request.cursor
            );

            let body = response.bytes_stream().map_err(TransportError::Http).boxed();
            Ok(TransportResponse {
                status,
                headers,
                body,
            })
        })
    }
}
