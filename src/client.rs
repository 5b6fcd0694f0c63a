//! Entry point tying the cursor API and the streaming transport together.

use std::sync::Arc;

use thiserror::Error;

use crate::api::{ApiError, ClientConfig, DeltaApiClient};
use crate::stream::engine::{DeltaStream, StreamError, StreamOptions};
use crate::stream::proto::DeltaParams;
use crate::stream::transport::HttpTransport;

/// Account-scoped client for the delta API.
///
/// Each client owns its own HTTP connection pools. Streams started from it
/// share the transport but nothing else.
#[derive(Clone, Debug)]
pub struct DeltaClient {
    api: DeltaApiClient,
    transport: Arc<HttpTransport>,
    options: StreamOptions,
}

impl DeltaClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_options(config, StreamOptions::default())
    }

    pub fn with_options(config: ClientConfig, options: StreamOptions) -> Result<Self, ClientError> {
        options.validate()?;
        Ok(Self {
            api: DeltaApiClient::new(&config)?,
            transport: Arc::new(HttpTransport::new(&config)?),
            options,
        })
    }

    pub fn api(&self) -> &DeltaApiClient {
        &self.api
    }

    /// Fetches the newest cursor.
    pub async fn latest_cursor(&self) -> Result<String, ClientError> {
        Ok(self.api.latest_cursor().await?)
    }

    /// Opens a stream at `cursor`, or at the latest cursor when `None`.
    pub async fn start_stream(
        &self,
        cursor: Option<String>,
        params: DeltaParams,
    ) -> Result<DeltaStream<HttpTransport>, ClientError> {
        let cursor = match cursor {
            Some(cursor) => cursor,
            None => self.latest_cursor().await?,
        };

        let mut stream = self.stream_at(cursor, params);
        stream.open()?;
        Ok(stream)
    }

    /// Builds a closed stream; call [`DeltaStream::open`] to start it.
    pub fn stream_at(&self, cursor: impl Into<String>, params: DeltaParams) -> DeltaStream {
        DeltaStream::new(
            Arc::clone(&self.transport),
            Some(cursor.into()),
            params,
            self.options.clone(),
        )
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
