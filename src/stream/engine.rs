//! Delta stream engine.
//!
//! [`DeltaStream`] owns one streaming session at a time. `open()` spawns a
//! background worker that connects at the current cursor, feeds body bytes
//! through the heartbeat [`Watchdog`] and the [`JsonDecoder`], and reconnects
//! with [`Backoff`] when the connection stalls or fails. The caller reads
//! [`DeltaEvent`]s in arrival order from [`DeltaStream::recv`].
//!
//! Lifecycle: `Closed -> Connecting -> Streaming <-> Reconnecting`, ending in
//! `Closed` on [`DeltaStream::close`] or in `Failed` once the backoff budget
//! is spent.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::retry::{with_timeout, Backoff, BackoffConfig};
use crate::stream::decoder::{DecodeError, JsonDecoder};
use crate::stream::proto::{
    Delta, DeltaEvent, DeltaParams, ErrorBody, ReconnectReason, ResponseInfo, StreamInfo,
};
use crate::stream::transport::{
    BodyStream, HttpTransport, StreamRequest, StreamTransport, TransportResponse,
};
use crate::stream::watchdog::Watchdog;

/// Largest error body read from a rejected connection.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Tuning for a [`DeltaStream`].
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    /// How long a connection may go without any bytes before it is restarted.
    pub streaming_timeout: Duration,
    /// Consecutive reconnects allowed without receiving data.
    pub max_restart_retries: u32,
    pub backoff: BackoffConfig,
}

impl StreamOptions {
    pub const DEFAULT_STREAMING_TIMEOUT: Duration = Duration::from_millis(15_000);
    pub const DEFAULT_MAX_RESTART_RETRIES: u32 = 5;

    pub fn with_streaming_timeout(mut self, timeout: Duration) -> Self {
        self.streaming_timeout = timeout;
        self
    }

    pub fn with_max_restart_retries(mut self, retries: u32) -> Self {
        self.max_restart_retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.streaming_timeout.is_zero() {
            return Err(StreamError::Setup(
                "streaming timeout must be > 0".to_string(),
            ));
        }
        self.backoff.validate().map_err(StreamError::Setup)
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            streaming_timeout: Self::DEFAULT_STREAMING_TIMEOUT,
            max_restart_retries: Self::DEFAULT_MAX_RESTART_RETRIES,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Lifecycle of a stream session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Closed,
    Connecting,
    Streaming,
    Reconnecting {
        /// 1-based reconnect attempt since data was last received.
        attempt: u32,
    },
    /// Reconnects were exhausted. Only a fresh `open()` leaves this state.
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Errors reported by the engine, either from `open()` or as events.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StreamError {
    /// Missing cursor or invalid options. Nothing was connected.
    #[error("stream setup failed: {0}")]
    Setup(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-2xx status.
    #[error("http status {status}: {body}")]
    Status { status: u16, body: ErrorBody },

    #[error("invalid JSON at byte {offset}: {message}")]
    Decode { offset: u64, message: String },

    #[error("delta stream failed to reconnect after {attempts} retries")]
    Exhausted { attempts: u32 },
}

impl StreamError {
    /// Whether the session needs a fresh `open()` to make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::Exhausted { .. })
    }
}

impl From<DecodeError> for StreamError {
    fn from(err: DecodeError) -> Self {
        Self::Decode {
            offset: err.offset,
            message: err.message,
        }
    }
}

#[derive(Debug)]
struct Session {
    worker: JoinHandle<()>,
    events: mpsc::UnboundedReceiver<DeltaEvent>,
    cursor: watch::Receiver<String>,
    state: watch::Receiver<StreamState>,
}

/// Resumable delta stream.
///
/// The value is reusable: `open()` closes any running session and starts a
/// new one at the last known cursor.
#[derive(Debug)]
pub struct DeltaStream<T: StreamTransport = HttpTransport> {
    transport: Arc<T>,
    options: StreamOptions,
    params: DeltaParams,
    cursor: Option<String>,
    session: Option<Session>,
}

impl<T: StreamTransport> DeltaStream<T> {
    /// Creates a closed stream that will start at `cursor` when opened.
    pub fn new(
        transport: Arc<T>,
        cursor: Option<String>,
        params: DeltaParams,
        options: StreamOptions,
    ) -> Self {
        Self {
            transport,
            options,
            params,
            cursor,
            session: None,
        }
    }

    /// Starts streaming from the current cursor.
    ///
    /// Must be called from within a Tokio runtime. Any running session is
    /// closed first. Setup problems are returned here and nothing is spawned.
    pub fn open(&mut self) -> Result<(), StreamError> {
        self.close();

        let cursor = self
            .cursor
            .clone()
            .filter(|cursor| !cursor.trim().is_empty())
            .ok_or_else(|| {
                StreamError::Setup("a cursor is required to open a delta stream".to_string())
            })?;
        self.options.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cursor_tx, cursor_rx) = watch::channel(cursor.clone());
        let (state_tx, state_rx) = watch::channel(StreamState::Connecting);

        let worker = Worker {
            transport: Arc::clone(&self.transport),
            params: self.params.clone(),
            streaming_timeout: self.options.streaming_timeout,
            cursor,
            cursor_tx,
            state_tx,
            events: event_tx,
            backoff: Backoff::new(self.options.backoff, self.options.max_restart_retries),
            watchdog: Watchdog::new(self.options.streaming_timeout),
            decoder: JsonDecoder::new(),
        };

        self.session = Some(Session {
            worker: tokio::spawn(worker.run()),
            events: event_rx,
            cursor: cursor_rx,
            state: state_rx,
        });
        Ok(())
    }

    /// Replaces the cursor and opens a new session from it.
    pub fn open_at(&mut self, cursor: impl Into<String>) -> Result<(), StreamError> {
        self.close();
        self.cursor = Some(cursor.into());
        self.open()
    }

    /// Stops the session.
    ///
    /// Events not yet received are discarded; `recv()` returns `None`
    /// afterwards. Safe to call repeatedly. The worker is cancelled, but its
    /// connection and timers are only dropped the next time the runtime polls
    /// it; use [`shutdown`](Self::shutdown) to wait for that.
    pub fn close(&mut self) {
        self.stop();
    }

    /// Like [`close`](Self::close), but returns only after the worker has
    /// dropped its connection and timers.
    pub async fn shutdown(&mut self) {
        if let Some(worker) = self.stop() {
            let _ = worker.await;
        }
    }

    fn stop(&mut self) -> Option<JoinHandle<()>> {
        let mut session = self.session.take()?;

        session.worker.abort();
        session.events.close();
        while session.events.try_recv().is_ok() {}
        self.cursor = Some(session.cursor.borrow().clone());
        debug!(event = "delta_stream_closed", cursor = ?self.cursor);
        Some(session.worker)
    }

    /// Receives the next event. `None` once the session is closed or failed.
    pub async fn recv(&mut self) -> Option<DeltaEvent> {
        self.session.as_mut()?.events.recv().await
    }

    /// Last acknowledged cursor.
    pub fn cursor(&self) -> Option<String> {
        match &self.session {
            Some(session) => Some(session.cursor.borrow().clone()),
            None => self.cursor.clone(),
        }
    }

    pub fn state(&self) -> StreamState {
        match &self.session {
            Some(session) => *session.state.borrow(),
            None => StreamState::Closed,
        }
    }

    pub fn params(&self) -> &DeltaParams {
        &self.params
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }
}

impl<T: StreamTransport> Stream for DeltaStream<T> {
    type Item = DeltaEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().session.as_mut() {
            Some(session) => session.events.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl<T: StreamTransport> Drop for DeltaStream<T> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.worker.abort();
        }
    }
}

struct Worker<T> {
    transport: Arc<T>,
    params: DeltaParams,
    streaming_timeout: Duration,
    cursor: String,
    cursor_tx: watch::Sender<String>,
    state_tx: watch::Sender<StreamState>,
    events: mpsc::UnboundedSender<DeltaEvent>,
    backoff: Backoff,
    watchdog: Watchdog,
    decoder: JsonDecoder,
}

impl<T: StreamTransport> Worker<T> {
    async fn run(mut self) {
        loop {
            self.state_tx.send_replace(StreamState::Connecting);
            let reason = self.run_connection().await;
            self.watchdog.disarm();

            if self.events.is_closed() {
                return;
            }

            if self.backoff.has_exceeded_limit() {
                let attempts = self.backoff.max_attempts();
                error!(
                    event = "delta_stream_exhausted",
                    attempts,
                    cursor = %self.cursor
                );
                self.state_tx.send_replace(StreamState::Failed);
                self.emit(DeltaEvent::Error(StreamError::Exhausted { attempts }));
                return;
            }

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            debug!(
                event = "delta_stream_reconnect_scheduled",
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason
            );
            self.state_tx
                .send_replace(StreamState::Reconnecting { attempt });
            self.emit(DeltaEvent::Info(StreamInfo::Reconnecting {
                attempt,
                delay,
                reason,
                cursor: self.cursor.clone(),
            }));

            tokio::time::sleep(delay).await;
        }
    }

    /// Runs one connection until it has to be replaced.
    async fn run_connection(&mut self) -> ReconnectReason {
        let request = StreamRequest::new(self.cursor.clone(), self.params.clone());
        debug!(
            event = "delta_stream_connecting",
            cursor = %self.cursor,
            attempt = self.backoff.attempt()
        );

        let opened = with_timeout(self.streaming_timeout, self.transport.open(request)).await;
        let response = match opened {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(event = "delta_stream_connect_failed", error = %err);
                self.emit(DeltaEvent::Error(StreamError::Transport(err.to_string())));
                return ReconnectReason::TransportError;
            }
            Err(_) => {
                warn!(
                    event = "delta_stream_response_timeout",
                    timeout_ms = self.streaming_timeout.as_millis() as u64,
                    cursor = %self.cursor
                );
                return ReconnectReason::Stalled;
            }
        };

        let TransportResponse {
            status,
            headers,
            mut body,
        } = response;

        if !status.is_success() {
            let body = read_error_body(body, self.streaming_timeout).await;
            warn!(
                event = "delta_stream_rejected",
                status = status.as_u16(),
                body = %body
            );
            self.emit(DeltaEvent::Error(StreamError::Status {
                status: status.as_u16(),
                body,
            }));
            return ReconnectReason::HttpStatus;
        }

        info!(
            event = "delta_stream_connected",
            status = status.as_u16(),
            cursor = %self.cursor
        );
        self.state_tx.send_replace(StreamState::Streaming);
        self.emit(DeltaEvent::Response(ResponseInfo {
            status: status.as_u16(),
            headers,
        }));
        self.decoder.reset();
        self.watchdog.arm(self.streaming_timeout);

        loop {
            tokio::select! {
                biased;
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if let Some(reason) = self.on_chunk(&bytes) {
                            return reason;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(event = "delta_stream_read_failed", error = %err);
                        self.emit(DeltaEvent::Error(StreamError::Transport(err.to_string())));
                        return ReconnectReason::TransportError;
                    }
                    None => {
                        warn!(event = "delta_stream_ended", cursor = %self.cursor);
                        self.emit(DeltaEvent::Error(StreamError::Transport(
                            "stream ended by server".to_string(),
                        )));
                        return ReconnectReason::StreamEnded;
                    }
                },
                () = self.watchdog.stalled() => {
                    warn!(
                        event = "delta_stream_stalled",
                        timeout_ms = self.streaming_timeout.as_millis() as u64,
                        cursor = %self.cursor
                    );
                    return ReconnectReason::Stalled;
                }
            }
        }
    }

    /// Handles one body chunk. Returns a reason when the connection must be
    /// replaced.
    fn on_chunk(&mut self, bytes: &[u8]) -> Option<ReconnectReason> {
        self.watchdog.on_data();
        self.backoff.reset();

        for item in self.decoder.feed(bytes) {
            match item {
                Ok(value) => {
                    let delta = Delta::from_value(value);
                    if let Some(cursor) = delta.cursor.as_ref() {
                        self.cursor.clone_from(cursor);
                        self.cursor_tx.send_replace(cursor.clone());
                    }
                    let _ = self.events.send(DeltaEvent::Delta(delta));
                }
                Err(err) => {
                    warn!(
                        event = "delta_stream_decode_failed",
                        offset = err.offset,
                        error = %err.message
                    );
                    let _ = self.events.send(DeltaEvent::Error(err.into()));
                    return Some(ReconnectReason::DecodeError);
                }
            }
        }

        if self.events.is_closed() {
            return Some(ReconnectReason::StreamEnded);
        }
        None
    }

    fn emit(&self, event: DeltaEvent) {
        let _ = self.events.send(event);
    }
}

async fn read_error_body(mut body: BodyStream, limit: Duration) -> ErrorBody {
    let mut collected = Vec::new();
    let read = async {
        while let Some(Ok(chunk)) = body.next().await {
            collected.extend_from_slice(&chunk);
            if collected.len() >= MAX_ERROR_BODY_BYTES {
                break;
            }
        }
    };
    if with_timeout(limit, read).await.is_err() {
        debug!(event = "delta_stream_error_body_timeout");
    }

    collected.truncate(MAX_ERROR_BODY_BYTES);
    ErrorBody::from_bytes(&collected)
}
