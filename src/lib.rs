//! Rust SDK for consuming resumable delta streams.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP client for one-shot calls such as fetching the latest cursor.
//! - `stream`: long-lived delta stream with heartbeat detection, incremental
//!   decoding, and cursor-resuming reconnects.
//! - `client`: convenience entry point combining both.
//! - `retry`: shared retry, backoff, and timeout utilities.

/// Delta API client and connection configuration.
pub mod api;
/// Entry point combining cursor lookup and streaming.
pub mod client;
/// Retry, backoff, and timeout helpers used across the SDK.
pub mod retry;
/// Delta stream engine, decoder, watchdog, and protocol types.
pub mod stream;

pub use client::{ClientError, DeltaClient};
pub use stream::engine::{DeltaStream, StreamError, StreamOptions, StreamState};
pub use stream::proto::{Delta, DeltaEvent, DeltaParams};
