//! Delta streaming modules.
//!
//! - `decoder`: incremental framing of concatenated JSON values.
//! - `watchdog`: heartbeat deadline that detects stalled connections.
//! - `transport`: streaming request seam and its `reqwest` implementation.
//! - `proto`: query parameters, deltas, and the event contract.
//! - `engine`: the reconnecting, cursor-tracking stream session.

/// Incremental JSON value decoder.
pub mod decoder;
/// Stream session engine.
pub mod engine;
/// Stream parameters and event types.
pub mod proto;
/// Streaming transport abstraction.
pub mod transport;
/// Heartbeat watchdog.
pub mod watchdog;
