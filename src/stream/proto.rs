use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::stream::engine::StreamError;

/// Query parameters fixed for the life of a stream session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaParams {
    /// Object types to exclusively receive deltas for.
    pub include_types: BTreeSet<String>,
    /// Object types to never receive deltas for.
    pub exclude_types: BTreeSet<String>,
    /// Requests the expanded object view.
    pub expanded: bool,
    /// Additional query parameters passed through verbatim.
    pub extra: BTreeMap<String, String>,
}

impl DeltaParams {
    pub fn include<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn with_expanded(mut self, expanded: bool) -> Self {
        self.expanded = expanded;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Builds the query string pairs for a connection resuming at `cursor`.
    pub fn query_pairs(&self, cursor: &str) -> Vec<(String, String)> {
        let mut pairs = vec![("cursor".to_string(), cursor.to_string())];
        if !self.exclude_types.is_empty() {
            pairs.push((
                "exclude_types".to_string(),
                join_types(&self.exclude_types),
            ));
        }
        if !self.include_types.is_empty() {
            pairs.push((
                "include_types".to_string(),
                join_types(&self.include_types),
            ));
        }
        if self.expanded {
            pairs.push(("expanded".to_string(), "true".to_string()));
        }
        for (key, value) in &self.extra {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            pairs.push((key.clone(), value.clone()));
        }
        pairs
    }
}

const RESERVED_KEYS: [&str; 4] = ["cursor", "include_types", "exclude_types", "expanded"];

fn join_types(types: &BTreeSet<String>) -> String {
    types
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// One change record decoded from the stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Delta {
    /// Resume position after this delta, when the server attached one.
    pub cursor: Option<String>,
    /// Resource type, e.g. `thread` or `message`.
    pub object: Option<String>,
    /// Change kind, e.g. `create`, `modify`, `delete`.
    pub kind: Option<String>,
    /// Identifier of the changed resource.
    pub id: Option<String>,
    pub attributes: Option<Value>,
    /// The decoded value as received.
    pub raw: Value,
}

impl Delta {
    /// Builds a delta from any decoded value.
    ///
    /// Missing or non-string fields are left as `None`; an empty cursor string
    /// counts as missing.
    pub fn from_value(raw: Value) -> Self {
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);

        Self {
            cursor: text("cursor").filter(|cursor| !cursor.is_empty()),
            object: text("object"),
            kind: text("event").or_else(|| text("type")),
            id: text("id"),
            attributes: raw.get("attributes").cloned(),
            raw,
        }
    }
}

/// Status line and headers of an accepted stream connection.
#[derive(Clone, Debug)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: HeaderMap,
}

/// Why the engine is about to reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectReason {
    /// No bytes arrived within the streaming timeout.
    Stalled,
    TransportError,
    HttpStatus,
    DecodeError,
    /// The server finished the response body.
    StreamEnded,
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Stalled => "no data within streaming timeout",
            Self::TransportError => "transport error",
            Self::HttpStatus => "error response",
            Self::DecodeError => "undecodable data",
            Self::StreamEnded => "stream ended by server",
        };
        f.write_str(text)
    }
}

/// Non-fatal status changes.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamInfo {
    Reconnecting {
        /// 1-based reconnect attempt since the last received data.
        attempt: u32,
        delay: Duration,
        reason: ReconnectReason,
        /// Cursor the reconnect will resume from.
        cursor: String,
    },
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting {
                attempt,
                delay,
                reason,
                cursor,
            } => write!(
                f,
                "restarting delta stream connection (attempt {attempt}) in {}ms after {reason}: cursor={cursor}",
                delay.as_millis()
            ),
        }
    }
}

/// Event delivered by [`DeltaStream`](crate::stream::engine::DeltaStream).
#[derive(Clone, Debug)]
pub enum DeltaEvent {
    /// A connection was accepted with a 2xx status.
    Response(ResponseInfo),
    Delta(Delta),
    Info(StreamInfo),
    /// Recoverable errors, or the single terminal error when retries run out.
    Error(StreamError),
}

/// Body of a rejected stream request.
#[derive(Clone, Debug, PartialEq)]
pub enum ErrorBody {
    Json(Value),
    Text(String),
    Empty,
}

impl ErrorBody {
    const SNIPPET_LEN: usize = 220;

    /// Parses as JSON when possible, falling back to a text snippet.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Self::Empty;
        }
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return Self::Json(value);
        }
        let text = String::from_utf8_lossy(bytes);
        Self::Text(text.trim().chars().take(Self::SNIPPET_LEN).collect())
    }

    /// Human readable message carried by the body, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Json(value) => ["message", "error", "reason"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str)),
            Self::Text(text) => Some(text.as_str()),
            Self::Empty => None,
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.message(), self) {
            (Some(message), _) => f.write_str(message),
            (None, Self::Json(value)) => write!(f, "{value}"),
            (None, _) => f.write_str("<empty body>"),
        }
    }
}
