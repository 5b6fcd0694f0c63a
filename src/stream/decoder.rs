//! Incremental decoder for concatenated JSON values.
//!
//! The delta endpoint writes one JSON value after another with nothing but
//! optional whitespace between them, and the transport hands those bytes over
//! in arbitrarily sized chunks. [`JsonDecoder`] buffers partial values across
//! [`feed`](JsonDecoder::feed) calls and yields each value once its last byte
//! has arrived.
//!
//! Framing is done with a small byte scanner that follows the JSON grammar
//! (container stack, expected next token, string and keyword state). A byte
//! that no continuation could make valid fails the value immediately, so a
//! corrupt fragment never swallows the values after it. Numbers and string
//! escapes are only checked for their extent; the fully framed value is
//! handed to `serde_json`. Multi-byte UTF-8 sequences never contain ASCII
//! structural bytes, which keeps byte-level scanning safe for split code
//! points.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use thiserror::Error;

/// Largest partial value held before the decoder gives up on it.
pub const DEFAULT_MAX_VALUE_LEN: usize = 8 * 1024 * 1024;

/// A fragment that can not be completed into valid JSON.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid JSON at byte {offset}: {message}")]
pub struct DecodeError {
    /// Byte offset, counted from the last reset, where the bad value starts.
    pub offset: u64,
    pub message: String,
}

/// What the scanner accepts next when it is not inside a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Expect {
    /// Any value. At depth zero this is the idle state between values.
    Value,
    /// A value or `]`, right after `[`.
    ValueOrEnd,
    /// A key or `}`, right after `{`.
    KeyOrEnd,
    /// A key, after `,` inside an object.
    Key,
    Colon,
    /// `,` or the closer of the innermost container.
    CommaOrEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Token {
    None,
    String { key: bool },
    Keyword { word: &'static [u8], matched: usize },
    Number,
}

/// Long-lived, restartable decoder that turns byte chunks into JSON values.
#[derive(Debug)]
pub struct JsonDecoder {
    buffer: BytesMut,
    /// Absolute offset of `buffer[0]`.
    consumed: u64,
    /// Scan position within `buffer`; bytes before it are already classified.
    pos: usize,
    max_value_len: usize,
    /// Openers of the containers enclosing `pos`.
    containers: Vec<u8>,
    expect: Expect,
    token: Token,
    escaped: bool,
}

impl Default for JsonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            consumed: 0,
            pos: 0,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            containers: Vec::new(),
            expect: Expect::Value,
            token: Token::None,
            escaped: false,
        }
    }

    /// Caps how many bytes a single unfinished value may occupy.
    pub fn with_max_value_len(mut self, max_value_len: usize) -> Self {
        self.max_value_len = max_value_len;
        self
    }

    /// Appends `bytes` and returns a lazy iterator over every value completed
    /// so far.
    ///
    /// Values left incomplete at the end of the chunk stay buffered for the
    /// next call. A syntax error discards everything buffered, including the
    /// rest of the chunk, so the caller can decide whether to continue or
    /// reset. A value that is framed but rejected by `serde_json` only drops
    /// that value.
    pub fn feed(&mut self, bytes: &[u8]) -> Decoded<'_> {
        self.buffer.extend_from_slice(bytes);
        Decoded { decoder: self }
    }

    /// Drops all buffered state and restarts offsets at zero.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.consumed = 0;
        self.clear_scan();
    }

    /// Number of bytes held for a value that has not completed yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a value is partially buffered.
    pub fn is_mid_value(&self) -> bool {
        !self.containers.is_empty() || self.token != Token::None
    }

    fn clear_scan(&mut self) {
        self.pos = 0;
        self.containers.clear();
        self.expect = Expect::Value;
        self.token = Token::None;
        self.escaped = false;
    }

    fn next_value(&mut self) -> Option<Result<Value, DecodeError>> {
        while self.pos < self.buffer.len() {
            let byte = self.buffer[self.pos];
            match self.token {
                Token::String { key } => {
                    self.pos += 1;
                    if self.escaped {
                        self.escaped = false;
                    } else if byte == b'\\' {
                        self.escaped = true;
                    } else if byte == b'"' {
                        self.token = Token::None;
                        if key {
                            self.expect = Expect::Colon;
                        } else if let Some(result) = self.value_done(self.pos) {
                            return Some(result);
                        }
                    }
                    continue;
                }
                Token::Keyword { word, matched } => {
                    if byte != word[matched] {
                        return Some(Err(self.unexpected(byte)));
                    }
                    self.pos += 1;
                    if matched + 1 < word.len() {
                        self.token = Token::Keyword {
                            word,
                            matched: matched + 1,
                        };
                        continue;
                    }
                    self.token = Token::None;
                    if let Some(result) = self.value_done(self.pos) {
                        return Some(result);
                    }
                    continue;
                }
                Token::Number => {
                    if is_number_byte(byte) {
                        self.pos += 1;
                        continue;
                    }
                    // The delimiter is scanned again as structure.
                    self.token = Token::None;
                    if let Some(result) = self.value_done(self.pos) {
                        return Some(result);
                    }
                    continue;
                }
                Token::None => {}
            }

            if is_whitespace(byte) {
                if self.containers.is_empty() {
                    self.buffer.advance(1);
                    self.consumed += 1;
                } else {
                    self.pos += 1;
                }
                continue;
            }
            if let Some(result) = self.structural(byte) {
                return Some(result);
            }
        }

        if self.pos > self.max_value_len {
            let message = format!("value exceeds {} bytes", self.max_value_len);
            return Some(Err(self.fail(message)));
        }
        None
    }

    fn structural(&mut self, byte: u8) -> Option<Result<Value, DecodeError>> {
        match (self.expect, byte) {
            (Expect::ValueOrEnd, b']')
            | (Expect::KeyOrEnd, b'}')
            | (Expect::CommaOrEnd, b']' | b'}') => self.close(byte),
            (Expect::Value | Expect::ValueOrEnd, _) => self.begin_value(byte),
            (Expect::Key | Expect::KeyOrEnd, b'"') => {
                self.token = Token::String { key: true };
                self.pos += 1;
                None
            }
            (Expect::Colon, b':') => {
                self.expect = Expect::Value;
                self.pos += 1;
                None
            }
            (Expect::CommaOrEnd, b',') => {
                self.expect = match self.containers.last() {
                    Some(b'{') => Expect::Key,
                    _ => Expect::Value,
                };
                self.pos += 1;
                None
            }
            _ => Some(Err(self.unexpected(byte))),
        }
    }

    fn begin_value(&mut self, byte: u8) -> Option<Result<Value, DecodeError>> {
        match byte {
            b'{' => {
                self.containers.push(b'{');
                self.expect = Expect::KeyOrEnd;
            }
            b'[' => {
                self.containers.push(b'[');
                self.expect = Expect::ValueOrEnd;
            }
            b'"' => self.token = Token::String { key: false },
            b't' => self.token = keyword(b"true"),
            b'f' => self.token = keyword(b"false"),
            b'n' => self.token = keyword(b"null"),
            b'-' | b'0'..=b'9' => self.token = Token::Number,
            other => return Some(Err(self.unexpected(other))),
        }
        self.pos += 1;
        None
    }

    fn close(&mut self, closer: u8) -> Option<Result<Value, DecodeError>> {
        let opener = if closer == b'}' { b'{' } else { b'[' };
        if self.containers.pop() != Some(opener) {
            return Some(Err(self.unexpected(closer)));
        }
        self.pos += 1;
        self.value_done(self.pos)
    }

    /// Called when a value ends at `end`; yields it once it is top level.
    fn value_done(&mut self, end: usize) -> Option<Result<Value, DecodeError>> {
        if self.containers.is_empty() {
            return Some(self.complete(end));
        }
        self.expect = Expect::CommaOrEnd;
        None
    }

    fn complete(&mut self, end: usize) -> Result<Value, DecodeError> {
        let offset = self.consumed;
        let frame = self.buffer.split_to(end).freeze();
        self.consumed += end as u64;
        self.clear_scan();

        serde_json::from_slice(&frame).map_err(|err| DecodeError {
            offset,
            message: err.to_string(),
        })
    }

    fn unexpected(&mut self, byte: u8) -> DecodeError {
        let at = self.consumed + self.pos as u64;
        let message = if byte.is_ascii_graphic() {
            format!("unexpected '{}' at byte {at}", byte as char)
        } else {
            format!("unexpected byte 0x{byte:02x} at byte {at}")
        };
        self.fail(message)
    }

    fn fail(&mut self, message: String) -> DecodeError {
        let offset = self.consumed;
        self.consumed += self.buffer.len() as u64;
        self.buffer.clear();
        self.clear_scan();
        DecodeError { offset, message }
    }
}

/// Values completed by a single [`JsonDecoder::feed`] call.
#[derive(Debug)]
pub struct Decoded<'a> {
    decoder: &'a mut JsonDecoder,
}

impl Iterator for Decoded<'_> {
    type Item = Result<Value, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_value()
    }
}

fn keyword(word: &'static [u8]) -> Token {
    Token::Keyword { word, matched: 1 }
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

fn is_number_byte(byte: u8) -> bool {
    matches!(byte, b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::{json, Value};

    use super::JsonDecoder;

    fn decode_all(decoder: &mut JsonDecoder, bytes: &[u8]) -> Vec<Value> {
        decoder
            .feed(bytes)
            .collect::<Result<Vec<_>, _>>()
            .expect("valid input")
    }

    #[test]
    fn decodes_concatenated_objects() {
        let mut decoder = JsonDecoder::new();
        let values = decode_all(&mut decoder, br#"{"a":1}{"b":[1,2]} {"c":null}"#);
        assert_eq!(values, vec![json!({"a":1}), json!({"b":[1,2]}), json!({"c":null})]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn heartbeat_newlines_produce_nothing() {
        let mut decoder = JsonDecoder::new();
        assert!(decode_all(&mut decoder, b"\n").is_empty());
        assert!(decode_all(&mut decoder, b"\r\n\n  \t").is_empty());
        assert_eq!(decoder.buffered(), 0);
        assert!(!decoder.is_mid_value());
    }

    #[test]
    fn buffers_value_split_inside_string() {
        let mut decoder = JsonDecoder::new();
        assert!(decode_all(&mut decoder, br#"{"cursor":"de"#).is_empty());
        assert!(decoder.is_mid_value());
        let values = decode_all(&mut decoder, br#"f","object":"thread"}"#);
        assert_eq!(values, vec![json!({"cursor":"def","object":"thread"})]);
    }

    #[test]
    fn braces_inside_strings_do_not_close_objects() {
        let mut decoder = JsonDecoder::new();
        let values = decode_all(&mut decoder, br#"{"subject":"}{ \"quoted\" ]"}"#);
        assert_eq!(values, vec![json!({"subject":"}{ \"quoted\" ]"})]);
    }

    #[test]
    fn escaped_backslash_before_quote_is_handled() {
        let mut decoder = JsonDecoder::new();
        assert!(decode_all(&mut decoder, br#"{"path":"c:\"#).is_empty());
        let values = decode_all(&mut decoder, br#"\"}"#);
        assert_eq!(values, vec![json!({"path":"c:\\"})]);
    }

    #[test]
    fn multibyte_characters_split_across_chunks() {
        let payload = "{\"name\":\"caf\u{e9} \u{1f600}\"}".as_bytes().to_vec();
        let mut decoder = JsonDecoder::new();
        let mut values = Vec::new();
        for byte in &payload {
            values.extend(decode_all(&mut decoder, std::slice::from_ref(byte)));
        }
        assert_eq!(values, vec![json!({"name":"caf\u{e9} \u{1f600}"})]);
    }

    #[test]
    fn top_level_scalars_complete_on_delimiter() {
        let mut decoder = JsonDecoder::new();
        assert!(decode_all(&mut decoder, b"12").is_empty());
        let values = decode_all(&mut decoder, b"3\ntrue\"s\"[1]");
        assert_eq!(values, vec![json!(123), json!(true), json!("s"), json!([1])]);
    }

    #[test]
    fn mismatched_closer_is_reported_with_offset() {
        let mut decoder = JsonDecoder::new();
        let mut results = decoder.feed(b"{\"a\":1}\n{\"b\":[1}").collect::<Vec<_>>();
        assert_eq!(results.len(), 2);
        let error = results.pop().expect("error").expect_err("mismatched bracket");
        assert_eq!(error.offset, 8);
        assert_eq!(results.pop().expect("value").expect("first value"), json!({"a":1}));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn stray_byte_between_values_is_an_error() {
        let mut decoder = JsonDecoder::new();
        let results = decoder.feed(b"  ,{}").collect::<Vec<_>>();
        assert_eq!(results.len(), 1);
        let error = results[0].clone().expect_err("comma is not a value");
        assert_eq!(error.offset, 2);
    }

    #[test]
    fn framed_but_invalid_value_is_an_error() {
        let mut decoder = JsonDecoder::new();
        let results = decoder.feed(b"{\"a\":1-2}{\"b\":2}").collect::<Vec<_>>();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].clone().expect_err("bad number").offset, 0);
        assert_eq!(results[1].clone().expect("next value"), json!({"b":2}));
    }

    #[test]
    fn missing_colon_fails_before_object_closes() {
        let mut decoder = JsonDecoder::new();
        let results = decoder.feed(b"\n{\"a\" 1").collect::<Vec<_>>();
        assert_eq!(results.len(), 1);
        let error = results[0].clone().expect_err("missing colon");
        assert_eq!(error.offset, 1);
        assert!(error.message.contains("unexpected '1'"), "{}", error.message);
        assert_eq!(decoder.buffered(), 0);
        assert!(!decoder.is_mid_value());
    }

    #[test]
    fn unclosed_malformed_object_does_not_swallow_later_deltas() {
        let mut decoder = JsonDecoder::new();
        let results = decoder.feed(b"{x\n").collect::<Vec<_>>();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].clone().expect_err("bare key").offset, 0);

        let mut values = Vec::new();
        for n in 0..50 {
            let chunk = format!("{{\"cursor\":\"c{n}\",\"object\":\"thread\"}}\n");
            values.extend(decode_all(&mut decoder, chunk.as_bytes()));
        }
        assert_eq!(values.len(), 50);
        assert_eq!(values[49], json!({"cursor":"c49","object":"thread"}));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn unclosed_fragments_fail_on_first_bad_byte() {
        for fragment in [
            &b"{1:2"[..],
            b"{\"a\":1 \"b\"",
            b"[1 2",
            b"[,",
            b"{\"a\":}",
            b"{\"a\":tru ",
            b"[1,]",
        ] {
            let mut decoder = JsonDecoder::new();
            let results = decoder.feed(fragment).collect::<Vec<_>>();
            assert_eq!(results.len(), 1, "{}", String::from_utf8_lossy(fragment));
            assert!(results[0].is_err(), "{}", String::from_utf8_lossy(fragment));
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn misspelled_keyword_fails_without_delimiter() {
        let mut decoder = JsonDecoder::new();
        let results = decoder.feed(b"nulX").collect::<Vec<_>>();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].clone().expect_err("not null").offset, 0);
        assert_eq!(decoder.buffered(), 0);

        let garbage = decoder.feed(b"garbage_garbage").collect::<Vec<_>>();
        assert_eq!(garbage.len(), 1);
        assert_eq!(garbage[0].clone().expect_err("garbage").offset, 4);
        assert_eq!(decoder.buffered(), 0);

        assert_eq!(decode_all(&mut decoder, b"null"), vec![Value::Null]);
    }

    #[test]
    fn oversized_partial_value_is_dropped() {
        let mut decoder = JsonDecoder::new().with_max_value_len(16);
        assert!(decode_all(&mut decoder, br#"{"body":""#).is_empty());
        let results = decoder.feed(&[b'a'; 32]).collect::<Vec<_>>();
        assert_eq!(results.len(), 1);
        let error = results[0].clone().expect_err("too large");
        assert_eq!(error.offset, 0);
        assert!(error.message.contains("exceeds 16 bytes"));
        assert_eq!(decoder.buffered(), 0);

        assert_eq!(decode_all(&mut decoder, b"{}"), vec![json!({})]);
    }

    #[test]
    fn reset_discards_partial_value() {
        let mut decoder = JsonDecoder::new();
        assert!(decode_all(&mut decoder, br#"{"half":"#).is_empty());
        decoder.reset();
        assert_eq!(decoder.buffered(), 0);
        let values = decode_all(&mut decoder, br#"{"whole":true}"#);
        assert_eq!(values, vec![json!({"whole":true})]);
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z{}\\[\\]\"\\\\ é😀,:]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        })
    }

    fn arb_delta() -> impl Strategy<Value = Value> {
        (
            "[a-z0-9]{1,16}",
            "(thread|message|contact|event)",
            "(create|modify|delete)",
            arb_json(),
        )
            .prop_map(|(cursor, object, kind, attributes)| {
                json!({"cursor": cursor, "object": object, "event": kind, "attributes": attributes})
            })
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_decoded_values(
            values in prop::collection::vec(arb_delta(), 1..6),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..24),
        ) {
            let mut payload = Vec::new();
            for value in &values {
                payload.extend_from_slice(b"\n");
                payload.extend_from_slice(&serde_json::to_vec(value).expect("serialize"));
            }
            payload.extend_from_slice(b"\n");

            let mut whole = JsonDecoder::new();
            let expected = decode_all(&mut whole, &payload);
            prop_assert_eq!(&expected, &values);

            let mut boundaries: Vec<usize> = cuts.iter().map(|idx| idx.index(payload.len())).collect();
            boundaries.push(0);
            boundaries.push(payload.len());
            boundaries.sort_unstable();
            boundaries.dedup();

            let mut chunked = JsonDecoder::new();
            let mut actual = Vec::new();
            for window in boundaries.windows(2) {
                actual.extend(decode_all(&mut chunked, &payload[window[0]..window[1]]));
            }
            prop_assert_eq!(actual, expected);
            prop_assert_eq!(chunked.buffered(), 0);
        }

        #[test]
        fn corrupt_value_is_reported_before_later_values_decode(
            values in prop::collection::vec(arb_delta(), 2..6),
            corrupt in any::<prop::sample::Index>(),
            junk in prop::sample::select(vec![b'x', b']', b',', b':', b'@', b'1']),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..24),
        ) {
            let corrupt = corrupt.index(values.len());
            let mut payload = Vec::new();
            let mut corrupt_at = 0;
            for (idx, value) in values.iter().enumerate() {
                payload.extend_from_slice(b"\n");
                let mut bytes = serde_json::to_vec(value).expect("serialize");
                if idx == corrupt {
                    corrupt_at = payload.len() as u64;
                    // Directly after `{` only a key or `}` may follow.
                    bytes.insert(1, junk);
                }
                payload.extend_from_slice(&bytes);
            }
            payload.extend_from_slice(b"\n");

            let mut boundaries: Vec<usize> = cuts.iter().map(|idx| idx.index(payload.len())).collect();
            boundaries.push(0);
            boundaries.push(payload.len());
            boundaries.sort_unstable();
            boundaries.dedup();

            let mut decoder = JsonDecoder::new();
            let mut decoded = Vec::new();
            let mut first_error = None;
            'feed: for window in boundaries.windows(2) {
                for item in decoder.feed(&payload[window[0]..window[1]]) {
                    match item {
                        Ok(value) => decoded.push(value),
                        Err(err) => {
                            first_error = Some(err);
                            break 'feed;
                        }
                    }
                }
            }

            let error = first_error.expect("corrupt value must be reported");
            prop_assert_eq!(error.offset, corrupt_at);
            prop_assert_eq!(&decoded[..], &values[..corrupt]);
        }
    }
}
