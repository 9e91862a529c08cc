//! Trace identifiers and their propagation across the bus.
//!
//! Producers stamp payloads with a 16-byte trace id; the dispatcher copies
//! it into message headers so consumers and their logs correlate with the
//! originating request. A W3C `traceparent` value is synthesised from the
//! same id for interop with tracing backends (exporter wiring is the
//! embedding service's concern).

use std::fmt;

use uuid::Uuid;

/// Header carrying the hex trace identifier.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Header carrying the consumer-level retry count.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Header carrying the original error string on dead-lettered messages.
pub const ORIGINAL_ERROR_HEADER: &str = "x-original-error";

/// Header naming the pipeline stage that dead-lettered the message.
pub const FAILED_STAGE_HEADER: &str = "x-failed-at";

/// W3C trace-context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// A 16-byte trace identifier, carried as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// Generates a fresh random trace id.
    pub fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Parses a 32-character hex string.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }

        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = hex_nibble(chunk[0])?;
            let lo = hex_nibble(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Some(Self(bytes))
    }

    /// Formats a W3C `traceparent` value with a fresh span id.
    pub fn traceparent(&self) -> String {
        let span_id = Uuid::new_v4();
        let span = &span_id.as_bytes()[..8];
        format!("00-{}-{}-01", self, hex(span))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Extracts a non-empty `trace_id` string from a JSON payload.
///
/// Payloads are opaque to the dispatcher except for this one field; a
/// missing or malformed value simply means no correlation.
pub fn from_payload(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("trace_id")
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_round_trips_through_hex() {
        let id = TraceId::generate();
        let parsed = TraceId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(TraceId::parse("abc").is_none());
        assert!(TraceId::parse(&"g".repeat(32)).is_none());
    }

    #[test]
    fn traceparent_has_w3c_shape() {
        let id = TraceId::parse("0af7651916cd43dd8448eb211c80319c").unwrap();
        let header = id.traceparent();

        let parts: Vec<&str> = header.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "00");
        assert_eq!(parts[1], "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(parts[2].len(), 16);
        assert_eq!(parts[3], "01");
    }

    #[test]
    fn payload_extraction_ignores_empty_and_missing() {
        let with = serde_json::json!({"email_id": 1, "trace_id": "abc"});
        assert_eq!(from_payload(&with).as_deref(), Some("abc"));

        let empty = serde_json::json!({"trace_id": ""});
        assert!(from_payload(&empty).is_none());

        let missing = serde_json::json!({"email_id": 1});
        assert!(from_payload(&missing).is_none());

        let wrong_type = serde_json::json!({"trace_id": 17});
        assert!(from_payload(&wrong_type).is_none());
    }
}
