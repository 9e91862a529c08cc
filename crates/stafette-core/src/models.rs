//! Outbox event model and strongly-typed identifiers.
//!
//! Defines the persisted event record, its status lifecycle, and newtype
//! wrappers with database serialization traits. Status transitions are
//! strictly controlled: `pending -> sent` and `pending -> failed` are the
//! only forward edges; replay may move `failed` back to `pending`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed outbox event identifier.
///
/// Wraps the `BIGSERIAL` primary key assigned on insert. Identifiers are
/// monotonic per database and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Outbox event lifecycle status.
///
/// ```text
/// pending -> sent                      (publish succeeded, terminal)
/// pending -> pending (retry scheduled) (publish failed, below ceiling)
/// pending -> failed                    (retry ceiling reached, terminal)
/// failed  -> pending                   (operator replay)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for the dispatcher to publish it.
    Pending,

    /// Published to the broker. Terminal.
    Sent,

    /// Publish retries exhausted. Terminal until replayed.
    Failed,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid event status: {s}").into()),
        }
    }
}

/// A durable outbox event row.
///
/// Created inside the producer's business transaction and owned by the
/// outbox store afterwards. Only the dispatcher and the replay service
/// mutate `status`, `retry_count`, and `next_retry_at`; rows are never
/// deleted by the backbone (retention is an external concern).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    /// Unique identifier assigned on insert.
    pub id: EventId,

    /// Logical category of the source entity (e.g. "email", "task").
    pub aggregate_type: String,

    /// Identifier of the source entity, when one exists.
    pub aggregate_id: Option<i64>,

    /// Topic used by the broker to select bound queues.
    pub routing_key: String,

    /// Opaque JSON message body, fanned out verbatim.
    pub payload: serde_json::Value,

    /// Current lifecycle status.
    pub status: EventStatus,

    /// Number of publish attempts that failed.
    pub retry_count: i32,

    /// Earliest time a pending event may be re-attempted.
    ///
    /// Consulted only while `status` is pending; terminal rows ignore it.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// When the event was appended.
    pub created_at: DateTime<Utc>,

    /// When the store last touched the row.
    pub updated_at: DateTime<Utc>,
}

/// Parameters for appending a new outbox event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Logical category of the source entity.
    pub aggregate_type: String,

    /// Identifier of the source entity, when one exists.
    pub aggregate_id: Option<i64>,

    /// Topic the broker will route on.
    pub routing_key: String,

    /// JSON message body.
    pub payload: serde_json::Value,
}

impl NewEvent {
    /// Creates an event append request, serializing the payload.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::InvalidInput`] if the payload cannot be
    /// serialized to JSON.
    pub fn new<P: Serialize>(
        aggregate_type: impl Into<String>,
        aggregate_id: Option<i64>,
        routing_key: impl Into<String>,
        payload: &P,
    ) -> crate::Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| crate::CoreError::InvalidInput(format!("unserializable payload: {e}")))?;

        Ok(Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            routing_key: routing_key.into(),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_database_representation() {
        assert_eq!(EventStatus::Pending.to_string(), "pending");
        assert_eq!(EventStatus::Sent.to_string(), "sent");
        assert_eq!(EventStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let json = serde_json::to_string(&EventStatus::Pending).unwrap();
        assert_eq!(json, r#""pending""#);

        let back: EventStatus = serde_json::from_str(r#""failed""#).unwrap();
        assert_eq!(back, EventStatus::Failed);
    }

    #[test]
    fn new_event_serializes_payload() {
        #[derive(Serialize)]
        struct Payload {
            email_id: i64,
        }

        let event =
            NewEvent::new("email", Some(42), "email.received", &Payload { email_id: 42 }).unwrap();

        assert_eq!(event.aggregate_type, "email");
        assert_eq!(event.aggregate_id, Some(42));
        assert_eq!(event.payload["email_id"], 42);
    }

    #[test]
    fn event_ids_order_by_insert_sequence() {
        assert!(EventId(1) < EventId(2));
        assert_eq!(EventId::from(7).to_string(), "7");
    }
}
