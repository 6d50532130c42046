use std::error::Error as StdError;

use chrono::{DateTime, TimeZone, Utc};
use lapin::types::{AMQPValue, FieldTable, LongInt, ShortInt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HeaderDecodeError;

/// Terminal disposition a worker applies to a delivery once the middleware
/// chain has run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Ack,
    Nack,
    NackRequeue,
    Reject,
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::Ack
    }
}

impl MessageStatus {
    /// Equivalent to the original Go source's `ReQueueMessage` helper:
    /// nacks the delivery back onto the queue instead of discarding it.
    pub fn nack_with_requeue() -> Self {
        MessageStatus::NackRequeue
    }
}

/// The `{"entityId": ..., "data": ...}` envelope carried as the AMQP body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "entityId")]
    pub entity_id: String,
    pub data: Value,
}

/// AMQP header fields translated to and from the broker's headers table.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub timestamp: DateTime<Utc>,
    pub publisher: String,
    pub event_name: String,
    pub trace_id: String,
    pub user_id: String,
    pub x_retry_count: i16,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            publisher: String::new(),
            event_name: String::new(),
            trace_id: String::new(),
            user_id: String::new(),
            x_retry_count: 0,
        }
    }
}

/// Looks up `pascal` first, falling back to `camel` — the two header-key
/// spellings producers in the wild have emitted over time.
fn lookup_field_str(headers: &FieldTable, pascal: &str, camel: &str) -> String {
    let value = headers
        .inner()
        .get(pascal)
        .or_else(|| headers.inner().get(camel));
    match value {
        Some(AMQPValue::LongString(s)) => s.to_string(),
        Some(AMQPValue::ShortString(s)) => s.to_string(),
        Some(other) => format!("{:?}", other),
        None => String::new(),
    }
}

fn lookup_timestamp(headers: &FieldTable) -> Result<DateTime<Utc>, HeaderDecodeError> {
    let value = headers
        .inner()
        .get("Timestamp")
        .or_else(|| headers.inner().get("timestamp"))
        .ok_or(HeaderDecodeError::MissingTimestamp)?;

    let seconds: i64 = match value {
        AMQPValue::LongLongInt(n) => *n,
        AMQPValue::LongInt(n) => *n as i64,
        AMQPValue::Timestamp(n) => *n as i64,
        AMQPValue::ShortString(s) => s
            .as_str()
            .parse()
            .map_err(|_| HeaderDecodeError::InvalidTimestamp(s.to_string()))?,
        AMQPValue::LongString(s) => s
            .as_str()
            .parse()
            .map_err(|_| HeaderDecodeError::InvalidTimestamp(s.to_string()))?,
        other => return Err(HeaderDecodeError::InvalidTimestamp(format!("{:?}", other))),
    };

    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| HeaderDecodeError::InvalidTimestamp(seconds.to_string()))
}

fn lookup_retry_count(headers: &FieldTable) -> i16 {
    match headers.inner().get("xRetryCount") {
        Some(AMQPValue::ShortInt(n)) => *n as i16,
        Some(AMQPValue::LongInt(n)) => (*n).clamp(i16::MIN as LongInt, i16::MAX as LongInt) as i16,
        Some(AMQPValue::LongUInt(n)) => (*n).min(i16::MAX as u32) as i16,
        _ => 0,
    }
}

impl Header {
    /// Decode from the broker's headers table. Accepts both PascalCase and
    /// camelCase spellings for `publisher`/`eventName`/`traceId`/`userId`,
    /// and either `Timestamp` or `timestamp`. `xRetryCount` defaults to 0
    /// when absent.
    pub fn from_field_table(headers: &FieldTable) -> Result<Self, HeaderDecodeError> {
        Ok(Header {
            timestamp: lookup_timestamp(headers)?,
            publisher: lookup_field_str(headers, "Publisher", "publisher"),
            event_name: lookup_field_str(headers, "EventName", "eventName"),
            trace_id: lookup_field_str(headers, "TraceId", "traceId"),
            user_id: lookup_field_str(headers, "UserId", "userId"),
            x_retry_count: lookup_retry_count(headers),
        })
    }

    /// Encode to the camelCase-keyed headers table producers emit onto the
    /// wire. `timestamp` is seconds-precision unix time, `xRetryCount` a
    /// 16-bit integer.
    pub fn to_field_table(&self) -> FieldTable {
        let mut table = FieldTable::default();
        table.insert(
            "timestamp".into(),
            AMQPValue::LongLongInt(self.timestamp.timestamp()),
        );
        table.insert(
            "publisher".into(),
            AMQPValue::LongString(self.publisher.clone().into()),
        );
        table.insert(
            "eventName".into(),
            AMQPValue::LongString(self.event_name.clone().into()),
        );
        table.insert(
            "traceId".into(),
            AMQPValue::LongString(self.trace_id.clone().into()),
        );
        table.insert(
            "userId".into(),
            AMQPValue::LongString(self.user_id.clone().into()),
        );
        table.insert(
            "xRetryCount".into(),
            AMQPValue::ShortInt(self.x_retry_count as ShortInt),
        );
        table
    }
}

/// The unit carried end-to-end: one broker delivery, decoded once and
/// consumed by exactly one worker.
pub struct Message {
    pub id: String,
    pub exchange: String,
    pub routing_key: String,
    pub header: Header,
    pub payload: Payload,
    pub status: MessageStatus,
    pub error: Option<Box<dyn StdError + Send + Sync>>,
}

impl Message {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, payload: Payload) -> Self {
        Message {
            id: String::new(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            header: Header::default(),
            payload,
            status: MessageStatus::Ack,
            error: None,
        }
    }

    /// A message synthesised for a delivery whose body failed to parse as
    /// JSON. Acked rather than retried — an unparseable body will never
    /// become parseable on redelivery.
    pub fn invalid_json() -> Self {
        Message {
            id: String::new(),
            exchange: String::new(),
            routing_key: String::new(),
            header: Header::default(),
            payload: Payload {
                entity_id: String::new(),
                data: Value::Null,
            },
            status: MessageStatus::Ack,
            error: Some(Box::new(crate::error::InvalidJson)),
        }
    }

    /// Validates the fields the producer requires before publishing:
    /// a non-empty routing key and non-null payload data. Mirrors the
    /// original Go `validator.v9` tags on `Message`/`Payload`.
    pub fn validate(&self) -> Result<(), String> {
        if self.routing_key.is_empty() {
            return Err("routing key is required".to_string());
        }
        if self.payload.data.is_null() {
            return Err("payload data is required".to_string());
        }
        Ok(())
    }
}
