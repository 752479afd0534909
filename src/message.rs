//! # Messages
//!
//! The stored row for one message plus the producer-side request type.
//!
//! Rows are JSON with epoch-millisecond timestamps because the store scripts
//! rewrite `deliver_cnt`, `re_deliver_at` and `deliver_at` in place. Redis' Lua
//! cjson encodes an empty array as `{}`, so the payload decoder accepts both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// A message as handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(deserialize_with = "payload_bytes")]
    pub payload: Vec<u8>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_at: DateTime<Utc>,
    /// Scheduled first visibility; `None` means immediate.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub deliver_at: Option<DateTime<Utc>>,
    /// Set by the store every time a worker takes the message.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub re_deliver_at: Option<DateTime<Utc>>,
    /// Times the message has been handed to a handler.
    #[serde(default)]
    pub deliver_cnt: u64,
}

impl Message {
    /// Build a fresh row from a producer request.
    pub fn from_producer(msg: ProducerMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            payload: msg.payload,
            create_at: now,
            deliver_at: msg.deliver_at,
            re_deliver_at: None,
            deliver_cnt: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| QueueError::DecodeFailed(e.to_string()))
    }

    /// The instant the current delivery became due: the last take, else the
    /// scheduled time, else creation.
    pub fn due_reference(&self) -> DateTime<Utc> {
        self.re_deliver_at
            .or(self.deliver_at)
            .unwrap_or(self.create_at)
    }

    /// Delivery latency relative to `now`, clamped at zero.
    pub fn delivery_latency(&self, now: DateTime<Utc>) -> Duration {
        (now - self.due_reference()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the message should go straight to the consumable queue.
    pub fn is_immediate(&self, now: DateTime<Utc>) -> bool {
        self.deliver_at.map_or(true, |at| at <= now)
    }
}

/// Producer request: payload and optional scheduled delivery time.
#[derive(Debug, Clone, Default)]
pub struct ProducerMessage {
    pub payload: Vec<u8>,
    pub deliver_at: Option<DateTime<Utc>>,
}

impl ProducerMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            deliver_at: None,
        }
    }

    pub fn deliver_at(mut self, at: DateTime<Utc>) -> Self {
        self.deliver_at = Some(at);
        self
    }

    /// Schedule `delay` from now. Delays past the representable range
    /// saturate to the latest representable time.
    pub fn deliver_after(self, delay: Duration) -> Self {
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.deliver_at(at)
    }
}

fn payload_bytes<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PayloadVisitor;

    impl<'de> serde::de::Visitor<'de> for PayloadVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte array")
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: serde::de::SeqAccess<'de>,
        {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                bytes.push(b);
            }
            Ok(bytes)
        }

        // cjson round trip of an empty array
        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'de>,
        {
            if map
                .next_entry::<serde::de::IgnoredAny, serde::de::IgnoredAny>()?
                .is_some()
            {
                return Err(serde::de::Error::custom("payload map must be empty"));
            }
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_any(PayloadVisitor)
}
