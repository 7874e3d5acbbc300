//! Normalization of raw broker messages into the envelopes broadcast to downstream clients.
//! `normalize` never fails: payloads that are not UTF-8 JSON are carried as text and flagged.

use crate::utils::epoch_millis;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// One serialized message ready for a downstream socket. Cloning shares the underlying buffer.
pub type Frame = Utf8Bytes;

/// A message as delivered by the broker transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Telemetry,
    Flipper,
    Unknown,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Telemetry => "telemetry",
            Kind::Flipper => "flipper",
            Kind::Unknown => "unknown",
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message payload: parsed JSON when the bytes were valid UTF-8 JSON, the decoded text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Json(Value),
    Raw(String),
}

impl Payload {
    /// Decodes broker bytes. Invalid UTF-8 is replaced lossily and never parsed as JSON.
    pub fn decode(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => Payload::Json(value),
                Err(_) => Payload::Raw(text.to_string()),
            },
            Err(_) => Payload::Raw(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, Payload::Json(_))
    }
}

/// First matching topic prefix wins.
const CLASSIFICATION: [(&str, Kind); 2] = [("classroom", Kind::Telemetry), ("flipper", Kind::Flipper)];

/// Classifies a topic by its first `/`-separated segment.
/// A topic without any separator has no first segment to match and is `Unknown`.
pub fn classify(topic: &str) -> Kind {
    let Some((first, _)) = topic.split_once('/') else {
        return Kind::Unknown;
    };
    CLASSIFICATION
        .iter()
        .find(|(segment, _)| *segment == first)
        .map(|(_, kind)| *kind)
        .unwrap_or(Kind::Unknown)
}

/// Normalizes a broker message, stamping it with the current time.
pub fn normalize(topic: &str, payload: &[u8]) -> Envelope {
    normalize_at(topic, payload, epoch_millis())
}

pub fn normalize_at(topic: &str, payload: &[u8], ts: i64) -> Envelope {
    Envelope {
        kind: classify(topic),
        topic: topic.to_string(),
        payload: Payload::decode(payload),
        ts,
    }
}

/// Normalized broker message. Immutable once built; broadcast as a single shared frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    kind: Kind,
    topic: String,
    payload: Payload,
    ts: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeWire<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    kind: Kind,
    topic: &'a str,
    payload: &'a Payload,
    payload_is_json: bool,
    ts: i64,
}

impl Envelope {
    pub const MESSAGE_TYPE: &'static str = "mqtt";

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_is_json(&self) -> bool {
        self.payload.is_json()
    }

    pub fn timestamp(&self) -> i64 {
        self.ts
    }

    pub fn to_frame(&self) -> serde_json::Result<Frame> {
        let wire = EnvelopeWire {
            message_type: Self::MESSAGE_TYPE,
            kind: self.kind,
            topic: &self.topic,
            payload: &self.payload,
            payload_is_json: self.payload.is_json(),
            ts: self.ts,
        };
        serde_json::to_string(&wire).map(Frame::from)
    }

    /// One-line description for the per-message log.
    /// Telemetry: `<device-id> <temperature>`; everything else: the topic.
    pub fn summary(&self) -> Cow<'_, str> {
        match self.kind {
            Kind::Telemetry => {
                let device_id = self
                    .topic
                    .split('/')
                    .nth(1)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("?");
                let reading = self.temperature().unwrap_or_default();
                Cow::Owned(format!("{} {}", device_id, reading))
            }
            Kind::Flipper | Kind::Unknown => Cow::Borrowed(&self.topic),
        }
    }

    fn temperature(&self) -> Option<String> {
        let Payload::Json(Value::Object(fields)) = &self.payload else {
            return None;
        };
        ["temperature", "temp", "t"]
            .iter()
            .filter_map(|key| fields.get(*key))
            .find(|value| !value.is_null())
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }
}

/// One-shot message sent to a newly accepted downstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting<'a> {
    pub ts: i64,
    pub topics: &'a [String],
}

#[derive(Serialize)]
struct GreetingWire<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    ts: i64,
    topics: &'a [String],
}

impl<'a> Greeting<'a> {
    pub const MESSAGE_TYPE: &'static str = "hello";

    pub fn new(topics: &'a [String]) -> Self {
        Self {
            ts: epoch_millis(),
            topics,
        }
    }

    pub fn to_frame(&self) -> serde_json::Result<Frame> {
        let wire = GreetingWire {
            message_type: Self::MESSAGE_TYPE,
            ts: self.ts,
            topics: self.topics,
        };
        serde_json::to_string(&wire).map(Frame::from)
    }
}
