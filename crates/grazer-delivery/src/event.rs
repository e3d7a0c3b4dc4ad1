// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event model and the rules that turn a payload into its wire form.
//!
//! Callers hand the session either a plain text line or a structured event.
//! The distinction is made once, at the boundary, through [`Payload`]; the
//! [`EventFormatter`] then validates and serializes it into the JSON document
//! the collector expects:
//!
//! ```json
//! {"sourcetype":"aws:cloudtrail","source":"s3://bucket/key","time":1700000000,"host":"hec.example.com","event":{...}}
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::error;

use crate::constants::{FIELD_EVENT, FIELD_HOST, FIELD_SOURCE, FIELD_SOURCE_TYPE, FIELD_TIME};

/// Severity of a session log line.
///
/// Rendered by its numeric value, so `Severity=20` denotes an informational line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    Debug = 10,
    #[default]
    Info = 20,
    Warning = 30,
    Error = 40,
    Critical = 50,
}

impl Level {
    #[must_use]
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// A record reduced to the fields the collector indexes on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub sourcetype: String,
    pub source: String,
    /// Epoch seconds taken from the record itself.
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// The original record, unmodified.
    pub event: Value,
}

/// Input to the batching entry points.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A free-form line, rendered through the session's message prefix.
    TextLine(String),
    /// An event mapping that must carry `source` and `sourcetype`.
    StructuredEvent(Map<String, Value>),
}

impl From<&str> for Payload {
    fn from(line: &str) -> Self {
        Payload::TextLine(line.to_string())
    }
}

impl From<String> for Payload {
    fn from(line: String) -> Self {
        Payload::TextLine(line)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(event: Map<String, Value>) -> Self {
        Payload::StructuredEvent(event)
    }
}

impl From<NormalizedEvent> for Payload {
    fn from(event: NormalizedEvent) -> Self {
        let mut map = Map::new();
        map.insert(FIELD_SOURCE_TYPE.to_string(), Value::String(event.sourcetype));
        map.insert(FIELD_SOURCE.to_string(), Value::String(event.source));
        map.insert(FIELD_TIME.to_string(), Value::from(event.time));
        if let Some(host) = event.host {
            map.insert(FIELD_HOST.to_string(), Value::String(host));
        }
        map.insert(FIELD_EVENT.to_string(), event.event);
        Payload::StructuredEvent(map)
    }
}

/// Why a payload was kept out of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    EmptyLine,
    EmptyEvent,
    MissingSource,
    MissingSourceType,
    Unserializable,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Rejection::EmptyLine => "EMPTY STRING MESSAGE SENT",
            Rejection::EmptyEvent => "EMPTY DICTIONARY MESSAGE SENT",
            Rejection::MissingSource => "No SOURCE found in INPUT",
            Rejection::MissingSourceType => "No SOURCETYPE found in INPUT",
            Rejection::Unserializable => "PAYLOAD COULD NOT BE SERIALIZED",
        };
        f.write_str(text)
    }
}

/// Session-scoped defaults used to render and validate payloads.
#[derive(Debug, Clone)]
pub struct EventFormatter {
    /// Host stamped on events that do not carry one.
    pub host: String,
    /// `source` of the session's own text lines (the function identity).
    pub source: String,
    /// `sourcetype` of the session's own text lines.
    pub source_type: String,
    pub request_id: String,
    /// Template with `{time_ms}`, `{request_id}`, `{severity}` and `{msg}` placeholders.
    pub message_prefix: String,
}

impl EventFormatter {
    /// Renders `msg` through the message prefix template.
    #[must_use]
    pub fn format_line(&self, msg: &str, level: Level) -> String {
        self.message_prefix
            .replace("{time_ms}", &epoch_millis().to_string())
            .replace("{request_id}", &self.request_id)
            .replace("{severity}", &level.to_string())
            .replace("{msg}", msg)
    }

    /// Wraps an already rendered line in the collector envelope.
    #[must_use]
    pub fn package(&self, message: &str) -> String {
        let mut envelope = Map::new();
        envelope.insert(
            FIELD_SOURCE_TYPE.to_string(),
            Value::String(self.source_type.clone()),
        );
        envelope.insert(FIELD_SOURCE.to_string(), Value::String(self.source.clone()));
        envelope.insert(
            FIELD_TIME.to_string(),
            Value::String(epoch_micros().to_string()),
        );
        envelope.insert(FIELD_HOST.to_string(), Value::String(self.host.clone()));
        envelope.insert(FIELD_EVENT.to_string(), Value::String(message.to_string()));
        Value::Object(envelope).to_string()
    }

    /// Validates a payload and returns its serialized form.
    ///
    /// Structured events get `host` and `time` filled from the session when
    /// absent, then must carry both `source` and `sourcetype`.
    pub fn serialize(&self, payload: Payload, level: Level) -> Result<String, Rejection> {
        match payload {
            Payload::TextLine(line) => {
                if line.is_empty() {
                    return Err(Rejection::EmptyLine);
                }
                Ok(self.package(&self.format_line(&line, level)))
            }
            Payload::StructuredEvent(mut event) => {
                if event.is_empty() {
                    return Err(Rejection::EmptyEvent);
                }
                if !event.contains_key(FIELD_HOST) {
                    event.insert(FIELD_HOST.to_string(), Value::String(self.host.clone()));
                }
                if !event.contains_key(FIELD_TIME) {
                    event.insert(
                        FIELD_TIME.to_string(),
                        Value::String(epoch_millis().to_string()),
                    );
                }
                if !event.contains_key(FIELD_SOURCE) {
                    return Err(Rejection::MissingSource);
                }
                if !event.contains_key(FIELD_SOURCE_TYPE) {
                    return Err(Rejection::MissingSourceType);
                }
                serde_json::to_string(&event).map_err(|e| {
                    error!("Failed to serialize event: {e}");
                    Rejection::Unserializable
                })
            }
        }
    }
}

#[must_use]
pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

fn epoch_micros() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or_default()
}
