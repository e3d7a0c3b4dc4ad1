// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::Read;

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use grazer_delivery::NormalizedEvent;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const EVENT_TIME_FIELD: &str = "eventTime";
pub const EVENT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("object is not valid gzip: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("object is not a record document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("record {index} has no eventTime")]
    MissingTimestamp { index: usize },
    #[error("record {index} has unreadable eventTime {value:?}: {source}")]
    BadTimestamp {
        index: usize,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[derive(Deserialize)]
struct RecordDocument {
    #[serde(rename = "Records")]
    records: Vec<Value>,
}

/// Turns a gzip-compressed `{"Records": [...]}` document into events.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    source_type: String,
}

impl RecordDecoder {
    #[must_use]
    pub fn new(source_type: impl Into<String>) -> Self {
        RecordDecoder {
            source_type: source_type.into(),
        }
    }

    /// Decodes every record of the object. `source` is the object's logical
    /// path and becomes each event's `source`.
    pub fn decode(
        &self,
        compressed: &[u8],
        source: &str,
    ) -> Result<Vec<NormalizedEvent>, DecodeError> {
        let mut json = Vec::new();
        GzDecoder::new(compressed).read_to_end(&mut json)?;
        let document: RecordDocument = serde_json::from_slice(&json)?;

        document
            .records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                Ok(NormalizedEvent {
                    sourcetype: self.source_type.clone(),
                    source: source.to_string(),
                    time: event_time(index, &record)?,
                    host: None,
                    event: record,
                })
            })
            .collect()
    }
}

/// Epoch seconds of the record's `eventTime`, read as UTC.
fn event_time(index: usize, record: &Value) -> Result<i64, DecodeError> {
    let value = record
        .get(EVENT_TIME_FIELD)
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingTimestamp { index })?;
    NaiveDateTime::parse_from_str(value, EVENT_TIME_FORMAT)
        .map(|time| time.and_utc().timestamp())
        .map_err(|source| DecodeError::BadTimestamp {
            index,
            value: value.to_string(),
            source,
        })
}
