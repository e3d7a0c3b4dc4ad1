// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Works out why the function was invoked and which objects the run covers.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::store::ObjectSummary;

/// Trigger label used for new-object notifications.
pub const OBJECT_CREATED_TRIGGER: &str = "s3 Put Trigger";
/// Size label used when a run was not triggered by a single object.
pub const SIZE_NOT_APPLICABLE: &str = "N/A";

const OBJECT_STORE_EVENT_SOURCE: &str = "aws:s3";
const SCHEDULER_SOURCE: &str = "aws.events";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvocationError {
    #[error("Unhandled Event")]
    Unhandled,
    #[error("malformed object notification: {0}")]
    Malformed(&'static str),
}

/// A stored object the run will fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHandle {
    pub container: String,
    pub key: String,
    pub size: Option<u64>,
}

impl ObjectHandle {
    /// Logical path used as the `source` of decoded records.
    #[must_use]
    pub fn source(&self) -> String {
        format!("s3://{}/{}", self.container, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    ObjectCreated(ObjectHandle),
    Sweep { detail_type: String },
}

impl Invocation {
    /// How the run reports its trigger.
    #[must_use]
    pub fn trigger(&self) -> &str {
        match self {
            Invocation::ObjectCreated(_) => OBJECT_CREATED_TRIGGER,
            Invocation::Sweep { detail_type } => detail_type,
        }
    }
}

pub fn classify(payload: &Value) -> Result<Invocation, InvocationError> {
    if let Some(record) = payload.pointer("/Records/0") {
        if record.get("eventSource").and_then(Value::as_str) == Some(OBJECT_STORE_EVENT_SOURCE) {
            return object_created(record);
        }
    }

    if let Some(detail_type) = payload.get("detail-type") {
        if payload.get("source").and_then(Value::as_str) == Some(SCHEDULER_SOURCE) {
            let detail_type = detail_type
                .as_str()
                .map_or_else(|| detail_type.to_string(), ToString::to_string);
            return Ok(Invocation::Sweep { detail_type });
        }
    }

    Err(InvocationError::Unhandled)
}

fn object_created(record: &Value) -> Result<Invocation, InvocationError> {
    let container = record
        .pointer("/s3/bucket/name")
        .and_then(Value::as_str)
        .ok_or(InvocationError::Malformed("missing bucket name"))?;
    let raw_key = record
        .pointer("/s3/object/key")
        .and_then(Value::as_str)
        .ok_or(InvocationError::Malformed("missing object key"))?;
    let size = record.pointer("/s3/object/size").and_then(Value::as_u64);

    Ok(Invocation::ObjectCreated(ObjectHandle {
        container: container.to_string(),
        key: decode_key(raw_key)?,
        size,
    }))
}

/// Keys in notifications are form-encoded: `+` is a space, the rest is
/// percent-encoded.
fn decode_key(raw: &str) -> Result<String, InvocationError> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|key| key.into_owned())
        .map_err(|_| InvocationError::Malformed("object key is not valid UTF-8"))
}

/// Keys of the objects that have sat in the store for strictly longer than
/// `minutes`, in listing order.
#[must_use]
pub fn stale_keys(objects: &[ObjectSummary], now: DateTime<Utc>, minutes: u64) -> Vec<String> {
    let threshold_ms = i64::try_from(minutes.saturating_mul(60_000)).unwrap_or(i64::MAX);
    objects
        .iter()
        .filter(|object| (now - object.last_modified).num_milliseconds() > threshold_ms)
        .map(|object| object.key.clone())
        .collect()
}
