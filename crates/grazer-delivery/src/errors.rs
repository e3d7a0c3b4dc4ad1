// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery outcomes and the session-wide failure aggregate.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use tracing::error;

use crate::constants::NO_VALUE;

/// Result of handing one payload to a [`crate::sink::DeliverySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(DeliveryFailure),
}

/// What the collector (or the transport) said when a payload was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliveryFailure {
    /// Transport error text, or the HTTP status line.
    pub reason: String,
    /// `text` field of the collector's JSON response, or the raw body.
    pub text: Option<String>,
    /// `code` field of the collector's JSON response.
    pub code: Option<i64>,
}

#[derive(Deserialize)]
struct CollectorResponse {
    text: Option<String>,
    code: Option<i64>,
}

impl DeliveryFailure {
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        DeliveryFailure {
            reason: reason.into(),
            text: None,
            code: None,
        }
    }

    /// Builds a failure from a non-success response, picking `text`/`code`
    /// out of the body when it is the collector's JSON error document.
    #[must_use]
    pub fn from_response(reason: impl Into<String>, body: &str) -> Self {
        let (text, code) = match serde_json::from_str::<CollectorResponse>(body) {
            Ok(resp) => (resp.text, resp.code),
            Err(_) if body.is_empty() => (None, None),
            Err(_) => (Some(body.to_string()), None),
        };
        DeliveryFailure {
            reason: reason.into(),
            text,
            code,
        }
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code.map(|c| c.to_string());
        write!(
            f,
            "TEXT:{} CODE:{} REASON:{}",
            self.text.as_deref().unwrap_or(NO_VALUE),
            code.as_deref().unwrap_or(NO_VALUE),
            self.reason
        )
    }
}

#[derive(Debug, Default)]
struct AggregatedError {
    count: u64,
    last: Option<DeliveryFailure>,
}

/// Failure count and last reason, shared by every delivery worker.
///
/// Both fields change together under one lock. The count never decreases;
/// a fresh aggregator comes only with a fresh session.
#[derive(Debug, Clone, Default)]
pub struct ErrorAggregator {
    inner: Arc<Mutex<AggregatedError>>,
}

impl ErrorAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AggregatedError> {
        // A worker that panicked mid-update cannot leave the pair inconsistent.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn record(&self, failure: DeliveryFailure) {
        let mut guard = self.lock();
        error!("Delivery failed: {failure}");
        guard.count += 1;
        guard.last = Some(failure);
    }

    /// Records the outcome if it is a failure.
    pub fn observe(&self, outcome: DeliveryOutcome) {
        if let DeliveryOutcome::Failed(failure) = outcome {
            self.record(failure);
        }
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.lock().count > 0
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.lock().count
    }

    /// Human readable form of the latest failure, if any was recorded.
    #[must_use]
    pub fn summary(&self) -> Option<String> {
        let guard = self.lock();
        if guard.count == 0 {
            return None;
        }
        guard.last.as_ref().map(ToString::to_string)
    }
}
