// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-bounded batching of serialized events.
//!
//! The batcher is owned by the single producer of a session. Events are
//! appended to the open batch until the next one would push the batch past
//! `max_bytes`; the open batch is then closed and handed to a
//! [`BatchSubmitter`], and a new batch starts with the event that did not fit.
//!
//! ```text
//!   add(e1) add(e2) add(e3)          add(e4) ...
//!   [e1 e2 e3]  --- e4 would overflow --->  submit([e1 e2 e3]); [e4]
//! ```
//!
//! An event larger than `max_bytes` on its own is never dropped; it closes the
//! open batch (if any) and travels alone.

use tracing::{debug, error};

use crate::constants::{BATCH_SEPARATOR, MAX_BATCH_BYTES};
use crate::event::{EventFormatter, Level, Payload};

/// An ordered group of serialized events, closed and immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch {
    events: Vec<String>,
    bytes: usize,
}

impl Batch {
    #[must_use]
    pub fn single(event: String) -> Self {
        let bytes = event.len();
        Batch {
            events: vec![event],
            bytes,
        }
    }

    fn push(&mut self, event: String) {
        self.bytes += event.len();
        self.events.push(event);
    }

    #[must_use]
    pub fn events(&self) -> &[String] {
        &self.events
    }

    /// Sum of the serialized lengths of the events, separators excluded.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The collector payload: every event joined by [`BATCH_SEPARATOR`].
    #[must_use]
    pub fn payload(&self) -> String {
        self.events.join(BATCH_SEPARATOR)
    }
}

/// Receives closed batches.
pub trait BatchSubmitter: Send {
    fn submit(&self, batch: Batch);
}

pub struct EventBatcher<S: BatchSubmitter> {
    formatter: EventFormatter,
    submitter: S,
    max_bytes: usize,
    current: Batch,
    rejected: u64,
}

impl<S: BatchSubmitter> EventBatcher<S> {
    #[must_use]
    pub fn new(formatter: EventFormatter, submitter: S) -> Self {
        Self::with_max_bytes(formatter, submitter, MAX_BATCH_BYTES)
    }

    #[must_use]
    pub fn with_max_bytes(formatter: EventFormatter, submitter: S, max_bytes: usize) -> Self {
        EventBatcher {
            formatter,
            submitter,
            max_bytes,
            current: Batch::default(),
            rejected: 0,
        }
    }

    /// Validates and appends an event to the open batch.
    ///
    /// Returns `false` when the payload was rejected; the rejection is logged
    /// and the event skipped.
    pub fn add(&mut self, payload: Payload, level: Level) -> bool {
        let Some(event) = self.admit(payload, level) else {
            return false;
        };

        if self.current.bytes + event.len() > self.max_bytes && !self.current.is_empty() {
            self.close_current();
        }
        self.current.push(event);
        true
    }

    /// Submits a payload as a batch of its own, leaving the open batch alone.
    pub fn dispatch(&mut self, payload: Payload, level: Level) -> bool {
        let Some(event) = self.admit(payload, level) else {
            return false;
        };
        self.submitter.submit(Batch::single(event));
        true
    }

    /// Wraps an already rendered line in the envelope and submits it alone.
    pub(crate) fn submit_line(&mut self, line: &str) {
        let event = self.formatter.package(line);
        self.submitter.submit(Batch::single(event));
    }

    /// Closes and submits the open batch. Does nothing when it is empty.
    pub fn flush(&mut self) {
        if !self.current.is_empty() {
            self.close_current();
        }
    }

    /// Number of payloads rejected by validation so far.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Bytes held by the open batch.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.current.bytes
    }

    fn admit(&mut self, payload: Payload, level: Level) -> Option<String> {
        match self.formatter.serialize(payload, level) {
            Ok(event) => Some(event),
            Err(rejection) => {
                self.rejected += 1;
                error!("{rejection}");
                None
            }
        }
    }

    fn close_current(&mut self) {
        let batch = std::mem::take(&mut self.current);
        debug!(
            "Submitting batch of {} events ({} bytes)",
            batch.len(),
            batch.bytes()
        );
        self.submitter.submit(batch);
    }
}
