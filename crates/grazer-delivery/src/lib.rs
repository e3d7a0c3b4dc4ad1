// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Grazer delivery
//!
//! Size-bounded batching of log events and their delivery to an HTTP event
//! collector through a fixed pool of worker threads.
//!
//! - [`event`]: payload model, validation and the collector envelope
//! - [`batcher`]: byte-bounded grouping of serialized events
//! - [`pool`]: delivery workers and the quiesce sequence
//! - [`sink`]: the HTTP collector client
//! - [`errors`]: per-session failure aggregation
//! - [`session`]: start/stop markers and destination selection for one run

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batcher;
pub mod constants;
pub mod errors;
pub mod event;
pub mod pool;
pub mod session;
pub mod sink;

pub use errors::{DeliveryFailure, DeliveryOutcome, ErrorAggregator};
pub use event::{Level, NormalizedEvent, Payload};
pub use session::{
    Destination, SessionConfig, SessionContext, SessionRecorder, SessionState, SessionSummary,
};
pub use sink::{DeliverySink, HecSink};
