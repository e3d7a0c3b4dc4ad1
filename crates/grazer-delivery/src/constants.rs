// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits and wire constants shared by the batching and delivery path.

use std::time::Duration;

/// Maximum cumulative serialized size of one batch, in bytes.
///
/// A single event larger than this is still delivered, alone in its batch.
pub const MAX_BATCH_BYTES: usize = 100_000;

/// Client-side timeout of one collector request. A timeout is recorded as a
/// delivery failure like any other transport error.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts made to start each worker thread before giving up on it.
pub const WORKER_START_ATTEMPTS: u32 = 3;

/// Pause between worker start attempts.
pub const WORKER_START_PAUSE: Duration = Duration::from_secs(2);

/// Separator placed between serialized events in one collector payload.
pub const BATCH_SEPARATOR: &str = " ";

/// Worker count used when the triggering object size is unknown.
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Upper bounds (inclusive, bytes) of the object size steps used to size the
/// delivery pool, paired with the worker count for that step.
pub const WORKER_SIZE_STEPS: [(u64, usize); 4] = [
    (10_500, 3),
    (253_474, 5),
    (528_241, 7),
    (1_086_698, 9),
];

/// Worker count for objects larger than the last size step.
pub const MAX_WORKER_COUNT: usize = 11;

pub const FIELD_SOURCE_TYPE: &str = "sourcetype";
pub const FIELD_SOURCE: &str = "source";
pub const FIELD_TIME: &str = "time";
pub const FIELD_EVENT: &str = "event";
pub const FIELD_HOST: &str = "host";

/// Placeholder used in failure summaries when the collector gave no value.
pub const NO_VALUE: &str = "NO_VALUE";
