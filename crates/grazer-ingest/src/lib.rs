// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retrieval and decoding of compressed audit-log objects, and the pipeline
//! that feeds their records into a delivery session.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod decoder;
pub mod fetcher;
pub mod invocation;
pub mod pipeline;
pub mod store;

pub use config::{Config, ConfigError};
pub use pipeline::{Pipeline, PipelineError, RunSummary, Termination};
pub use store::{ObjectStore, S3Store};
