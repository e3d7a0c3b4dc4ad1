// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use grazer_delivery::constants::{DEFAULT_WORKER_COUNT, DELIVERY_TIMEOUT, MAX_BATCH_BYTES};
use grazer_delivery::{Destination, SessionConfig};
use thiserror::Error;
use tracing::{error, warn};

pub const ENV_S3_BUCKET: &str = "GRAZER_S3_BUCKET";
pub const ENV_S3_PREFIX: &str = "GRAZER_S3_PREFIX";
pub const ENV_SOURCE_TYPE: &str = "GRAZER_SOURCE_TYPE";
pub const ENV_HEC_ENDPOINT: &str = "GRAZER_HEC_ENDPOINT";
pub const ENV_HEC_TOKEN: &str = "GRAZER_HEC_TOKEN";

const REQUIRED: [&str; 5] = [
    ENV_S3_BUCKET,
    ENV_S3_PREFIX,
    ENV_SOURCE_TYPE,
    ENV_HEC_ENDPOINT,
    ENV_HEC_TOKEN,
];

const DEFAULT_MINUTES_TO_PROCESS: u64 = 15;
const DEFAULT_RETRY_SLEEP_SECS: u64 = 10;
const DEFAULT_DEBUG_SOURCE_TYPE: &str = "splunk:Lambda";
const DEFAULT_MESSAGE_PREFIX: &str =
    "Time_ms={time_ms} RequestId={request_id} Severity={severity} Msg:{msg}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Mandatory parameters {0:?} do not exist")]
    Missing(Vec<&'static str>),
    #[error("Mandatory parameter values for the keys {0:?} are blank")]
    Blank(Vec<&'static str>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub s3_bucket: String,
    pub s3_prefix: String,
    /// `sourcetype` stamped on decoded records.
    pub source_type: String,
    pub hec_endpoint: String,
    pub hec_token: String,
    /// Sweep runs pick objects older than this many minutes.
    pub minutes_to_process: u64,
    /// Worker count for sweep runs.
    pub batch_thread_size: usize,
    /// Pause between object retrieval attempts. Stream retries wait half of it.
    pub retry_sleep: Duration,
    pub destination: Destination,
    pub message_prefix: String,
    pub debug: bool,
    pub debug_source_type: String,
    pub hec_timeout: Duration,
    pub hec_verify_tls: bool,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut blank = Vec::new();
        for key in REQUIRED {
            match lookup(key) {
                None => missing.push(key),
                Some(value) if value.trim().is_empty() => blank.push(key),
                Some(_) => {}
            }
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        if !blank.is_empty() {
            return Err(ConfigError::Blank(blank));
        }
        let required = |key: &str| lookup(key).unwrap_or_default().trim().to_string();

        let debug = debug_flag(&lookup);
        let destination = match lookup("GRAZER_LOG_DESTINATION") {
            None => Destination::Local,
            Some(value) => value.parse().unwrap_or_else(|e| {
                error!("{e} Sent, reverting to CLOUDWATCH");
                Destination::Local
            }),
        };
        let log_level = resolve_log_level(lookup("GRAZER_LOG_LEVEL"), debug);

        Ok(Config {
            s3_bucket: required(ENV_S3_BUCKET),
            s3_prefix: required(ENV_S3_PREFIX),
            source_type: required(ENV_SOURCE_TYPE),
            hec_endpoint: required(ENV_HEC_ENDPOINT),
            hec_token: required(ENV_HEC_TOKEN),
            minutes_to_process: parse_or(
                "GRAZER_MINUTES_TO_PROCESS",
                lookup("GRAZER_MINUTES_TO_PROCESS"),
                DEFAULT_MINUTES_TO_PROCESS,
                u64::from_str,
            ),
            batch_thread_size: parse_or(
                "GRAZER_BATCH_THREAD_SIZE",
                lookup("GRAZER_BATCH_THREAD_SIZE"),
                DEFAULT_WORKER_COUNT,
                parse_worker_count,
            ),
            retry_sleep: Duration::from_secs(parse_or(
                "GRAZER_RETRY_SLEEP_SECS",
                lookup("GRAZER_RETRY_SLEEP_SECS"),
                DEFAULT_RETRY_SLEEP_SECS,
                u64::from_str,
            )),
            destination,
            message_prefix: lookup("GRAZER_LOG_MESSAGE_PREFIX")
                .filter(|prefix| !prefix.is_empty())
                .unwrap_or_else(|| DEFAULT_MESSAGE_PREFIX.to_string()),
            debug,
            debug_source_type: lookup("GRAZER_DEBUG_SOURCE_TYPE")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DEBUG_SOURCE_TYPE.to_string()),
            hec_timeout: Duration::from_secs(parse_or(
                "GRAZER_HEC_TIMEOUT_SECS",
                lookup("GRAZER_HEC_TIMEOUT_SECS"),
                DELIVERY_TIMEOUT.as_secs(),
                u64::from_str,
            )),
            hec_verify_tls: parse_or(
                "GRAZER_HEC_VERIFY_TLS",
                lookup("GRAZER_HEC_VERIFY_TLS"),
                true,
                parse_bool,
            ),
            log_level,
        })
    }

    /// Delivery settings for one session running `workers` delivery workers.
    #[must_use]
    pub fn session_config(&self, workers: usize) -> SessionConfig {
        SessionConfig {
            destination: self.destination,
            hec_endpoint: self.hec_endpoint.clone(),
            hec_token: self.hec_token.clone(),
            debug_source_type: self.debug_source_type.clone(),
            message_prefix: self.message_prefix.clone(),
            max_batch_bytes: MAX_BATCH_BYTES,
            workers,
            delivery_timeout: self.hec_timeout,
            verify_tls: self.hec_verify_tls,
            debug: self.debug,
        }
    }

    /// Pause between stream read attempts.
    #[must_use]
    pub fn stream_retry_sleep(&self) -> Duration {
        self.retry_sleep / 2
    }
}

/// Log level requested by the environment, readable before the rest of the
/// configuration so that loading diagnostics reach the subscriber.
#[must_use]
pub fn log_level_from_env() -> String {
    log_level_from_lookup(&|key: &str| env::var(key).ok())
}

fn log_level_from_lookup<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    resolve_log_level(lookup("GRAZER_LOG_LEVEL"), debug_flag(lookup))
}

fn resolve_log_level(level: Option<String>, debug: bool) -> String {
    match level.filter(|level| !level.trim().is_empty()) {
        Some(level) => level.trim().to_lowercase(),
        None if debug => "debug".to_string(),
        None => "info".to_string(),
    }
}

fn debug_flag<F>(lookup: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    parse_or("GRAZER_DEBUG", lookup("GRAZER_DEBUG"), false, parse_bool)
}

fn parse_worker_count(value: &str) -> Result<usize, String> {
    match usize::from_str(value) {
        Ok(0) => Err("at least one worker is needed".to_string()),
        Ok(workers) => Ok(workers),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(format!("not a boolean: {other}")),
    }
}

fn parse_or<T, E, P>(key: &str, value: Option<String>, default: T, parse: P) -> T
where
    T: Display,
    E: Display,
    P: Fn(&str) -> Result<T, E>,
{
    let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
        return default;
    };
    match parse(value.trim()) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Ignoring {key}={value} ({e}), using {default}");
            default
        }
    }
}
