// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One pipeline run's view of the delivery path.
//!
//! A [`SessionRecorder`] picks its destination once, at construction: the
//! batched collector path (event batcher feeding a delivery pool) or the local
//! log. If the collector path cannot be built the session stays local for its
//! whole lifetime and keeps the construction failure in its error aggregate.
//!
//! ```text
//!   Created ──start()──> Started ──send()/batch()*──> ... ──kill()──> Stopped
//! ```
//!
//! `kill()` always flushes the open batch, emits the stop marker and quiesces
//! the pool, whatever the reason for stopping.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::batcher::EventBatcher;
use crate::constants::{DEFAULT_WORKER_COUNT, DELIVERY_TIMEOUT, MAX_BATCH_BYTES};
use crate::errors::{DeliveryFailure, ErrorAggregator};
use crate::event::{epoch_millis, EventFormatter, Level, Payload};
use crate::pool::{DeliveryPool, PoolConfig, PoolHandle, WORKERS_EXITED_REASON};
use crate::sink::{collector_host, DeliverySink, HecSink};

/// Where a session's traffic goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Destination {
    /// Batched delivery to the HTTP event collector.
    Collector,
    /// The local leveled log only.
    Local,
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SPLUNK" | "HEC" | "COLLECTOR" => Ok(Destination::Collector),
            "CLOUDWATCH" | "LOCAL" => Ok(Destination::Local),
            other => Err(format!("INVALID DESTINATION:{other}")),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Collector => f.write_str("SPLUNK"),
            Destination::Local => f.write_str("CLOUDWATCH"),
        }
    }
}

/// Delivery settings a session runs with. Each session owns its own copy.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub destination: Destination,
    pub hec_endpoint: String,
    pub hec_token: String,
    pub debug_source_type: String,
    pub message_prefix: String,
    pub max_batch_bytes: usize,
    pub workers: usize,
    pub delivery_timeout: Duration,
    pub verify_tls: bool,
    pub debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            destination: Destination::Local,
            hec_endpoint: String::new(),
            hec_token: String::new(),
            debug_source_type: "splunk:Lambda".to_string(),
            message_prefix: "Time_ms={time_ms} RequestId={request_id} Severity={severity} Msg:{msg}"
                .to_string(),
            max_batch_bytes: MAX_BATCH_BYTES,
            workers: DEFAULT_WORKER_COUNT,
            delivery_timeout: DELIVERY_TIMEOUT,
            verify_tls: true,
            debug: false,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_workers(&self, workers: usize) -> Self {
        SessionConfig {
            workers,
            ..self.clone()
        }
    }
}

/// Identity and time budget of the invocation a session serves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub request_id: String,
    pub function_arn: String,
    pub function_version: String,
    pub memory_limit_mb: u32,
    pub log_stream: String,
    /// Invocation deadline, epoch milliseconds.
    pub deadline_ms: u64,
}

impl SessionContext {
    #[must_use]
    pub fn remaining_time_ms(&self) -> u64 {
        let now = u64::try_from(epoch_millis()).unwrap_or(u64::MAX);
        self.deadline_ms.saturating_sub(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Stopped,
}

/// What a session reports once stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub destination: Destination,
    pub elapsed_ms: u128,
    pub failures: u64,
    pub rejected: u64,
    pub error: Option<String>,
}

enum Route {
    Local,
    Collector {
        batcher: EventBatcher<PoolHandle>,
        pool: DeliveryPool,
    },
}

pub struct SessionRecorder {
    context: SessionContext,
    config: SessionConfig,
    formatter: EventFormatter,
    route: Route,
    errors: ErrorAggregator,
    started_ms: u128,
    state: SessionState,
    rejected: u64,
}

impl SessionRecorder {
    /// Builds a session, constructing the collector client when the
    /// configuration asks for collector delivery.
    pub async fn new(context: SessionContext, config: SessionConfig) -> Self {
        if config.destination == Destination::Local {
            return Self::build(context, config, None, None).await;
        }
        let client = HecSink::new(
            &config.hec_endpoint,
            &config.hec_token,
            config.delivery_timeout,
            config.verify_tls,
        );
        match client {
            Ok(sink) => {
                let sink: Arc<dyn DeliverySink> = Arc::new(sink.with_verbose(config.debug));
                Self::build(context, config, Some(sink), None).await
            }
            Err(e) => {
                error!("Could not create collector client, reason: {e}");
                Self::build(context, config, None, Some(e.to_string())).await
            }
        }
    }

    /// Builds a collector session around an existing sink.
    pub async fn with_sink(
        context: SessionContext,
        config: SessionConfig,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        let config = SessionConfig {
            destination: Destination::Collector,
            ..config
        };
        Self::build(context, config, Some(sink), None).await
    }

    async fn build(
        context: SessionContext,
        mut config: SessionConfig,
        sink: Option<Arc<dyn DeliverySink>>,
        construction_error: Option<String>,
    ) -> Self {
        let errors = ErrorAggregator::new();
        let host = collector_host(&config.hec_endpoint).unwrap_or_default();
        let formatter = EventFormatter {
            host,
            source: context.function_arn.clone(),
            source_type: config.debug_source_type.clone(),
            request_id: context.request_id.clone(),
            message_prefix: config.message_prefix.clone(),
        };

        if let Some(reason) = construction_error {
            errors.record(DeliveryFailure::transport(reason));
        }

        let route = match sink {
            None => Route::Local,
            Some(sink) => {
                let pool_config = PoolConfig {
                    workers: config.workers,
                    verbose: config.debug,
                    ..PoolConfig::default()
                };
                let pool = DeliveryPool::start(&pool_config, sink, errors.clone()).await;
                if pool.started() == 0 {
                    error!(
                        "Could not create delivery pool, reason: {}",
                        errors.summary().unwrap_or_default()
                    );
                    Route::Local
                } else {
                    let batcher = EventBatcher::with_max_bytes(
                        formatter.clone(),
                        pool.handle(),
                        config.max_batch_bytes,
                    );
                    Route::Collector { batcher, pool }
                }
            }
        };
        if matches!(route, Route::Local) {
            config.destination = Destination::Local;
        }

        SessionRecorder {
            context,
            config,
            formatter,
            route,
            errors,
            started_ms: epoch_millis(),
            state: SessionState::Created,
            rejected: 0,
        }
    }

    /// Emits the start marker. Only the first call has an effect.
    pub fn start(&mut self) {
        if self.state != SessionState::Created {
            return;
        }
        let marker = format!(
            "Time_ms={} START RequestId={} Severity={} Function={} Version={} Timeout={} MemoryLimit={} MB Stream={}",
            self.started_ms,
            self.context.request_id,
            Level::Info,
            self.context.function_arn,
            self.context.function_version,
            self.context.remaining_time_ms(),
            self.context.memory_limit_mb,
            self.context.log_stream,
        );
        self.emit_marker(&marker);
        self.state = SessionState::Started;
    }

    /// Delivers a payload on its own, right away.
    pub fn send(&mut self, payload: impl Into<Payload>, level: Level) -> bool {
        let payload = payload.into();
        let accepted = match &mut self.route {
            Route::Collector { batcher, .. } => batcher.dispatch(payload, level),
            Route::Local => write_local(&self.formatter, payload, level),
        };
        self.note(accepted)
    }

    /// Adds a payload to the open batch.
    pub fn batch(&mut self, payload: impl Into<Payload>, level: Level) -> bool {
        let payload = payload.into();
        let accepted = match &mut self.route {
            Route::Collector { batcher, .. } => batcher.add(payload, level),
            Route::Local => write_local(&self.formatter, payload, level),
        };
        self.note(accepted)
    }

    pub fn flush(&mut self) {
        if let Route::Collector { batcher, .. } = &mut self.route {
            batcher.flush();
        }
    }

    /// Flushes the open batch and waits until every batch submitted so far
    /// has been handled. Returns `false`, with a recorded failure, when the
    /// delivery workers died first.
    pub async fn settle(&mut self) -> bool {
        match &mut self.route {
            Route::Collector { batcher, pool } => {
                batcher.flush();
                let drained = pool.drain().await;
                if !drained {
                    self.errors
                        .record(DeliveryFailure::transport(WORKERS_EXITED_REASON));
                }
                drained
            }
            Route::Local => true,
        }
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.errors.has_error()
    }

    /// The latest aggregated failure as one line, logged locally when present.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        let message = self.errors.summary()?;
        error!("ERROR IN SENDING DATA {message}");
        Some(message)
    }

    #[must_use]
    pub fn destination(&self) -> Destination {
        self.config.destination
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Payloads rejected by validation during this session.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Flushes the open batch, emits the stop marker and quiesces the pool.
    pub async fn kill(mut self) -> SessionSummary {
        let elapsed_ms = epoch_millis().saturating_sub(self.started_ms);
        let marker = format!(
            "Time_ms={} STOP RequestId={} Severity={} RemainingTime={} RunTime={} ms",
            epoch_millis(),
            self.context.request_id,
            Level::Info,
            self.context.remaining_time_ms(),
            elapsed_ms,
        );

        match std::mem::replace(&mut self.route, Route::Local) {
            Route::Collector { mut batcher, pool } => {
                batcher.flush();
                batcher.submit_line(&marker);
                let workers = pool.quiesce().await;
                debug!("Session {} stopped {workers} workers", self.context.request_id);
            }
            Route::Local => info!("{marker}"),
        }
        self.state = SessionState::Stopped;

        SessionSummary {
            destination: self.config.destination,
            elapsed_ms,
            failures: self.errors.count(),
            rejected: self.rejected,
            error: self.errors.summary(),
        }
    }

    fn emit_marker(&mut self, marker: &str) {
        match &mut self.route {
            Route::Collector { batcher, .. } => batcher.submit_line(marker),
            Route::Local => info!("{marker}"),
        }
    }

    fn note(&mut self, accepted: bool) -> bool {
        if !accepted {
            self.rejected += 1;
        }
        accepted
    }
}

fn write_local(formatter: &EventFormatter, payload: Payload, level: Level) -> bool {
    let line = match payload {
        Payload::TextLine(line) if line.is_empty() => {
            error!("EMPTY STRING MESSAGE SENT");
            return false;
        }
        Payload::TextLine(line) => formatter.format_line(&line, level),
        structured @ Payload::StructuredEvent(_) => match formatter.serialize(structured, level) {
            Ok(event) => event,
            Err(rejection) => {
                error!("{rejection}");
                return false;
            }
        },
    };
    log_local(level, &line);
    true
}

fn log_local(level: Level, line: &str) {
    match level {
        Level::Debug => debug!("{line}"),
        Level::Info => info!("{line}"),
        Level::Warning => warn!("{line}"),
        Level::Error => error!("{line}"),
        Level::Critical => error!(severity = "CRITICAL", "{line}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::DeliveryOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingSink {
        payloads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn send(&self, payload: String) -> DeliveryOutcome {
            self.payloads.lock().unwrap().push(payload);
            DeliveryOutcome::Delivered
        }
    }

    struct FailingSink;

    #[async_trait]
    impl DeliverySink for FailingSink {
        async fn send(&self, _payload: String) -> DeliveryOutcome {
            DeliveryOutcome::Failed(DeliveryFailure::from_response(
                "HTTP 503 Service Unavailable",
                r#"{"text":"Server is busy","code":9}"#,
            ))
        }
    }

    struct GatedPanicSink {
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl DeliverySink for GatedPanicSink {
        async fn send(&self, _payload: String) -> DeliveryOutcome {
            let _permit = self.gate.acquire().await;
            panic!("collector client crashed");
        }
    }

    fn context() -> SessionContext {
        SessionContext {
            request_id: "req-42".to_string(),
            function_arn: "arn:aws:lambda:us-east-1:123456789012:function:grazer".to_string(),
            function_version: "$LATEST".to_string(),
            memory_limit_mb: 256,
            log_stream: "2026/10/19/[$LATEST]abc".to_string(),
            deadline_ms: 0,
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            hec_endpoint: "https://hec.example.com:8088/services/collector".to_string(),
            hec_token: "token".to_string(),
            workers: 2,
            ..SessionConfig::default()
        }
    }

    async fn collector_session(sink: Arc<dyn DeliverySink>) -> SessionRecorder {
        SessionRecorder::with_sink(context(), config(), sink).await
    }

    #[test]
    fn destination_parses_known_names() {
        assert_eq!("SPLUNK".parse(), Ok(Destination::Collector));
        assert_eq!("cloudwatch".parse(), Ok(Destination::Local));
        assert!("S3".parse::<Destination>().is_err());
    }

    #[test]
    fn with_workers_only_changes_worker_count() {
        let base = config();
        let sized = base.with_workers(9);
        assert_eq!(sized.workers, 9);
        assert_eq!(sized.hec_endpoint, base.hec_endpoint);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn collector_session_emits_markers_and_flushes_on_kill() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = collector_session(sink.clone()).await;
        assert_eq!(session.state(), SessionState::Created);

        session.start();
        assert!(session.batch("first", Level::Info));
        assert!(session.batch("second", Level::Info));
        let summary = session.kill().await;

        let payloads = sink.payloads.lock().unwrap().clone();
        assert_eq!(payloads.len(), 3);
        assert!(payloads.iter().any(|p| p.contains(" START RequestId=req-42")));
        assert!(payloads.iter().any(|p| p.contains(" STOP RequestId=req-42")));
        let batched = payloads.iter().find(|p| p.contains("first")).unwrap();
        assert!(batched.contains("second"));
        assert_eq!(summary.error, None);
        assert_eq!(summary.destination, Destination::Collector);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_sink_surfaces_reason_in_summary() {
        let mut session = collector_session(Arc::new(FailingSink)).await;
        session.start();
        session.batch("payload", Level::Info);
        let summary = session.kill().await;

        assert!(summary.failures >= 1);
        let reason = summary.error.unwrap();
        assert!(reason.contains("Server is busy"));
        assert!(reason.contains("HTTP 503"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn settle_surfaces_failures_before_kill() {
        let mut session = collector_session(Arc::new(FailingSink)).await;
        session.batch("payload", Level::Info);
        assert!(session.settle().await);
        assert!(session.has_error());
        assert_eq!(session.state(), SessionState::Created);
        session.kill().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn settle_records_failure_when_workers_are_lost() {
        let sink = Arc::new(GatedPanicSink {
            gate: tokio::sync::Semaphore::new(0),
        });
        let mut session =
            SessionRecorder::with_sink(context(), config().with_workers(1), sink.clone()).await;
        assert!(session.send("first", Level::Info));
        assert!(session.send("second", Level::Info));

        sink.gate.add_permits(1);
        assert!(!session.settle().await);
        assert!(session.has_error());
        assert!(session
            .error_message()
            .unwrap()
            .contains(WORKERS_EXITED_REASON));
        session.kill().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_payload_is_reported_as_false() {
        let mut session = collector_session(Arc::new(RecordingSink::default())).await;
        let event = serde_json::json!({"sourcetype": "t"}).as_object().unwrap().clone();
        assert!(!session.batch(event, Level::Info));
        assert!(!session.send("", Level::Info));
        assert_eq!(session.rejected(), 2);
        session.kill().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn local_session_writes_to_log() {
        let mut session = SessionRecorder::new(context(), SessionConfig::default()).await;
        assert_eq!(session.destination(), Destination::Local);

        session.start();
        assert!(session.send("hello there", Level::Warning));
        let summary = session.kill().await;

        assert!(logs_contain("START RequestId=req-42"));
        assert!(logs_contain("Severity=30 Msg:hello there"));
        assert!(logs_contain("STOP RequestId=req-42"));
        assert_eq!(summary.error, None);
    }

    #[tokio::test]
    async fn unusable_collector_demotes_to_local_and_keeps_error() {
        let config = SessionConfig {
            destination: Destination::Collector,
            hec_endpoint: "not a url".to_string(),
            ..config()
        };
        let mut session = SessionRecorder::new(context(), config).await;

        assert_eq!(session.destination(), Destination::Local);
        assert!(session.has_error());
        assert!(session.send("still logged locally", Level::Info));
        assert!(session.error_message().unwrap().contains("not a url"));
        session.kill().await;
    }
}
