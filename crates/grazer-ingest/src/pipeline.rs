// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One invocation, end to end: classify the trigger, pick the objects, then
//! fetch, decode and batch each one and remove it once its events are in.
//!
//! The run stops early as soon as the session reports a delivery failure.
//! Objects are removed only after every batch carrying their events has been
//! handled without a recorded failure.

use std::sync::Arc;

use chrono::Utc;
use grazer_delivery::pool::worker_count_for_size;
use grazer_delivery::{DeliverySink, Level, SessionContext, SessionRecorder};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::decoder::{DecodeError, RecordDecoder};
use crate::fetcher::{FetchError, ObjectFetcher, RetryPolicy};
use crate::invocation::{
    classify, stale_keys, Invocation, InvocationError, ObjectHandle, SIZE_NOT_APPLICABLE,
};
use crate::store::{ObjectStore, StoreError};

/// How the process should end after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The trigger should be delivered again.
    Retryable,
    /// The trigger should not be retried.
    Failure,
}

impl Termination {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Termination::Retryable => 75,
            Termination::Failure => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not decode {source_name}: {error}")]
    Decode {
        source_name: String,
        #[source]
        error: DecodeError,
    },
    #[error("could not list {container}/{prefix}: {error}")]
    Listing {
        container: String,
        prefix: String,
        #[source]
        error: StoreError,
    },
}

impl PipelineError {
    #[must_use]
    pub fn termination(&self) -> Termination {
        match self {
            PipelineError::Fetch(_) | PipelineError::Listing { .. } => Termination::Retryable,
            PipelineError::Invocation(_) | PipelineError::Decode { .. } => Termination::Failure,
        }
    }
}

/// What a completed run reports back to the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub objects: usize,
    pub events: usize,
    pub deleted: usize,
    pub error: Option<String>,
}

struct RunPlan {
    container: String,
    keys: Vec<String>,
    size: Option<u64>,
    workers: usize,
    size_label: String,
}

struct ObjectOutcome {
    events: usize,
    deleted: bool,
}

pub struct Pipeline {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    sink: Option<Arc<dyn DeliverySink>>,
    retry: RetryPolicy,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: Arc<Config>, store: Arc<dyn ObjectStore>) -> Self {
        let retry = RetryPolicy {
            get_pause: config.retry_sleep,
            stream_pause: config.stream_retry_sleep(),
            ..RetryPolicy::default()
        };
        Pipeline {
            config,
            store,
            sink: None,
            retry,
        }
    }

    /// Delivers through `sink` instead of a collector client built from the
    /// configuration.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(
        &self,
        payload: &Value,
        context: SessionContext,
    ) -> Result<RunSummary, PipelineError> {
        let invocation = classify(payload).inspect_err(|e| error!("{e}"))?;
        let plan = self.plan(&invocation).await?;

        let mut session = self.open_session(context, plan.workers).await;
        session.start();
        session.send(format!("Called via:{}", invocation.trigger()), Level::Info);
        session.send(
            format!(
                "Number of threads Requested:{} Size:{}",
                plan.workers, plan.size_label
            ),
            Level::Info,
        );

        let fetcher = ObjectFetcher::new(Arc::clone(&self.store), self.retry);
        let decoder = RecordDecoder::new(self.config.source_type.clone());
        let mut summary = RunSummary::default();

        for key in plan.keys {
            let handle = ObjectHandle {
                container: plan.container.clone(),
                key,
                size: plan.size,
            };
            let outcome = match self.process(&fetcher, &decoder, &handle, &mut session).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    session.kill().await;
                    return Err(e);
                }
            };
            summary.objects += 1;
            summary.events += outcome.events;
            summary.deleted += usize::from(outcome.deleted);

            if session.has_error() {
                let reason = session.error_message().unwrap_or_default();
                let line = format!("Not Fully Processed Obj:{} Reason:{reason}", handle.source());
                error!("{line}");
                session.send(line, Level::Critical);
                break;
            }
        }

        summary.error = session.kill().await.error;
        info!(
            "Run finished: objects={} events={} deleted={} error={}",
            summary.objects,
            summary.events,
            summary.deleted,
            summary.error.as_deref().unwrap_or("none")
        );
        Ok(summary)
    }

    async fn plan(&self, invocation: &Invocation) -> Result<RunPlan, PipelineError> {
        match invocation {
            Invocation::ObjectCreated(handle) => Ok(RunPlan {
                container: handle.container.clone(),
                keys: vec![handle.key.clone()],
                size: handle.size,
                workers: worker_count_for_size(handle.size.unwrap_or_default()),
                size_label: handle
                    .size
                    .map_or_else(|| SIZE_NOT_APPLICABLE.to_string(), |size| size.to_string()),
            }),
            Invocation::Sweep { .. } => {
                let container = &self.config.s3_bucket;
                let prefix = &self.config.s3_prefix;
                let objects = self.store.list(container, prefix).await.map_err(|error| {
                    PipelineError::Listing {
                        container: container.clone(),
                        prefix: prefix.clone(),
                        error,
                    }
                })?;
                let keys = stale_keys(&objects, Utc::now(), self.config.minutes_to_process);
                debug!("Sweep selected {} of {} objects", keys.len(), objects.len());
                Ok(RunPlan {
                    container: container.clone(),
                    keys,
                    size: None,
                    workers: self.config.batch_thread_size,
                    size_label: SIZE_NOT_APPLICABLE.to_string(),
                })
            }
        }
    }

    async fn open_session(&self, context: SessionContext, workers: usize) -> SessionRecorder {
        let config = self.config.session_config(workers);
        match &self.sink {
            Some(sink) => SessionRecorder::with_sink(context, config, Arc::clone(sink)).await,
            None => SessionRecorder::new(context, config).await,
        }
    }

    async fn process(
        &self,
        fetcher: &ObjectFetcher,
        decoder: &RecordDecoder,
        handle: &ObjectHandle,
        session: &mut SessionRecorder,
    ) -> Result<ObjectOutcome, PipelineError> {
        let source = handle.source();
        session.send(format!("Processing Obj: {source}"), Level::Info);

        let compressed = fetcher.fetch(handle, session).await?;
        let events = decoder.decode(&compressed, &source).map_err(|error| {
            session.send(
                format!("Can't Decode Obj: {source} Reason:{error}"),
                Level::Critical,
            );
            PipelineError::Decode {
                source_name: source.clone(),
                error,
            }
        })?;

        let mut processed = 0;
        for event in events {
            session.batch(event, Level::Info);
            processed += 1;
            if session.has_error() {
                report_error_reason(session);
                return Ok(ObjectOutcome {
                    events: processed,
                    deleted: false,
                });
            }
        }
        session.send(format!("Events processed: {processed}"), Level::Info);

        if !session.settle().await {
            error!("Delivery workers exited before Obj: {source} was fully delivered");
        }
        if session.has_error() {
            report_error_reason(session);
            return Ok(ObjectOutcome {
                events: processed,
                deleted: false,
            });
        }

        let deleted = match self.store.delete(&handle.container, &handle.key).await {
            Ok(()) => {
                session.send(format!("Removed Obj: {source}"), Level::Info);
                true
            }
            Err(e) => {
                debug!("Delete of {source} failed: {e}");
                session.send(format!("Unable to Remove Obj:{source}"), Level::Error);
                false
            }
        };
        Ok(ObjectOutcome {
            events: processed,
            deleted,
        })
    }
}

fn report_error_reason(session: &mut SessionRecorder) {
    if let Some(reason) = session.error_message() {
        let line = format!("Error Reason:{reason}");
        error!("{line}");
        session.send(line, Level::Error);
    }
}
