// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process;
use std::sync::Arc;

use grazer_delivery::SessionContext;
use grazer_ingest::config::log_level_from_env;
use grazer_ingest::{Config, Pipeline, RunSummary, S3Store};
use lambda_runtime::{service_fn, Context, Error as LambdaError, LambdaEvent};
use serde_json::Value;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const FALLBACK_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() {
    init_logging(&log_level_from_env());
    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Process terminated: {e}");
            process::exit(1);
        }
    };
    info!(
        "Configuration loaded, delivering to {} at level {}",
        config.destination, config.log_level
    );

    let store = Arc::new(S3Store::from_env().await);
    let pipeline = Arc::new(Pipeline::new(config, store));

    let handler = service_fn(move |event: LambdaEvent<Value>| {
        let pipeline = Arc::clone(&pipeline);
        async move { handle(&pipeline, event).await }
    });
    if let Err(e) = lambda_runtime::run(handler).await {
        error!("Lambda runtime stopped: {e}");
        process::exit(1);
    }
}

async fn handle(pipeline: &Pipeline, event: LambdaEvent<Value>) -> Result<RunSummary, LambdaError> {
    let (payload, context) = event.into_parts();
    match pipeline.run(&payload, session_context(&context)).await {
        Ok(summary) => Ok(summary),
        Err(e) => {
            // The session has already been stopped; ending the process is what
            // tells the dispatcher whether to deliver the trigger again.
            let termination = e.termination();
            error!("Invocation {} failed ({termination:?}): {e}", context.request_id);
            process::exit(termination.exit_code());
        }
    }
}

fn session_context(context: &Context) -> SessionContext {
    SessionContext {
        request_id: context.request_id.clone(),
        function_arn: context.invoked_function_arn.clone(),
        function_version: context.env_config.version.clone(),
        memory_limit_mb: u32::try_from(context.env_config.memory).unwrap_or_default(),
        log_stream: context.env_config.log_stream.clone(),
        deadline_ms: context.deadline,
    }
}

fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{log_level}"))
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("h2=off,hyper=off,rustls=off,{FALLBACK_LOG_LEVEL}"))
        });

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        debug!("Logging subsystem enabled");
    }
}
