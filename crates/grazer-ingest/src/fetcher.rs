// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Object retrieval with bounded retries.
//!
//! Notifications can arrive before the object is readable, and a stream can
//! fail halfway through. Opening and reading are therefore retried on their
//! own schedules:
//!
//! - open: up to `retries` further attempts, `get_pause` apart
//! - read: up to `retries` further attempts, `stream_pause` apart, each one
//!   preceded by a fresh open since the old stream may be stale. A failed
//!   re-open ends the fetch at once.
//!
//! Running out of attempts yields [`FetchError::ObjectUnavailable`]; callers
//! must terminate the run so the trigger gets redelivered.

use std::sync::Arc;
use std::time::Duration;

use grazer_delivery::{Level, SessionRecorder};
use thiserror::Error;
use tokio::time::sleep;

use crate::invocation::ObjectHandle;
use crate::store::{ObjectBody, ObjectStore, StoreError};

pub const FETCH_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{message}")]
    ObjectUnavailable {
        container: String,
        key: String,
        message: String,
        #[source]
        source: StoreError,
    },
}

/// Receives the progress lines a fetch produces.
pub trait RetryReporter {
    fn retrying(&mut self, message: &str);
    fn giving_up(&mut self, message: &str);
}

impl RetryReporter for SessionRecorder {
    fn retrying(&mut self, message: &str) {
        self.send(message, Level::Warning);
    }

    fn giving_up(&mut self, message: &str) {
        self.send(message, Level::Critical);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub get_pause: Duration,
    pub stream_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: FETCH_RETRIES,
            get_pause: Duration::from_secs(10),
            stream_pause: Duration::from_secs(5),
        }
    }
}

pub struct ObjectFetcher {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl ObjectFetcher {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        ObjectFetcher { store, policy }
    }

    /// Returns the full (still compressed) content of the object.
    pub async fn fetch<R>(
        &self,
        handle: &ObjectHandle,
        reporter: &mut R,
    ) -> Result<Vec<u8>, FetchError>
    where
        R: RetryReporter + Send + ?Sized,
    {
        let mut body = self.open(handle, reporter).await?;
        let mut attempt = 0;
        loop {
            match body.read_to_end().await {
                Ok(bytes) => return Ok(bytes),
                Err(_) if attempt < self.policy.retries => {
                    attempt += 1;
                    reporter.retrying(&format!(
                        "Attempt to Stream Data Failed, Attempt Number:{attempt}"
                    ));
                    sleep(self.policy.stream_pause).await;
                    body = match self.store.get(&handle.container, &handle.key).await {
                        Ok(body) => body,
                        Err(source) => {
                            let message = format!(
                                "Can't Get Object Stream Attempt, Obj: {} From BUCKET:{}",
                                handle.key, handle.container
                            );
                            return Err(give_up(reporter, handle, message, source));
                        }
                    };
                }
                Err(source) => {
                    let message = format!(
                        "Retries:{} exhausted.  Can't Stream Obj: {} From BUCKET:{}",
                        self.policy.retries, handle.key, handle.container
                    );
                    return Err(give_up(reporter, handle, message, source));
                }
            }
        }
    }

    async fn open<R>(
        &self,
        handle: &ObjectHandle,
        reporter: &mut R,
    ) -> Result<Box<dyn ObjectBody>, FetchError>
    where
        R: RetryReporter + Send + ?Sized,
    {
        let mut attempt = 0;
        loop {
            match self.store.get(&handle.container, &handle.key).await {
                Ok(body) => return Ok(body),
                Err(_) if attempt < self.policy.retries => {
                    attempt += 1;
                    sleep(self.policy.get_pause).await;
                    reporter.retrying(&format!("Get Object Warning Retry A Attempt:{attempt}"));
                }
                Err(source) => {
                    let message = format!(
                        "Retries:{} exhausted.  Can't Get Object:{} From BUCKET:{}",
                        self.policy.retries, handle.key, handle.container
                    );
                    return Err(give_up(reporter, handle, message, source));
                }
            }
        }
    }
}

fn give_up<R>(
    reporter: &mut R,
    handle: &ObjectHandle,
    message: String,
    source: StoreError,
) -> FetchError
where
    R: RetryReporter + ?Sized,
{
    reporter.giving_up(&message);
    FetchError::ObjectUnavailable {
        container: handle.container.clone(),
        key: handle.key.clone(),
        message,
        source,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::ObjectSummary;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `get_failures` opens and the first `read_failures` reads.
    #[derive(Default)]
    struct ScriptedStore {
        get_failures: u32,
        read_failures: u32,
        gets: AtomicU32,
        reads: Arc<AtomicU32>,
    }

    struct ScriptedBody {
        fail: bool,
    }

    #[async_trait]
    impl ObjectBody for ScriptedBody {
        async fn read_to_end(self: Box<Self>) -> Result<Vec<u8>, StoreError> {
            if self.fail {
                return Err(StoreError::Stream("connection reset".to_string()));
            }
            Ok(b"payload".to_vec())
        }
    }

    #[async_trait]
    impl ObjectStore for ScriptedStore {
        async fn get(&self, container: &str, key: &str) -> Result<Box<dyn ObjectBody>, StoreError> {
            if self.gets.fetch_add(1, Ordering::SeqCst) < self.get_failures {
                return Err(StoreError::NotFound {
                    container: container.to_string(),
                    key: key.to_string(),
                });
            }
            let fail = self.reads.fetch_add(1, Ordering::SeqCst) < self.read_failures;
            Ok(Box::new(ScriptedBody { fail }))
        }

        async fn delete(&self, _container: &str, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn list(
            &self,
            _container: &str,
            _prefix: &str,
        ) -> Result<Vec<ObjectSummary>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct Lines {
        warnings: Vec<String>,
        fatal: Vec<String>,
    }

    impl RetryReporter for Lines {
        fn retrying(&mut self, message: &str) {
            self.warnings.push(message.to_string());
        }

        fn giving_up(&mut self, message: &str) {
            self.fatal.push(message.to_string());
        }
    }

    fn handle() -> ObjectHandle {
        ObjectHandle {
            container: "trail-bucket".to_string(),
            key: "AWSLogs/trail.json.gz".to_string(),
            size: None,
        }
    }

    fn fetcher(store: Arc<ScriptedStore>) -> ObjectFetcher {
        ObjectFetcher::new(
            store,
            RetryPolicy {
                get_pause: Duration::ZERO,
                stream_pause: Duration::ZERO,
                ..RetryPolicy::default()
            },
        )
    }

    #[tokio::test]
    async fn open_succeeds_on_third_attempt() {
        let store = Arc::new(ScriptedStore {
            get_failures: 2,
            ..ScriptedStore::default()
        });
        let mut lines = Lines::default();

        let bytes = fetcher(store.clone()).fetch(&handle(), &mut lines).await.unwrap();

        assert_eq!(bytes, b"payload");
        assert_eq!(store.gets.load(Ordering::SeqCst), 3);
        assert_eq!(
            lines.warnings,
            vec![
                "Get Object Warning Retry A Attempt:1",
                "Get Object Warning Retry A Attempt:2"
            ]
        );
        assert!(lines.fatal.is_empty());
    }

    #[tokio::test]
    async fn open_gives_up_after_three_retries() {
        let store = Arc::new(ScriptedStore {
            get_failures: 4,
            ..ScriptedStore::default()
        });
        let mut lines = Lines::default();

        let err = fetcher(store.clone()).fetch(&handle(), &mut lines).await.unwrap_err();

        assert_eq!(store.gets.load(Ordering::SeqCst), 4);
        assert_eq!(lines.warnings.len(), 3);
        assert_eq!(
            lines.fatal,
            vec!["Retries:3 exhausted.  Can't Get Object:AWSLogs/trail.json.gz From BUCKET:trail-bucket"]
        );
        assert!(matches!(
            err,
            FetchError::ObjectUnavailable {
                source: StoreError::NotFound { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stream_failure_reopens_the_object() {
        let store = Arc::new(ScriptedStore {
            read_failures: 2,
            ..ScriptedStore::default()
        });
        let mut lines = Lines::default();

        let bytes = fetcher(store.clone()).fetch(&handle(), &mut lines).await.unwrap();

        assert_eq!(bytes, b"payload");
        assert_eq!(store.gets.load(Ordering::SeqCst), 3);
        assert_eq!(lines.warnings.len(), 2);
        assert_eq!(lines.warnings[1], "Attempt to Stream Data Failed, Attempt Number:2");
    }

    #[tokio::test]
    async fn stream_gives_up_after_three_retries() {
        let store = Arc::new(ScriptedStore {
            read_failures: 4,
            ..ScriptedStore::default()
        });
        let mut lines = Lines::default();

        let err = fetcher(store.clone()).fetch(&handle(), &mut lines).await.unwrap_err();

        assert_eq!(store.reads.load(Ordering::SeqCst), 4);
        assert_eq!(lines.warnings.len(), 3);
        assert!(err.to_string().starts_with("Retries:3 exhausted.  Can't Stream Obj:"));
    }

    #[tokio::test]
    async fn failed_reopen_is_fatal_at_once() {
        // First open succeeds with a broken stream, every later open fails.
        struct ReopenFails {
            gets: AtomicU32,
        }

        #[async_trait]
        impl ObjectStore for ReopenFails {
            async fn get(&self, _c: &str, _k: &str) -> Result<Box<dyn ObjectBody>, StoreError> {
                if self.gets.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Ok(Box::new(ScriptedBody { fail: true }));
                }
                Err(StoreError::Request("throttled".to_string()))
            }

            async fn delete(&self, _c: &str, _k: &str) -> Result<(), StoreError> {
                Ok(())
            }

            async fn list(&self, _c: &str, _p: &str) -> Result<Vec<ObjectSummary>, StoreError> {
                Ok(Vec::new())
            }
        }

        let store = Arc::new(ReopenFails {
            gets: AtomicU32::new(0),
        });
        let fetcher = ObjectFetcher::new(
            store.clone(),
            RetryPolicy {
                get_pause: Duration::ZERO,
                stream_pause: Duration::ZERO,
                ..RetryPolicy::default()
            },
        );
        let mut lines = Lines::default();

        let err = fetcher.fetch(&handle(), &mut lines).await.unwrap_err();

        assert_eq!(store.gets.load(Ordering::SeqCst), 2);
        assert_eq!(lines.warnings.len(), 1);
        assert!(err.to_string().starts_with("Can't Get Object Stream Attempt"));
    }
}
