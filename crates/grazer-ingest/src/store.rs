// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Object store collaborator.
//!
//! Retrieval is two-phase so callers can retry each phase on its own:
//! [`ObjectStore::get`] opens the object and [`ObjectBody::read_to_end`]
//! streams its content.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {container}/{key} not found")]
    NotFound { container: String, key: String },
    #[error("object store request failed: {0}")]
    Request(String),
    #[error("object body could not be read: {0}")]
    Stream(String),
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectBody: Send {
    async fn read_to_end(self: Box<Self>) -> Result<Vec<u8>, StoreError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, container: &str, key: &str) -> Result<Box<dyn ObjectBody>, StoreError>;

    async fn delete(&self, container: &str, key: &str) -> Result<(), StoreError>;

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<ObjectSummary>, StoreError>;
}

pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    #[must_use]
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        S3Store { client }
    }

    /// Builds a client from the ambient AWS configuration of the runtime.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        S3Store::new(aws_sdk_s3::Client::new(&config))
    }
}

struct S3Body(ByteStream);

#[async_trait]
impl ObjectBody for S3Body {
    async fn read_to_end(self: Box<Self>) -> Result<Vec<u8>, StoreError> {
        let data = self
            .0
            .collect()
            .await
            .map_err(|e| StoreError::Stream(e.to_string()))?;
        Ok(data.to_vec())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, container: &str, key: &str) -> Result<Box<dyn ObjectBody>, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    StoreError::NotFound {
                        container: container.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StoreError::Request(DisplayErrorContext(&e).to_string())
                }
            })?;
        Ok(Box::new(S3Body(output.body)))
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Request(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<ObjectSummary>, StoreError> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(container)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| StoreError::Request(DisplayErrorContext(&e).to_string()))?;

            for object in page.contents() {
                let (Some(key), Some(modified)) = (object.key(), object.last_modified()) else {
                    continue;
                };
                let Some(last_modified) =
                    DateTime::<Utc>::from_timestamp(modified.secs(), modified.subsec_nanos())
                else {
                    continue;
                };
                objects.push(ObjectSummary {
                    key: key.to_string(),
                    last_modified,
                });
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }
        debug!("Listed {} objects under {container}/{prefix}", objects.len());
        Ok(objects)
    }
}
