// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory stand-ins for the object store and the collector

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use grazer_delivery::{DeliveryFailure, DeliveryOutcome, DeliverySink};
use grazer_ingest::store::{ObjectBody, ObjectStore, ObjectSummary, StoreError};
use serde_json::Value;

struct StoredObject {
    bytes: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// Object store backed by a map, recording every delete.
#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    deleted: Mutex<Vec<String>>,
}

impl InMemoryStore {
    pub fn put(&self, container: &str, key: &str, bytes: Vec<u8>, last_modified: DateTime<Utc>) {
        self.objects.lock().unwrap().insert(
            (container.to_string(), key.to_string()),
            StoredObject {
                bytes,
                last_modified,
            },
        );
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn contains(&self, container: &str, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&(container.to_string(), key.to_string()))
    }
}

struct InMemoryBody(Vec<u8>);

#[async_trait]
impl ObjectBody for InMemoryBody {
    async fn read_to_end(self: Box<Self>) -> Result<Vec<u8>, StoreError> {
        Ok(self.0)
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, container: &str, key: &str) -> Result<Box<dyn ObjectBody>, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(&(container.to_string(), key.to_string()))
            .map(|object| Box::new(InMemoryBody(object.bytes.clone())) as Box<dyn ObjectBody>)
            .ok_or_else(|| StoreError::NotFound {
                container: container.to_string(),
                key: key.to_string(),
            })
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), StoreError> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(container.to_string(), key.to_string()));
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<ObjectSummary>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((c, k), _)| c == container && k.starts_with(prefix))
            .map(|((_, key), object)| ObjectSummary {
                key: key.clone(),
                last_modified: object.last_modified,
            })
            .collect())
    }
}

/// Collector that accepts everything and keeps the payloads.
#[derive(Default)]
pub struct RecordingSink {
    payloads: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }

    /// Payloads carrying decoded records rather than session lines.
    pub fn record_batches(&self, source_type: &str) -> Vec<String> {
        let needle = format!("\"sourcetype\":\"{source_type}\"");
        self.payloads()
            .into_iter()
            .filter(|payload| payload.contains(&needle))
            .collect()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn send(&self, payload: String) -> DeliveryOutcome {
        self.payloads.lock().unwrap().push(payload);
        DeliveryOutcome::Delivered
    }
}

/// Collector that rejects everything with a fixed response.
pub struct RejectingSink {
    pub sent: Mutex<u32>,
}

impl RejectingSink {
    pub fn new() -> Self {
        RejectingSink {
            sent: Mutex::new(0),
        }
    }
}

#[async_trait]
impl DeliverySink for RejectingSink {
    async fn send(&self, _payload: String) -> DeliveryOutcome {
        *self.sent.lock().unwrap() += 1;
        DeliveryOutcome::Failed(DeliveryFailure::from_response(
            "HTTP 400 Bad Request",
            r#"{"text":"Invalid data format","code":6}"#,
        ))
    }
}

/// Collector whose client crashes on record batches after a short stall,
/// taking its delivery worker down with it. Session lines go through.
pub struct CrashingSink {
    pub record_source_type: String,
    pub stall: Duration,
}

#[async_trait]
impl DeliverySink for CrashingSink {
    async fn send(&self, payload: String) -> DeliveryOutcome {
        let needle = format!("\"sourcetype\":\"{}\"", self.record_source_type);
        if payload.contains(&needle) {
            tokio::time::sleep(self.stall).await;
            panic!("collector client crashed");
        }
        DeliveryOutcome::Delivered
    }
}

pub fn gzip(document: &Value) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(document.to_string().as_bytes()).unwrap();
    encoder.finish().unwrap()
}
