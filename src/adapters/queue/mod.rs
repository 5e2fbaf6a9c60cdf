//! Sink adapter: submits normalized envelopes to the external durable
//! queue in batches of at most ten.
//!
//! No local persistent queue exists here — at-least-once delivery comes
//! from the scheduler's retry discipline. A batch either lands fully or
//! the whole submission errors, so the caller never advances its
//! watermark past an unsubmitted message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Envelope, IngestError};

/// One entry handed to the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkMessage {
    /// Serialized envelope (UTF-8 JSON).
    pub body: String,
    /// `{mailbox_id}_{wall_millis}`.
    pub dedup_key: String,
    /// Mailbox id; preserves per-mailbox ordering at the sink.
    pub group_key: String,
    pub attributes: HashMap<String, String>,
}

/// Per-entry failure reported by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryFailure {
    pub index: usize,
    pub error: String,
}

/// The wire seam to the durable queue. Batches carry at most ten entries
/// and report per-entry success or failure.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn send_batch(&self, batch: Vec<SinkMessage>) -> Result<Vec<EntryFailure>, IngestError>;
}

/// HTTP transport: POSTs the batch as JSON and reads back failed entries.
pub struct HttpQueueTransport {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    failed: Vec<EntryFailure>,
}

impl HttpQueueTransport {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url }
    }
}

#[async_trait]
impl QueueTransport for HttpQueueTransport {
    async fn send_batch(&self, batch: Vec<SinkMessage>) -> Result<Vec<EntryFailure>, IngestError> {
        let response = self
            .client
            .post(&self.url)
            .json(&batch)
            .send()
            .await
            .map_err(|e| IngestError::Sink(format!("batch POST failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(IngestError::Sink(format!(
                "queue returned {}",
                response.status()
            )));
        }

        let parsed: BatchResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Sink(format!("bad batch response: {}", e)))?;
        Ok(parsed.failed)
    }
}

/// In-memory transport for tests: records every batch, with optional
/// whole-batch rejection.
#[derive(Default)]
pub struct MemoryQueueTransport {
    pub sent: Mutex<Vec<Vec<SinkMessage>>>,
    pub reject: AtomicBool,
}

impl MemoryQueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_messages(&self) -> Vec<SinkMessage> {
        self.sent
            .lock()
            .expect("sink transport lock")
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl QueueTransport for MemoryQueueTransport {
    async fn send_batch(&self, batch: Vec<SinkMessage>) -> Result<Vec<EntryFailure>, IngestError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(IngestError::Sink("queue unavailable".into()));
        }
        self.sent.lock().expect("sink transport lock").push(batch);
        Ok(vec![])
    }
}

pub struct SinkAdapter {
    transport: Arc<dyn QueueTransport>,
    max_batch: usize,
    max_message_bytes: usize,
    truncate_at_bytes: usize,
    healthy: AtomicBool,
}

impl SinkAdapter {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        max_batch: usize,
        max_message_bytes: usize,
        truncate_at_bytes: usize,
    ) -> Self {
        Self {
            transport,
            // Hard cap from the queue contract
            max_batch: max_batch.min(10),
            max_message_bytes,
            truncate_at_bytes,
            healthy: AtomicBool::new(true),
        }
    }

    /// Whether the last submission round-trip succeeded.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Submit envelopes in order. Oversize bodies are truncated in place
    /// before serialization. Any per-entry failure fails the whole call.
    pub async fn submit(&self, envelopes: &mut [Envelope]) -> Result<(), IngestError> {
        if envelopes.is_empty() {
            return Ok(());
        }

        for envelope in envelopes.iter_mut() {
            if envelope.enforce_size_cap(self.max_message_bytes, self.truncate_at_bytes) {
                warn!(
                    mailbox_id = %envelope.mailbox_id,
                    internal_id = %envelope.internal_id,
                    "envelope exceeded sink size cap, body truncated"
                );
            }
        }

        for chunk in envelopes.chunks(self.max_batch) {
            let mut batch = Vec::with_capacity(chunk.len());
            for envelope in chunk {
                batch.push(sink_message(envelope)?);
            }
            let result = self.transport.send_batch(batch).await;
            match result {
                Ok(failures) if failures.is_empty() => {}
                Ok(failures) => {
                    self.healthy.store(false, Ordering::SeqCst);
                    return Err(IngestError::Sink(format!(
                        "{} of {} entries rejected: {}",
                        failures.len(),
                        chunk.len(),
                        failures[0].error
                    )));
                }
                Err(e) => {
                    self.healthy.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        self.healthy.store(true, Ordering::SeqCst);
        debug!(count = envelopes.len(), "envelopes submitted to sink");
        Ok(())
    }
}

fn sink_message(envelope: &Envelope) -> Result<SinkMessage, IngestError> {
    let body = envelope.to_sink_json()?;
    let wall_ms = Utc::now().timestamp_millis();

    let mut attributes = HashMap::new();
    attributes.insert("MessageType".into(), "email_envelope".into());
    attributes.insert("AccountId".into(), envelope.mailbox_id.clone());
    attributes.insert("OriginalMessageId".into(), envelope.message_id.clone());
    attributes.insert("InternalMessageId".into(), envelope.internal_id.clone());
    attributes.insert("ThreadId".into(), envelope.thread_id.clone());
    attributes.insert("IsReply".into(), envelope.is_reply.to_string());
    attributes.insert(
        "HasTextContent".into(),
        (!envelope.body_text.is_empty()).to_string(),
    );
    attributes.insert("TextLength".into(), envelope.body_text.len().to_string());
    attributes.insert("Timestamp".into(), envelope.received_at.to_rfc3339());

    Ok(SinkMessage {
        body,
        dedup_key: format!("{}_{}", envelope.mailbox_id, wall_ms),
        group_key: envelope.mailbox_id.clone(),
        attributes,
    })
}
