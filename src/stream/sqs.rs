//! AWS SQS stream
//!
//! Publishes message batches through `SendMessageBatch`, honoring the
//! queue's three limits: messages per request, bytes per request and bytes
//! per message. Oversized messages are replaced by a small reference
//! message; the payload itself is not transmitted (offloading to a blob
//! store is out of scope).

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::aws::{AwsClientConfig, AwsCredentials, AwsJsonClient};
use crate::config::{env_or, require_env};
use crate::error::{CdcError, Result};
use crate::types::Message;

use super::Stream;

/// Limits imposed by the destination queue, fixed at construction
#[derive(Debug, Clone)]
pub struct SqsLimits {
    /// Maximum messages per request (SQS hard limit: 10)
    pub max_batch_count: usize,
    /// Maximum total request bytes
    pub max_request_bytes: usize,
    /// Maximum individual message bytes
    pub max_message_bytes: usize,
}

impl Default for SqsLimits {
    fn default() -> Self {
        SqsLimits {
            max_batch_count: 10,
            max_request_bytes: 256 * 1024,
            max_message_bytes: 256 * 1024,
        }
    }
}

/// Reserve under the per-message limit for envelope and attribute overhead
const MESSAGE_SIZE_RESERVE: usize = 6 * 1024;
/// Estimated per-entry request overhead (ids, attributes, JSON framing)
const ENTRY_OVERHEAD: usize = 512;

impl SqsLimits {
    /// Largest message body accepted without substitution
    fn effective_message_bytes(&self) -> usize {
        self.max_message_bytes.saturating_sub(MESSAGE_SIZE_RESERVE)
    }
}

/// One message prepared for transmission
#[derive(Debug, Clone)]
struct PlannedEntry {
    id: String,
    body: Bytes,
    oversized: bool,
}

pub struct SqsStream {
    queue_url: String,
    /// Message attribute identifying the producer
    source: String,
    limits: SqsLimits,
    aws_config: AwsClientConfig,
    client: Mutex<Option<Arc<AwsJsonClient>>>,
}

impl SqsStream {
    /// Build from `SQS_QUEUE_URL`, `AWS_REGION`, `AWS_ENDPOINT_URL`,
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and optional `SOURCE`.
    pub fn from_env() -> Result<Self> {
        let queue_url = require_env("SQS_QUEUE_URL")?;
        let region = require_env("AWS_REGION")?;
        let endpoint_url = require_env("AWS_ENDPOINT_URL")?;
        let access_key_id = require_env("AWS_ACCESS_KEY_ID")?;
        let secret_access_key = require_env("AWS_SECRET_ACCESS_KEY")?;
        let source = env_or("SOURCE", "minicdc");

        Ok(Self::new(
            queue_url,
            source,
            SqsLimits::default(),
            AwsClientConfig::new(
                region,
                endpoint_url,
                AwsCredentials {
                    access_key_id,
                    secret_access_key,
                },
            ),
        ))
    }

    pub fn new(
        queue_url: String,
        source: String,
        limits: SqsLimits,
        aws_config: AwsClientConfig,
    ) -> Self {
        SqsStream {
            queue_url,
            source,
            limits,
            aws_config,
            client: Mutex::new(None),
        }
    }

    /// The client is constructed lazily on first send, under a mutex so
    /// concurrent construction is prevented.
    fn get_client(&self) -> Result<Arc<AwsJsonClient>> {
        let mut slot = match self.client.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(AwsJsonClient::new("sqs", self.aws_config.clone())?);
        log::debug!(
            "Setup SQS client: {} - {} - {}",
            self.queue_url,
            self.aws_config.endpoint_url,
            self.aws_config.region
        );
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    fn send_batch(&self, client: &AwsJsonClient, batch: &[PlannedEntry]) -> Result<()> {
        // Encoder overhead can push a within-plan batch over the request
        // limit; split in half and send each half.
        let request = self.build_request(batch);
        let encoded_len = request.to_string().len();
        if encoded_len > self.limits.max_request_bytes && batch.len() > 1 {
            let mid = batch.len() / 2;
            log::debug!(
                "Encoded batch of {} entries is {} bytes, splitting",
                batch.len(),
                encoded_len
            );
            self.send_batch(client, &batch[..mid])?;
            return self.send_batch(client, &batch[mid..]);
        }

        log::debug!("Sending batch of {} messages", batch.len());
        let response = client.post("AmazonSQS.SendMessageBatch", &request)?;
        classify_batch_response(&response, batch.len())
    }

    fn build_request(&self, batch: &[PlannedEntry]) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = batch
            .iter()
            .map(|entry| {
                json!({
                    "Id": entry.id,
                    "MessageBody": String::from_utf8_lossy(&entry.body),
                    "MessageAttributes": {
                        "source": { "DataType": "String", "StringValue": self.source }
                    }
                })
            })
            .collect();
        json!({ "QueueUrl": self.queue_url, "Entries": entries })
    }
}

impl Stream for SqsStream {
    fn send(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let client = self.get_client()?;
        let entries = plan_entries(messages, &self.limits)?;
        for batch in plan_batches(&entries, &self.limits) {
            self.send_batch(&client, batch)?;
        }
        Ok(())
    }

    fn close(&self) {
        // The HTTP client holds no resources that outlive it; dropping the
        // lazily built client is enough.
        if let Ok(mut slot) = self.client.lock() {
            slot.take();
        }
    }
}

/// Serialize messages in order, substituting a reference message for any
/// body over the per-message limit.
fn plan_entries(messages: &[Message], limits: &SqsLimits) -> Result<Vec<PlannedEntry>> {
    let effective_limit = limits.effective_message_bytes();
    let mut entries = Vec::with_capacity(messages.len());

    for (idx, message) in messages.iter().enumerate() {
        let body = serde_json::to_vec(message)
            .map_err(|e| CdcError::Stream(format!("Failed to encode message {}: {}", idx, e)))?;

        let (body, oversized) = if body.len() > effective_limit {
            log::warn!(
                "Message {} size {} exceeds limit of {} bytes, sending reference message",
                idx,
                body.len(),
                effective_limit
            );
            let reference = reference_message(message, &body);
            (serde_json::to_vec(&reference).map_err(|e| {
                CdcError::Stream(format!("Failed to encode reference message {}: {}", idx, e))
            })?, true)
        } else {
            (body, false)
        };

        entries.push(PlannedEntry {
            id: idx.to_string(),
            body: Bytes::from(body),
            oversized,
        });
    }
    Ok(entries)
}

/// Stand-in for a message too large to transmit: a stable identifier plus
/// the small identifying metadata from the envelope.
fn reference_message(message: &Message, body: &[u8]) -> Message {
    let digest = hex::encode(Sha256::digest(body));
    let spec = message.get("spec");
    let field = |name: &str| {
        spec.and_then(|s| s.get(name))
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    };
    json!({
        "oversized": true,
        "id": &digest[..16],
        "original_size": body.len(),
        "event_type": field("event_type"),
        "database": field("database"),
        "table": field("table"),
    })
}

/// Cut the entries into contiguous batches respecting both the count and
/// byte limits. Order is preserved.
fn plan_batches<'a>(entries: &'a [PlannedEntry], limits: &SqsLimits) -> Vec<&'a [PlannedEntry]> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut batch_bytes = 0;

    for (idx, entry) in entries.iter().enumerate() {
        let entry_bytes = entry.body.len() + ENTRY_OVERHEAD;
        let count = idx - start;
        if count > 0 && (count >= limits.max_batch_count || batch_bytes + entry_bytes > limits.max_request_bytes)
        {
            batches.push(&entries[start..idx]);
            start = idx;
            batch_bytes = 0;
        }
        batch_bytes += entry_bytes;
    }
    if start < entries.len() {
        batches.push(&entries[start..]);
    }
    batches
}

const RETRIABLE_CODES: &[&str] = &["InternalError", "ServiceUnavailable", "ThrottlingException"];

/// Inspect a SendMessageBatch response: success only when every entry was
/// accepted. Failures are logged individually with their reason codes.
fn classify_batch_response(response: &serde_json::Value, batch_len: usize) -> Result<()> {
    let empty = Vec::new();
    let failed = response
        .get("Failed")
        .and_then(|f| f.as_array())
        .unwrap_or(&empty);

    if failed.is_empty() {
        let successful = response
            .get("Successful")
            .and_then(|s| s.as_array())
            .map(|s| s.len())
            .unwrap_or(0);
        log::debug!("Successfully sent {} messages to SQS", successful);
        return Ok(());
    }

    let mut failed_ids = Vec::with_capacity(failed.len());
    let mut retriable = false;
    for entry in failed {
        let id = entry.get("Id").and_then(|v| v.as_str()).unwrap_or("?");
        let code = entry.get("Code").and_then(|v| v.as_str()).unwrap_or("Unknown");
        let reason = entry
            .get("Message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error");
        let sender_fault = entry
            .get("SenderFault")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        log::error!("Message {} failed: {} ({})", id, reason, code);
        if !sender_fault || RETRIABLE_CODES.contains(&code) {
            retriable = true;
        }
        failed_ids.push(id.to_string());
    }

    if retriable {
        log::warn!("Some failed messages may be retriable");
    }

    let message = if failed.len() == batch_len {
        format!(
            "Failed to send {} messages to SQS. IDs: {:?}",
            failed.len(),
            failed_ids
        )
    } else {
        format!(
            "Failed to send {} of {} messages to SQS ({} accepted). IDs: {:?}",
            failed.len(),
            batch_len,
            batch_len - failed.len(),
            failed_ids
        )
    };
    Err(CdcError::Stream(message))
}
