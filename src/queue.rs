//! Queue message/batch bridge.
//!
//! One delivery allocates an ephemeral handle per message plus one for the
//! batch. Settlement consumes a handle exactly once; whatever is left when
//! guest dispatch returns is released by [`BatchGuard`].

use crate::bridge::HostBridge;
use crate::capability::HostCapability;
use crate::error::BridgeError;
use crate::handles::{Handle, HandleTable};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// A message as delivered by the host queue
#[async_trait]
pub trait NativeMessage: Send + Sync {
    /// Message id
    fn id(&self) -> String;

    /// Delivery attempts so far
    fn attempts(&self) -> u32;

    /// Enqueue time in epoch milliseconds
    fn timestamp(&self) -> i64;

    /// Raw body
    fn body(&self) -> Value;

    /// Acknowledge
    async fn ack(&self) -> anyhow::Result<()>;

    /// Ask for redelivery
    async fn retry(&self, delay_seconds: Option<u32>) -> anyhow::Result<()>;
}

/// A batch as delivered by the host queue
#[async_trait]
pub trait NativeBatch: Send + Sync {
    /// Queue name
    fn queue(&self) -> String;

    /// Messages in delivery order
    fn messages(&self) -> Vec<Arc<dyn NativeMessage>>;

    /// Acknowledge every message
    async fn ack_all(&self) -> anyhow::Result<()>;

    /// Redeliver every message
    async fn retry_all(&self, delay_seconds: Option<u32>) -> anyhow::Result<()>;
}

/// Message body, encoded host-side so the guest never guesses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum MessageBody {
    /// UTF-8 text
    Text {
        /// Text
        text: String,
    },
    /// Structured JSON
    Json {
        /// Value
        json: Value,
    },
}

impl MessageBody {
    /// Encode a raw body
    pub fn encode(raw: Value) -> Self {
        match raw {
            Value::String(text) => MessageBody::Text { text },
            json => MessageBody::Json { json },
        }
    }

    /// Text, if the body is text
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageBody::Text { text } => Some(text),
            MessageBody::Json { .. } => None,
        }
    }

    /// JSON value, if the body is structured
    pub fn json(&self) -> Option<&Value> {
        match self {
            MessageBody::Json { json } => Some(json),
            MessageBody::Text { .. } => None,
        }
    }
}

/// One message as serialized for the guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    /// Ephemeral message handle
    pub handle: Handle,
    /// Message id
    pub id: String,
    /// Delivery attempts
    pub attempts: u32,
    /// Enqueue time in epoch milliseconds
    pub timestamp: i64,
    /// Encoded body
    pub body: MessageBody,
}

/// One delivery: `{binding, queue, batchHandle, messages}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDelivery {
    /// Consumer binding name
    pub binding: String,
    /// Queue name
    pub queue: String,
    /// Ephemeral batch handle
    pub batch_handle: Handle,
    /// Messages
    pub messages: Vec<IncomingMessage>,
}

/// Settlement operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOp {
    /// Acknowledge one message
    Ack,
    /// Redeliver one message
    Retry,
    /// Acknowledge the batch
    AckAll,
    /// Redeliver the batch
    RetryAll,
}

impl QueueOp {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueOp::Ack => "ack",
            QueueOp::Retry => "retry",
            QueueOp::AckAll => "ack_all",
            QueueOp::RetryAll => "retry_all",
        }
    }
}

/// Queue op payload: `{handle, op, delaySeconds?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOpRequest {
    /// Message or batch handle
    #[serde(default)]
    pub handle: Handle,
    /// Operation
    pub op: QueueOp,
    /// Redelivery delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u32>,
}

struct MessageSlot {
    message: Arc<dyn NativeMessage>,
    settled: bool,
}

struct BatchSlot {
    batch: Arc<dyn NativeBatch>,
    messages: Vec<Handle>,
    settled: bool,
}

/// Host-side message and batch handle tables
pub struct QueueHandles {
    messages: HandleTable<MessageSlot>,
    batches: HandleTable<BatchSlot>,
}

impl QueueHandles {
    /// Create empty tables
    pub fn new() -> Self {
        Self {
            messages: HandleTable::new(),
            batches: HandleTable::new(),
        }
    }

    /// Register every handle of a delivery before guest code runs
    pub fn prepare(
        self: &Arc<Self>,
        binding: &str,
        batch: Arc<dyn NativeBatch>,
    ) -> (QueueDelivery, BatchGuard) {
        let mut handles = Vec::new();
        let mut messages = Vec::new();

        for message in batch.messages() {
            let incoming = IncomingMessage {
                handle: String::new(),
                id: message.id(),
                attempts: message.attempts(),
                timestamp: message.timestamp(),
                body: MessageBody::encode(message.body()),
            };
            let handle = self.messages.insert(
                "msg",
                MessageSlot {
                    message,
                    settled: false,
                },
            );
            handles.push(handle.clone());
            messages.push(IncomingMessage { handle, ..incoming });
        }

        let queue = batch.queue();
        let batch_handle = self.batches.insert(
            "batch",
            BatchSlot {
                batch,
                messages: handles,
                settled: false,
            },
        );

        debug!(
            batch = %batch_handle,
            queue = %queue,
            messages = messages.len(),
            "Prepared queue delivery"
        );

        let delivery = QueueDelivery {
            binding: binding.to_string(),
            queue,
            batch_handle: batch_handle.clone(),
            messages,
        };
        let guard = BatchGuard {
            queues: Arc::clone(self),
            batch: batch_handle,
        };
        (delivery, guard)
    }

    /// Settle one message.
    ///
    /// The handle is consumed whether or not the host call succeeds.
    pub async fn settle_message(
        &self,
        handle: &str,
        op: QueueOp,
        delay_seconds: Option<u32>,
    ) -> Result<(), BridgeError> {
        if !matches!(op, QueueOp::Ack | QueueOp::Retry) {
            return Err(BridgeError::invalid_argument(format!(
                "'{}' is a batch operation",
                op.as_str()
            )));
        }

        let message = self.messages.with(handle, |slot| {
            if slot.settled {
                return Err(BridgeError::already_settled(handle));
            }
            slot.settled = true;
            Ok(Arc::clone(&slot.message))
        })??;

        let _release = Release {
            table: &self.messages,
            handle,
        };

        debug!(handle = %handle, op = op.as_str(), "Settling message");
        let outcome = if op == QueueOp::Ack {
            message.ack().await
        } else {
            message.retry(delay_seconds).await
        };
        outcome.map_err(|e| BridgeError::host(&e))
    }

    /// Settle every message of a batch.
    ///
    /// All of the batch's message handles are consumed along with the batch
    /// handle, including when the host call fails.
    pub async fn settle_batch(
        &self,
        handle: &str,
        op: QueueOp,
        delay_seconds: Option<u32>,
    ) -> Result<(), BridgeError> {
        if !matches!(op, QueueOp::AckAll | QueueOp::RetryAll) {
            return Err(BridgeError::invalid_argument(format!(
                "'{}' is a message operation",
                op.as_str()
            )));
        }

        let (batch, messages) = self.batches.with(handle, |slot| {
            if slot.settled {
                return Err(BridgeError::already_settled(handle));
            }
            slot.settled = true;
            Ok((Arc::clone(&slot.batch), slot.messages.clone()))
        })??;

        for message in &messages {
            self.messages.with(message, |slot| slot.settled = true).ok();
        }

        let _release = BatchRelease {
            queues: self,
            handle,
            messages: &messages,
        };

        debug!(handle = %handle, op = op.as_str(), "Settling batch");
        let outcome = if op == QueueOp::AckAll {
            batch.ack_all().await
        } else {
            batch.retry_all(delay_seconds).await
        };
        outcome.map_err(|e| BridgeError::host(&e))
    }

    /// Drop a batch handle and every message handle it owns
    pub fn release_batch(&self, handle: &str) -> usize {
        let mut released = 0;
        if let Some(slot) = self.batches.release(handle) {
            released += 1;
            for message in &slot.messages {
                if self.messages.release(message).is_some() {
                    released += 1;
                }
            }
        }
        released
    }

    /// Live message handles
    pub fn live_messages(&self) -> usize {
        self.messages.len()
    }

    /// Live batch handles
    pub fn live_batches(&self) -> usize {
        self.batches.len()
    }

    /// Whether a message or batch handle is live
    pub fn is_live(&self, handle: &str) -> bool {
        self.messages.contains(handle) || self.batches.contains(handle)
    }
}

impl Default for QueueHandles {
    fn default() -> Self {
        Self::new()
    }
}

struct Release<'a> {
    table: &'a HandleTable<MessageSlot>,
    handle: &'a str,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.table.release(self.handle);
    }
}

struct BatchRelease<'a> {
    queues: &'a QueueHandles,
    handle: &'a str,
    messages: &'a [Handle],
}

impl Drop for BatchRelease<'_> {
    fn drop(&mut self) {
        for message in self.messages {
            self.queues.messages.release(message);
        }
        self.queues.batches.release(self.handle);
    }
}

/// Releases every handle of one delivery when dropped
pub struct BatchGuard {
    queues: Arc<QueueHandles>,
    batch: Handle,
}

impl BatchGuard {
    /// The guarded batch handle
    pub fn batch_handle(&self) -> &str {
        &self.batch
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let released = self.queues.release_batch(&self.batch);
        if released > 0 {
            debug!(batch = %self.batch, released, "Released unsettled queue handles");
        }
    }
}

/// Guest view of one message
#[derive(Clone)]
pub struct QueueMessage {
    bridge: HostBridge,
    handle: Handle,
    /// Message id
    pub id: String,
    /// Delivery attempts
    pub attempts: u32,
    /// Enqueue time in epoch milliseconds
    pub timestamp: i64,
    /// Decoded body
    pub body: MessageBody,
}

impl QueueMessage {
    /// The message handle
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Acknowledge this message
    pub async fn ack(&self) -> Result<(), BridgeError> {
        self.settle(QueueOp::Ack, None).await
    }

    /// Ask for redelivery
    pub async fn retry(&self, delay_seconds: Option<u32>) -> Result<(), BridgeError> {
        self.settle(QueueOp::Retry, delay_seconds).await
    }

    async fn settle(&self, op: QueueOp, delay_seconds: Option<u32>) -> Result<(), BridgeError> {
        let request = QueueOpRequest {
            handle: self.handle.clone(),
            op,
            delay_seconds,
        };
        self.bridge
            .call(
                HostCapability::QueueMessageOp,
                vec![serde_json::to_string(&request)?],
            )
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMessage")
            .field("handle", &self.handle)
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Guest view of one delivery
#[derive(Clone)]
pub struct QueueBatch {
    bridge: HostBridge,
    handle: Handle,
    /// Consumer binding name
    pub binding: String,
    /// Queue name
    pub queue: String,
    /// Messages in delivery order
    pub messages: Vec<QueueMessage>,
}

impl QueueBatch {
    /// Build the guest objects for a delivery
    pub fn from_delivery(bridge: HostBridge, delivery: QueueDelivery) -> Self {
        let messages = delivery
            .messages
            .into_iter()
            .map(|m| QueueMessage {
                bridge: bridge.clone(),
                handle: m.handle,
                id: m.id,
                attempts: m.attempts,
                timestamp: m.timestamp,
                body: m.body,
            })
            .collect();

        Self {
            bridge,
            handle: delivery.batch_handle,
            binding: delivery.binding,
            queue: delivery.queue,
            messages,
        }
    }

    /// The batch handle
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Acknowledge every message
    pub async fn ack_all(&self) -> Result<(), BridgeError> {
        self.settle(QueueOp::AckAll, None).await
    }

    /// Redeliver every message
    pub async fn retry_all(&self, delay_seconds: Option<u32>) -> Result<(), BridgeError> {
        self.settle(QueueOp::RetryAll, delay_seconds).await
    }

    async fn settle(&self, op: QueueOp, delay_seconds: Option<u32>) -> Result<(), BridgeError> {
        let payload = json!({
            "handle": self.handle,
            "op": op,
            "delaySeconds": delay_seconds,
        });
        self.bridge
            .call(HostCapability::QueueBatchOp, vec![payload.to_string()])
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for QueueBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBatch")
            .field("handle", &self.handle)
            .field("queue", &self.queue)
            .field("messages", &self.messages)
            .finish()
    }
}

/// How a [`MemoryMessage`] was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledged
    Acked,
    /// Redelivery requested
    Retried(Option<u32>),
}

/// In-memory [`NativeMessage`] recording its settlements
pub struct MemoryMessage {
    id: String,
    attempts: u32,
    timestamp: i64,
    body: Value,
    settlements: Mutex<Vec<Settlement>>,
}

impl MemoryMessage {
    /// Create a first-attempt message enqueued now
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            attempts: 1,
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
            settlements: Mutex::new(Vec::new()),
        }
    }

    /// Settlements received so far
    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.lock().clone()
    }
}

#[async_trait]
impl NativeMessage for MemoryMessage {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn body(&self) -> Value {
        self.body.clone()
    }

    async fn ack(&self) -> anyhow::Result<()> {
        self.settlements.lock().push(Settlement::Acked);
        Ok(())
    }

    async fn retry(&self, delay_seconds: Option<u32>) -> anyhow::Result<()> {
        self.settlements
            .lock()
            .push(Settlement::Retried(delay_seconds));
        Ok(())
    }
}

/// In-memory [`NativeBatch`]
pub struct MemoryBatch {
    queue: String,
    messages: Vec<Arc<MemoryMessage>>,
}

impl MemoryBatch {
    /// Create a batch
    pub fn new(queue: impl Into<String>, messages: Vec<Arc<MemoryMessage>>) -> Self {
        Self {
            queue: queue.into(),
            messages,
        }
    }

    /// The batch's messages
    pub fn memory_messages(&self) -> &[Arc<MemoryMessage>] {
        &self.messages
    }
}

#[async_trait]
impl NativeBatch for MemoryBatch {
    fn queue(&self) -> String {
        self.queue.clone()
    }

    fn messages(&self) -> Vec<Arc<dyn NativeMessage>> {
        self.messages
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn NativeMessage>)
            .collect()
    }

    async fn ack_all(&self) -> anyhow::Result<()> {
        for message in &self.messages {
            message.ack().await?;
        }
        Ok(())
    }

    async fn retry_all(&self, delay_seconds: Option<u32>) -> anyhow::Result<()> {
        for message in &self.messages {
            message.retry(delay_seconds).await?;
        }
        Ok(())
    }
}
