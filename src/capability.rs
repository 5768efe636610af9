//! Capability names and the open-ended binding registry.
//!
//! The bridge registers a fixed, enumerable set of host capabilities at
//! boot. Generic bindings (whatever the host environment exposes by name)
//! are resolved at call time through an explicit [`BindingRegistry`] with a
//! rejection path for unknown names and methods.

use crate::error::BridgeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Host capability names bound into the guest runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostCapability {
    /// Durable actor storage operation: `storage_op`
    StorageOp,
    /// Durable actor alarm operation: `alarm_op`
    AlarmOp,
    /// Fetch through an actor stub: `stub_fetch`
    StubFetch,
    /// Settle one queue message: `queue_message_op`
    QueueMessageOp,
    /// Settle a whole queue batch: `queue_batch_op`
    QueueBatchOp,
    /// Row-store query: `row_store_query`
    RowStoreQuery,
    /// Outbound HTTP fetch: `http_fetch`
    HttpFetch,
    /// Managed inference: `invoke_inference`
    InvokeInference,
    /// Vector index operation: `vector_op`
    VectorOp,
    /// Error reporting: `report_error`
    ReportError,
    /// Streaming markup rewrite: `rewrite_transform`
    RewriteTransform,
    /// Generic named binding call: `call_binding`
    CallBinding,
}

impl HostCapability {
    /// Every capability registered at boot
    pub const ALL: [HostCapability; 12] = [
        HostCapability::StorageOp,
        HostCapability::AlarmOp,
        HostCapability::StubFetch,
        HostCapability::QueueMessageOp,
        HostCapability::QueueBatchOp,
        HostCapability::RowStoreQuery,
        HostCapability::HttpFetch,
        HostCapability::InvokeInference,
        HostCapability::VectorOp,
        HostCapability::ReportError,
        HostCapability::RewriteTransform,
        HostCapability::CallBinding,
    ];

    /// Registered function name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StorageOp => "storage_op",
            Self::AlarmOp => "alarm_op",
            Self::StubFetch => "stub_fetch",
            Self::QueueMessageOp => "queue_message_op",
            Self::QueueBatchOp => "queue_batch_op",
            Self::RowStoreQuery => "row_store_query",
            Self::HttpFetch => "http_fetch",
            Self::InvokeInference => "invoke_inference",
            Self::VectorOp => "vector_op",
            Self::ReportError => "report_error",
            Self::RewriteTransform => "rewrite_transform",
            Self::CallBinding => "call_binding",
        }
    }

    /// Parse a capability from its function name
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for HostCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named host binding callable by method name
#[async_trait]
pub trait Binding: Send + Sync {
    /// Methods this binding exposes
    fn methods(&self) -> Vec<String>;

    /// Invoke a method; only called with a name from [`Binding::methods`]
    async fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value>;
}

/// Capability map `name -> binding`
#[derive(Clone, Default)]
pub struct BindingRegistry {
    bindings: BTreeMap<String, Arc<dyn Binding>>,
}

impl BindingRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding under `name`, replacing any previous one
    pub fn insert(&mut self, name: impl Into<String>, binding: Arc<dyn Binding>) {
        self.bindings.insert(name.into(), binding);
    }

    /// Check if a binding exists
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Registered binding names
    pub fn names(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    /// Methods of a binding
    pub fn methods(&self, name: &str) -> Result<Vec<String>, BridgeError> {
        self.bindings
            .get(name)
            .map(|b| b.methods())
            .ok_or_else(|| BridgeError::binding_not_found(name))
    }

    /// Resolve `name.method` and invoke it
    pub async fn call(&self, name: &str, method: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        let binding = self
            .bindings
            .get(name)
            .ok_or_else(|| BridgeError::binding_not_found(name))?;

        if !binding.methods().iter().any(|m| m == method) {
            return Err(BridgeError::method_not_found(name, method));
        }

        binding
            .call(method, args)
            .await
            .map_err(|e| BridgeError::host(&e))
    }
}

impl fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingRegistry")
            .field("bindings", &self.names())
            .finish()
    }
}
