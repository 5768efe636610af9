//! Host functions bound into the guest runtime.
//!
//! Each capability is a named closure capturing the live host environment.
//! Guest code reaches them only by name through [`HostFunctionRegistry`];
//! every call takes string arguments (an optional handle followed by a JSON
//! payload) and resolves to a Call Envelope string.

pub mod logging;
pub mod network;
pub mod queue;
pub mod rewrite;
pub mod services;
pub mod storage;

use crate::actor::ActorSlot;
use crate::capability::HostCapability;
use crate::envelope::Masker;
use crate::error::{BridgeError, RuntimeError};
use crate::handles::HandleTable;
use crate::host::HostEnv;
use crate::metrics::BridgeMetrics;
use crate::queue::QueueHandles;
use crate::rewrite::guest::RewriteDispatcher;
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Future returned by a host function: always a serialized envelope
pub type HostFuture = BoxFuture<'static, String>;

/// A bound host function
pub type HostFn = Arc<dyn Fn(Vec<String>) -> HostFuture + Send + Sync>;

/// Wrap an async closure as a [`HostFn`]
pub fn host_fn<F, Fut>(f: F) -> HostFn
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = String> + Send + 'static,
{
    Arc::new(move |args| -> HostFuture { Box::pin(f(args)) })
}

/// Host function registry for one guest-runtime instance
pub struct HostFunctionRegistry {
    /// Bound functions by name
    functions: RwLock<HashMap<String, HostFn>>,
    /// Set once the interop primitive is enabled
    interop: OnceCell<()>,
    /// Call counters
    metrics: Arc<BridgeMetrics>,
}

impl HostFunctionRegistry {
    /// Create an empty registry
    pub fn new(metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
            interop: OnceCell::new(),
            metrics,
        }
    }

    /// Enable guest interop; returns `true` only on the first call
    pub fn enable_interop(&self) -> bool {
        let mut first = false;
        self.interop.get_or_init(|| {
            first = true;
            info!("Enabled guest interop");
        });
        first
    }

    /// Whether interop has been enabled
    pub fn interop_enabled(&self) -> bool {
        self.interop.get().is_some()
    }

    /// Bind `factory()` under `name` unless something is already bound.
    ///
    /// Returns `true` if this call bound the function. A second registration
    /// leaves the first closure, and the environment it captured, in place.
    pub fn register_once<F>(&self, name: &str, factory: F) -> bool
    where
        F: FnOnce() -> HostFn,
    {
        self.enable_interop();

        let mut functions = self.functions.write();
        if functions.contains_key(name) {
            debug!(name = %name, "Host function already registered");
            return false;
        }
        functions.insert(name.to_string(), factory());
        debug!(name = %name, "Registered host function");
        true
    }

    /// Call counters shared with the owning instance
    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    /// Check if a function is bound
    pub fn is_registered(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    /// Bound function names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Call a bound function.
    ///
    /// An unbound name is a configuration fault and is raised immediately.
    pub async fn invoke(&self, name: &str, args: Vec<String>) -> Result<String, RuntimeError> {
        let function = self
            .functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::MissingCapability(name.to_string()))?;

        self.metrics.record_host_call(name);
        Ok(function(args).await)
    }
}

/// Host-side state captured by every capability closure
pub struct HostState {
    /// Host environment captured at boot
    pub env: HostEnv,
    /// Envelope masking
    pub masker: Masker,
    /// Long-lived actor handles
    pub actors: Arc<HandleTable<ActorSlot>>,
    /// Ephemeral queue handles
    pub queues: Arc<QueueHandles>,
    /// Guest-side rewrite event entry point
    pub rewrite: Arc<RewriteDispatcher>,
    /// Outbound fetch timeout (0 = none)
    pub fetch_timeout_ms: u64,
    /// Counters
    pub metrics: Arc<BridgeMetrics>,
}

/// Register every capability in [`HostCapability::ALL`]
pub fn install(registry: &HostFunctionRegistry, state: Arc<HostState>) {
    for capability in HostCapability::ALL {
        let state = Arc::clone(&state);
        registry.register_once(capability.as_str(), move || build(capability, state));
    }
}

fn build(capability: HostCapability, state: Arc<HostState>) -> HostFn {
    match capability {
        HostCapability::StorageOp => storage::storage_op(state),
        HostCapability::AlarmOp => storage::alarm_op(state),
        HostCapability::StubFetch => network::stub_fetch(state),
        HostCapability::QueueMessageOp => queue::message_op(state),
        HostCapability::QueueBatchOp => queue::batch_op(state),
        HostCapability::RowStoreQuery => services::row_store_query(state),
        HostCapability::HttpFetch => network::http_fetch(state),
        HostCapability::InvokeInference => services::invoke_inference(state),
        HostCapability::VectorOp => services::vector_op(state),
        HostCapability::ReportError => logging::report_error(state),
        HostCapability::RewriteTransform => rewrite::rewrite_transform(state),
        HostCapability::CallBinding => services::call_binding(state),
    }
}

/// Positional string argument, malformed if absent
pub(crate) fn arg(args: &[String], index: usize, what: &str) -> Result<String, BridgeError> {
    args.get(index)
        .cloned()
        .ok_or_else(|| BridgeError::malformed_request(format!("Missing argument: {}", what)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::ErrorMasking;
    use crate::envelope::CallEnvelope;
    use crate::rewrite::guest::HandlerRegistry;

    /// Host state over `env` with development masking
    pub fn state_for(env: HostEnv) -> Arc<HostState> {
        let metrics = Arc::new(BridgeMetrics::new());
        let handlers = Arc::new(HandlerRegistry::new(64));
        Arc::new(HostState {
            env,
            masker: Masker::new(ErrorMasking::Development, "Internal Server Error"),
            actors: Arc::new(HandleTable::new()),
            queues: Arc::new(QueueHandles::new()),
            rewrite: Arc::new(RewriteDispatcher::new(handlers)),
            fetch_timeout_ms: 1_000,
            metrics,
        })
    }

    /// Call a host function and parse the envelope
    pub async fn call(function: &HostFn, args: &[&str]) -> CallEnvelope {
        let json = function(args.iter().map(|a| a.to_string()).collect()).await;
        CallEnvelope::parse(&json).expect("host functions always return envelopes")
    }
}
