//! Guest-side dispatch object.
//!
//! [`HostBridge`] is the only way guest code reaches the host: it invokes a
//! host function by capability name with string arguments and unwraps the
//! Call Envelope that comes back, raising `ok: false` as a [`BridgeError`].

use crate::actor::{ActorStub, StubTarget};
use crate::capability::HostCapability;
use crate::context::HostResponse;
use crate::envelope::CallEnvelope;
use crate::error::{BridgeError, RuntimeError};
use crate::host::{ErrorReport, FetchRequest, QueryAction, VectorOperation};
use crate::host_functions::HostFunctionRegistry;
use crate::rewrite::guest::{HandlerRegistry, HtmlRewriter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Guest handle on the host capabilities of one runtime instance
#[derive(Clone)]
pub struct HostBridge {
    registry: Arc<HostFunctionRegistry>,
    handlers: Arc<HandlerRegistry>,
    vars: Arc<HashMap<String, String>>,
}

impl HostBridge {
    /// Create a bridge over a booted registry
    pub fn new(
        registry: Arc<HostFunctionRegistry>,
        handlers: Arc<HandlerRegistry>,
        vars: HashMap<String, String>,
    ) -> Self {
        Self {
            registry,
            handlers,
            vars: Arc::new(vars),
        }
    }

    /// The host function registry
    pub fn registry(&self) -> &Arc<HostFunctionRegistry> {
        &self.registry
    }

    /// The rewrite handler table
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Environment variable visible to guest code
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Invoke a capability and return the raw envelope.
    ///
    /// An unbound capability is raised as `MISSING_CAPABILITY`; every other
    /// outcome comes back inside the envelope.
    pub async fn envelope(
        &self,
        capability: HostCapability,
        args: Vec<String>,
    ) -> Result<CallEnvelope, BridgeError> {
        let json = self
            .registry
            .invoke(capability.as_str(), args)
            .await
            .map_err(|e| match e {
                RuntimeError::MissingCapability(name) => BridgeError::missing_capability(name),
                other => other.to_bridge_error(),
            })?;
        CallEnvelope::parse(&json)
    }

    /// Invoke a capability and unwrap its result
    pub async fn call(
        &self,
        capability: HostCapability,
        args: Vec<String>,
    ) -> Result<Value, BridgeError> {
        let envelope = self.envelope(capability, args).await?;
        if !envelope.ok {
            debug!(capability = %capability, "Host call returned an error envelope");
        }
        envelope.into_result()
    }

    async fn call_json(&self, capability: HostCapability, payload: Value) -> Result<Value, BridgeError> {
        self.call(capability, vec![payload.to_string()]).await
    }

    /// Call `name.method(args)` on an open-ended host binding
    pub async fn call_binding(
        &self,
        name: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BridgeError> {
        self.call_json(
            HostCapability::CallBinding,
            json!({"name": name, "method": method, "args": args}),
        )
        .await
    }

    /// Run one statement on a row store
    pub async fn run_row_store_query(
        &self,
        binding: &str,
        sql: &str,
        bindings: Vec<Value>,
        action: QueryAction,
    ) -> Result<Value, BridgeError> {
        self.call_json(
            HostCapability::RowStoreQuery,
            json!({"binding": binding, "sql": sql, "bindings": bindings, "action": action}),
        )
        .await
    }

    /// Outbound fetch
    pub async fn http_fetch(&self, request: FetchRequest) -> Result<HostResponse, BridgeError> {
        let result = self
            .call(HostCapability::HttpFetch, vec![serde_json::to_string(&request)?])
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Run a model; `binding` defaults to `AI`
    pub async fn invoke_inference(
        &self,
        binding: Option<&str>,
        model: &str,
        input: Value,
    ) -> Result<Value, BridgeError> {
        let mut payload = json!({"model": model, "input": input});
        if let Some(binding) = binding {
            payload["binding"] = json!(binding);
        }
        self.call_json(HostCapability::InvokeInference, payload).await
    }

    /// Vector index operation
    pub async fn invoke_vector_op(
        &self,
        binding: &str,
        op: VectorOperation,
        args: Value,
    ) -> Result<Value, BridgeError> {
        self.call_json(
            HostCapability::VectorOp,
            json!({"binding": binding, "op": op, "args": args}),
        )
        .await
    }

    /// Report an error to the host
    pub async fn report_error(&self, report: &ErrorReport) -> Result<(), BridgeError> {
        self.call(HostCapability::ReportError, vec![serde_json::to_string(report)?])
            .await
            .map(|_| ())
    }

    /// Stub addressing one actor of a namespace
    pub fn actor_stub(&self, binding: &str, target: StubTarget) -> ActorStub {
        ActorStub::new(self.clone(), binding, target)
    }

    /// New streaming rewriter whose handlers are released when it is dropped
    pub fn rewriter(&self) -> HtmlRewriter {
        HtmlRewriter::new(self.clone())
    }
}

impl fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBridge")
            .field("capabilities", &self.registry.names())
            .field("rewrite_handlers", &self.handlers.len())
            .finish()
    }
}

/// Report `error` without ever failing.
///
/// A report that cannot be delivered is logged and counted; it never
/// replaces the error being reported.
pub(crate) async fn report_best_effort(
    registry: &HostFunctionRegistry,
    error: &BridgeError,
    context: Value,
) {
    let report = ErrorReport::from_error(error, context);
    let payload = match serde_json::to_string(&report) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to serialize error report");
            registry.metrics().record_report(false);
            return;
        }
    };

    let delivered = match registry
        .invoke(HostCapability::ReportError.as_str(), vec![payload])
        .await
    {
        Ok(json) => match CallEnvelope::parse(&json) {
            Ok(envelope) if envelope.ok => true,
            Ok(envelope) => {
                let message = envelope.error.map(|e| e.message).unwrap_or_default();
                warn!(reason = %message, "Error report rejected by host");
                false
            }
            Err(e) => {
                warn!(error = %e, "Error report returned an invalid envelope");
                false
            }
        },
        Err(e) => {
            warn!(error = %e, "Error report could not be delivered");
            false
        }
    };

    registry.metrics().record_report(delivered);
}
