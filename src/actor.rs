//! Durable Actor State Bridge.
//!
//! A long-lived handle names one actor's storage. On the first dispatch for
//! a handle the guest actor is built from its binding's factory and cached;
//! later dispatches reuse it and only refresh its metadata. Storage and
//! alarm access go through [`ActorStorage`], which calls the host by
//! capability name and returns unwrapped results.

use crate::bridge::HostBridge;
use crate::capability::HostCapability;
use crate::context::{GuestValue, Headers, HostRequest, HostResponse};
use crate::error::BridgeError;
use crate::handles::Handle;
use crate::host::{DurableStorage, ListOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Host-side resource behind an actor handle
#[derive(Clone)]
pub struct ActorSlot {
    /// Namespace binding name
    pub binding: String,
    /// Identity the handle was opened for
    pub identity: String,
    /// The actor's durable storage and alarm
    pub storage: Arc<dyn DurableStorage>,
}

impl ActorSlot {
    /// Create a slot
    pub fn new(
        binding: impl Into<String>,
        identity: impl Into<String>,
        storage: Arc<dyn DurableStorage>,
    ) -> Self {
        Self {
            binding: binding.into(),
            identity: identity.into(),
            storage,
        }
    }
}

impl fmt::Debug for ActorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSlot")
            .field("binding", &self.binding)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Host-assigned identity of an actor, re-supplied on every dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorMetadata {
    /// Namespace binding name
    pub binding: String,
    /// Namespace name
    #[serde(default)]
    pub namespace: Option<String>,
    /// Object id
    #[serde(default)]
    pub object_id: Option<String>,
    /// Object name, when addressed by name
    #[serde(default)]
    pub object_name: Option<String>,
}

impl ActorMetadata {
    /// Metadata for `binding` with nothing else known
    pub fn new(binding: impl Into<String>) -> Self {
        Self {
            binding: binding.into(),
            ..Default::default()
        }
    }

    /// Set the object id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    /// Set the object name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.object_name = Some(name.into());
        self
    }

    /// Set the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Storage and alarm proxy bound to one actor handle
#[derive(Clone)]
pub struct ActorStorage {
    bridge: HostBridge,
    handle: Handle,
}

impl ActorStorage {
    /// Create a proxy
    pub fn new(bridge: HostBridge, handle: impl Into<Handle>) -> Self {
        Self {
            bridge,
            handle: handle.into(),
        }
    }

    async fn storage(&self, payload: Value) -> Result<Value, BridgeError> {
        self.bridge
            .call(
                HostCapability::StorageOp,
                vec![self.handle.clone(), payload.to_string()],
            )
            .await
    }

    async fn alarm(&self, payload: Value) -> Result<Value, BridgeError> {
        self.bridge
            .call(
                HostCapability::AlarmOp,
                vec![self.handle.clone(), payload.to_string()],
            )
            .await
    }

    /// Read one key; `None` when unset
    pub async fn get(&self, key: &str) -> Result<Option<Value>, BridgeError> {
        let value = self.storage(json!({"op": "get", "key": key})).await?;
        Ok(match value {
            Value::Null => None,
            value => Some(value),
        })
    }

    /// Read several keys; absent keys are left out
    pub async fn get_many(&self, keys: &[&str]) -> Result<Map<String, Value>, BridgeError> {
        match self.storage(json!({"op": "get", "keys": keys})).await? {
            Value::Object(found) => Ok(found),
            Value::Null => Ok(Map::new()),
            other => Err(BridgeError::malformed_request(format!(
                "Expected an object from multi-get, got {}",
                other
            ))),
        }
    }

    /// Write one key
    pub async fn put(&self, key: &str, value: Value) -> Result<(), BridgeError> {
        self.storage(json!({"op": "put", "key": key, "value": value}))
            .await
            .map(|_| ())
    }

    /// Delete one key, returning whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool, BridgeError> {
        let existed = self.storage(json!({"op": "delete", "key": key})).await?;
        Ok(existed.as_bool().unwrap_or(false))
    }

    /// Delete every key
    pub async fn delete_all(&self) -> Result<(), BridgeError> {
        self.storage(json!({"op": "deleteAll"})).await.map(|_| ())
    }

    /// Ordered listing
    pub async fn list(&self, options: ListOptions) -> Result<Vec<(String, Value)>, BridgeError> {
        let entries = self
            .storage(json!({"op": "list", "options": options}))
            .await?;
        Ok(serde_json::from_value(entries)?)
    }

    /// Scheduled alarm time in epoch milliseconds
    pub async fn get_alarm(&self) -> Result<Option<i64>, BridgeError> {
        let time = self.alarm(json!({"op": "get"})).await?;
        Ok(time.as_i64())
    }

    /// Schedule the alarm
    pub async fn set_alarm(&self, scheduled_time: i64) -> Result<(), BridgeError> {
        self.alarm(json!({"op": "set", "scheduled_time": scheduled_time}))
            .await
            .map(|_| ())
    }

    /// Cancel the alarm
    pub async fn delete_alarm(&self) -> Result<(), BridgeError> {
        self.alarm(json!({"op": "delete"})).await.map(|_| ())
    }
}

/// What a guest actor sees of itself
pub struct ActorContext {
    handle: Handle,
    bridge: HostBridge,
    metadata: RwLock<ActorMetadata>,
    storage: ActorStorage,
}

impl ActorContext {
    /// Create a context for `handle`
    pub fn new(bridge: HostBridge, handle: impl Into<Handle>, metadata: ActorMetadata) -> Self {
        let handle = handle.into();
        Self {
            storage: ActorStorage::new(bridge.clone(), handle.clone()),
            handle,
            bridge,
            metadata: RwLock::new(metadata),
        }
    }

    /// The long-lived actor handle
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Current metadata
    pub fn metadata(&self) -> ActorMetadata {
        self.metadata.read().clone()
    }

    /// Object id, if the host supplied one
    pub fn id(&self) -> Option<String> {
        self.metadata.read().object_id.clone()
    }

    /// Object name, if the host supplied one
    pub fn name(&self) -> Option<String> {
        self.metadata.read().object_name.clone()
    }

    /// Storage and alarm
    pub fn storage(&self) -> &ActorStorage {
        &self.storage
    }

    /// Host capabilities
    pub fn bridge(&self) -> &HostBridge {
        &self.bridge
    }

    pub(crate) fn refresh(&self, metadata: ActorMetadata) {
        *self.metadata.write() = metadata;
    }
}

/// Guest actor implementation
#[async_trait]
pub trait GuestActor: Send + Sync {
    /// Handle a request addressed to this actor
    async fn fetch(&self, ctx: &ActorContext, request: HostRequest) -> anyhow::Result<GuestValue>;

    /// Handle the actor's alarm
    async fn alarm(&self, _ctx: &ActorContext) -> anyhow::Result<GuestValue> {
        Ok(GuestValue::Nil)
    }
}

/// Builds the guest actor for a newly activated handle
pub type ActorFactory = Arc<dyn Fn(&ActorContext) -> Arc<dyn GuestActor> + Send + Sync>;

/// A live guest actor and its context
pub struct ActorInstance {
    context: Arc<ActorContext>,
    actor: Arc<dyn GuestActor>,
}

impl ActorInstance {
    /// The actor's context
    pub fn context(&self) -> &Arc<ActorContext> {
        &self.context
    }

    /// Dispatch a request
    pub async fn fetch(&self, request: HostRequest) -> anyhow::Result<GuestValue> {
        self.actor.fetch(&self.context, request).await
    }

    /// Dispatch the alarm
    pub async fn alarm(&self) -> anyhow::Result<GuestValue> {
        self.actor.alarm(&self.context).await
    }
}

/// Guest actor instances by handle, with one factory per binding
#[derive(Default)]
pub struct ActorCache {
    factories: HashMap<String, ActorFactory>,
    instances: DashMap<Handle, Arc<ActorInstance>>,
}

impl ActorCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache over an existing factory table
    pub fn with_factories(factories: HashMap<String, ActorFactory>) -> Self {
        Self {
            factories,
            instances: DashMap::new(),
        }
    }

    /// Register the factory for actors of `binding`
    pub fn register<F>(&mut self, binding: impl Into<String>, factory: F)
    where
        F: Fn(&ActorContext) -> Arc<dyn GuestActor> + Send + Sync + 'static,
    {
        self.factories.insert(binding.into(), Arc::new(factory));
    }

    /// Whether a factory exists for `binding`
    pub fn has_binding(&self, binding: &str) -> bool {
        self.factories.contains_key(binding)
    }

    /// The instance for `handle`, built on first use.
    ///
    /// An existing instance is kept and its metadata replaced.
    pub fn activate(
        &self,
        bridge: &HostBridge,
        handle: &str,
        metadata: ActorMetadata,
    ) -> Result<Arc<ActorInstance>, BridgeError> {
        if let Some(instance) = self.instances.get(handle) {
            instance.context.refresh(metadata);
            return Ok(Arc::clone(instance.value()));
        }

        let factory = self
            .factories
            .get(&metadata.binding)
            .ok_or_else(|| BridgeError::binding_not_found(metadata.binding.clone()))?;

        debug!(handle = %handle, binding = %metadata.binding, "Activating actor");
        let context = Arc::new(ActorContext::new(bridge.clone(), handle, metadata));
        let actor = factory(&context);
        let instance = Arc::new(ActorInstance { context, actor });
        self.instances
            .insert(handle.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Drop the cached instance for `handle`
    pub fn evict(&self, handle: &str) -> bool {
        self.instances.remove(handle).is_some()
    }

    /// Whether `handle` has a cached instance
    pub fn contains(&self, handle: &str) -> bool {
        self.instances.contains_key(handle)
    }

    /// Number of cached instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Address of an actor within a namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StubTarget {
    /// Derived from a name
    Name(String),
    /// An existing object id
    Id(String),
}

/// Request forwarded to an actor through a stub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubRequest {
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// Path
    #[serde(default = "default_path")]
    pub path: String,
    /// Headers
    #[serde(default)]
    pub headers: Headers,
    /// Query parameters
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Raw body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

impl Default for StubRequest {
    fn default() -> Self {
        Self {
            method: default_method(),
            path: default_path(),
            headers: Headers::new(),
            query: BTreeMap::new(),
            body: None,
            json: None,
        }
    }
}

impl StubRequest {
    /// Create a request
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Add a query parameter
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Set a raw body
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a JSON body
    pub fn with_json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }

    /// Reject a request carrying both `body` and `json`
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.body.is_some() && self.json.is_some() {
            return Err(BridgeError::invalid_argument(
                "Stub request may carry either body or json, not both",
            ));
        }
        if !self.path.starts_with('/') {
            return Err(BridgeError::invalid_argument(format!(
                "Stub request path must start with '/': {}",
                self.path
            )));
        }
        Ok(())
    }
}

/// Guest-side stub for calling another actor
#[derive(Debug, Clone)]
pub struct ActorStub {
    bridge: HostBridge,
    binding: String,
    target: StubTarget,
}

impl ActorStub {
    /// Create a stub
    pub fn new(bridge: HostBridge, binding: impl Into<String>, target: StubTarget) -> Self {
        Self {
            bridge,
            binding: binding.into(),
            target,
        }
    }

    /// The addressed actor
    pub fn target(&self) -> &StubTarget {
        &self.target
    }

    /// Send a request to the actor
    pub async fn fetch(&self, request: StubRequest) -> Result<HostResponse, BridgeError> {
        let payload = json!({
            "binding": self.binding,
            "target": self.target,
            "request": request,
        });
        let result = self
            .bridge
            .call(HostCapability::StubFetch, vec![payload.to_string()])
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}
