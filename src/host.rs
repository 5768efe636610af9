//! Host environment and native capability traits.
//!
//! These are the asynchronous capabilities only the host can provide. The
//! bridge never exposes them to guest code directly: host functions wrap
//! each one and answer with a Call Envelope.

use crate::actor::{StubRequest, StubTarget};
use crate::capability::BindingRegistry;
use crate::context::{Headers, HostResponse};
use crate::error::BridgeError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Options for listing actor storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    /// Only keys starting with this prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// First key (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Last key (exclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Maximum number of entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Descending key order
    #[serde(default)]
    pub reverse: bool,
}

/// Per-actor durable storage and alarm slot
#[async_trait]
pub trait DurableStorage: Send + Sync {
    /// Read one key
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// Write one key
    async fn put(&self, key: &str, value: Value) -> anyhow::Result<()>;

    /// Delete one key, returning whether it existed
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// Delete every key
    async fn delete_all(&self) -> anyhow::Result<()>;

    /// Ordered listing
    async fn list(&self, options: &ListOptions) -> anyhow::Result<Vec<(String, Value)>>;

    /// Scheduled alarm time in epoch milliseconds
    async fn get_alarm(&self) -> anyhow::Result<Option<i64>>;

    /// Schedule the alarm
    async fn set_alarm(&self, scheduled_time: i64) -> anyhow::Result<()>;

    /// Cancel the alarm
    async fn delete_alarm(&self) -> anyhow::Result<()>;
}

/// Row-store query action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryAction {
    /// All rows as objects
    #[default]
    All,
    /// First row or null
    First,
    /// Execute, returning run metadata
    Run,
    /// Rows as arrays
    Raw,
}

/// Document/row storage binding
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Run one statement
    async fn query(&self, sql: &str, bindings: &[Value], action: QueryAction)
        -> anyhow::Result<Value>;
}

/// Outbound request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    /// Absolute URL
    pub url: String,
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// Request headers
    #[serde(default)]
    pub headers: Headers,
    /// Request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Outbound network access
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform a request
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<HostResponse>;
}

/// Managed inference binding
#[async_trait]
pub trait InferenceBinding: Send + Sync {
    /// Run a model
    async fn run(&self, model: &str, input: Value) -> anyhow::Result<Value>;
}

/// Vector index operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VectorOperation {
    /// Nearest-neighbour query
    Query,
    /// Insert new vectors
    Insert,
    /// Insert or replace vectors
    Upsert,
    /// Fetch vectors by id
    GetByIds,
    /// Delete vectors by id
    DeleteByIds,
}

/// Vector search binding
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Run an operation
    async fn call(&self, op: VectorOperation, args: Value) -> anyhow::Result<Value>;
}

/// Namespace of durable actors addressable through stubs
#[async_trait]
pub trait ActorNamespace: Send + Sync {
    /// Forward a request to the actor named by `target`
    async fn fetch(&self, target: &StubTarget, request: StubRequest)
        -> anyhow::Result<HostResponse>;
}

/// Error reported by guest code or by the bridge on the guest's behalf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Error message
    pub message: String,
    /// Error class name
    #[serde(default = "default_error_name")]
    pub name: String,
    /// Stack trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Where it happened (dispatch kind, handler id, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl ErrorReport {
    /// Build a report from a bridge error
    pub fn from_error(error: &BridgeError, context: Value) -> Self {
        Self {
            message: error.message.clone(),
            name: error.name.clone(),
            stack: error.stack.clone(),
            context: Some(context),
        }
    }
}

/// Destination for error reports
#[async_trait]
pub trait ErrorSink: Send + Sync {
    /// Record a report
    async fn report(&self, report: ErrorReport) -> anyhow::Result<()>;
}

/// Everything the host exposes to one guest runtime
#[derive(Clone, Default)]
pub struct HostEnv {
    vars: HashMap<String, String>,
    row_stores: HashMap<String, Arc<dyn RowStore>>,
    http: Option<Arc<dyn HttpClient>>,
    inference: HashMap<String, Arc<dyn InferenceBinding>>,
    vectors: HashMap<String, Arc<dyn VectorIndex>>,
    actors: HashMap<String, Arc<dyn ActorNamespace>>,
    bindings: BindingRegistry,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

impl HostEnv {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Add a row store
    pub fn with_row_store(mut self, name: impl Into<String>, store: Arc<dyn RowStore>) -> Self {
        self.row_stores.insert(name.into(), store);
        self
    }

    /// Set the outbound HTTP client
    pub fn with_http(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    /// Add an inference binding
    pub fn with_inference(
        mut self,
        name: impl Into<String>,
        binding: Arc<dyn InferenceBinding>,
    ) -> Self {
        self.inference.insert(name.into(), binding);
        self
    }

    /// Add a vector index
    pub fn with_vector_index(mut self, name: impl Into<String>, index: Arc<dyn VectorIndex>) -> Self {
        self.vectors.insert(name.into(), index);
        self
    }

    /// Add an actor namespace
    pub fn with_actor_namespace(
        mut self,
        name: impl Into<String>,
        namespace: Arc<dyn ActorNamespace>,
    ) -> Self {
        self.actors.insert(name.into(), namespace);
        self
    }

    /// Add a generic binding
    pub fn with_binding(
        mut self,
        name: impl Into<String>,
        binding: Arc<dyn crate::capability::Binding>,
    ) -> Self {
        self.bindings.insert(name, binding);
        self
    }

    /// Set the error sink
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Environment variables
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// Variable lookup
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Generic bindings
    pub fn bindings(&self) -> &BindingRegistry {
        &self.bindings
    }

    /// Row store by binding name
    pub fn row_store(&self, name: &str) -> Result<Arc<dyn RowStore>, BridgeError> {
        self.row_stores
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::binding_not_found(name))
    }

    /// HTTP client
    pub fn http(&self) -> Result<Arc<dyn HttpClient>, BridgeError> {
        self.http
            .clone()
            .ok_or_else(|| BridgeError::binding_not_found("fetch"))
    }

    /// Inference binding by name
    pub fn inference(&self, name: &str) -> Result<Arc<dyn InferenceBinding>, BridgeError> {
        self.inference
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::binding_not_found(name))
    }

    /// Vector index by name
    pub fn vector_index(&self, name: &str) -> Result<Arc<dyn VectorIndex>, BridgeError> {
        self.vectors
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::binding_not_found(name))
    }

    /// Actor namespace by name
    pub fn actor_namespace(&self, name: &str) -> Result<Arc<dyn ActorNamespace>, BridgeError> {
        self.actors
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::binding_not_found(name))
    }

    /// Error sink, if one is configured
    pub fn error_sink(&self) -> Option<Arc<dyn ErrorSink>> {
        self.error_sink.clone()
    }
}

impl fmt::Debug for HostEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut vars: Vec<_> = self.vars.keys().collect();
        vars.sort();
        f.debug_struct("HostEnv")
            .field("vars", &vars)
            .field("row_stores", &self.row_stores.keys().collect::<Vec<_>>())
            .field("http", &self.http.is_some())
            .field("inference", &self.inference.keys().collect::<Vec<_>>())
            .field("vectors", &self.vectors.keys().collect::<Vec<_>>())
            .field("actors", &self.actors.keys().collect::<Vec<_>>())
            .field("bindings", &self.bindings)
            .field("error_sink", &self.error_sink.is_some())
            .finish()
    }
}

/// In-memory [`DurableStorage`] with ordered keys
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Value>>,
    alarm: Mutex<Option<i64>>,
}

impl MemoryStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether storage is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DurableStorage for MemoryStorage {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn delete_all(&self) -> anyhow::Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn list(&self, options: &ListOptions) -> anyhow::Result<Vec<(String, Value)>> {
        let entries = self.entries.lock();
        let matching = entries.iter().filter(|(key, _)| {
            options
                .prefix
                .as_ref()
                .map_or(true, |p| key.starts_with(p.as_str()))
                && options.start.as_ref().map_or(true, |s| key.as_str() >= s.as_str())
                && options.end.as_ref().map_or(true, |e| key.as_str() < e.as_str())
        });

        let limit = options.limit.unwrap_or(usize::MAX);
        let listed: Vec<(String, Value)> = if options.reverse {
            matching
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            matching
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Ok(listed)
    }

    async fn get_alarm(&self) -> anyhow::Result<Option<i64>> {
        Ok(*self.alarm.lock())
    }

    async fn set_alarm(&self, scheduled_time: i64) -> anyhow::Result<()> {
        *self.alarm.lock() = Some(scheduled_time);
        Ok(())
    }

    async fn delete_alarm(&self) -> anyhow::Result<()> {
        *self.alarm.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    async fn seeded() -> MemoryStorage {
        let storage = MemoryStorage::new();
        for (k, v) in [("user:1", 1), ("user:2", 2), ("user:3", 3), ("post:1", 4)] {
            storage.put(k, json!(v)).await.unwrap();
        }
        storage
    }

    #[tokio::test]
    async fn test_list_prefix_limit_reverse() {
        let storage = seeded().await;
        let options = ListOptions {
            prefix: Some("user:".into()),
            limit: Some(2),
            reverse: true,
            ..Default::default()
        };
        let keys: Vec<_> = storage
            .list(&options)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["user:3", "user:2"]);
    }

    #[tokio::test]
    async fn test_list_range() {
        let storage = seeded().await;
        let options = ListOptions {
            start: Some("user:2".into()),
            end: Some("user:3".into()),
            ..Default::default()
        };
        let listed = storage.list(&options).await.unwrap();
        assert_eq!(listed, vec![("user:2".to_string(), json!(2))]);
    }

    #[tokio::test]
    async fn test_list_no_match_is_empty() {
        let storage = seeded().await;
        let options = ListOptions {
            prefix: Some("missing".into()),
            ..Default::default()
        };
        assert!(storage.list(&options).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alarm_slot() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_alarm().await.unwrap(), None);
        storage.set_alarm(1_700_000_000_000).await.unwrap();
        assert_eq!(storage.get_alarm().await.unwrap(), Some(1_700_000_000_000));
        storage.delete_alarm().await.unwrap();
        assert_eq!(storage.get_alarm().await.unwrap(), None);
    }

    #[test]
    fn test_env_missing_bindings() {
        let env = HostEnv::new().with_var("ENVIRONMENT", "test");
        assert_eq!(env.var("ENVIRONMENT"), Some("test"));
        assert_eq!(env.row_store("DB").err().unwrap().code, ErrorCode::BindingNotFound);
        assert!(env.http().is_err());
        assert!(env.error_sink().is_none());
    }

    #[test]
    fn test_error_report_from_error() {
        let error = BridgeError::guest("nope").with_stack("line 1");
        let report = ErrorReport::from_error(&error, json!({"dispatch": "fetch"}));
        assert_eq!(report.name, "GuestError");
        assert_eq!(report.stack.as_deref(), Some("line 1"));
    }
}
