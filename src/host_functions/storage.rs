//! Durable actor storage and alarm host functions.
//!
//! Both take `[handle, payload]`: the long-lived actor handle selects the
//! storage, the payload names the operation.

use super::{arg, host_fn, HostFn, HostState};
use crate::envelope::{parse_request, respond};
use crate::error::BridgeError;
use crate::host::{DurableStorage, ListOptions};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageOp {
    /// Read one key, or several with `keys`
    Get,
    /// Write one key
    Put,
    /// Delete one key
    Delete,
    /// Ordered listing
    List,
    /// Clear storage
    DeleteAll,
}

/// Storage op payload: `{op, key?, keys?, value?, options?}`
#[derive(Debug, Clone, Deserialize)]
pub struct StorageOpRequest {
    /// Operation
    pub op: StorageOp,
    /// Single key
    #[serde(default)]
    pub key: Option<String>,
    /// Several keys (multi-get)
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    /// Value to write
    #[serde(default)]
    pub value: Option<Value>,
    /// Listing options
    #[serde(default)]
    pub options: Option<ListOptions>,
}

/// Alarm operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlarmOp {
    /// Read the scheduled time
    Get,
    /// Schedule
    Set,
    /// Cancel
    Delete,
}

/// Alarm op payload: `{op, scheduled_time?, options?}`
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmOpRequest {
    /// Operation
    pub op: AlarmOp,
    /// Epoch milliseconds for `set`
    #[serde(default, alias = "scheduledTime")]
    pub scheduled_time: Option<i64>,
    /// Host-specific options, accepted and ignored
    #[serde(default)]
    pub options: Option<Value>,
}

/// `storage_op`
pub fn storage_op(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let handle = arg(&args, 0, "handle")?;
                let request: StorageOpRequest = parse_request(&arg(&args, 1, "payload")?)?;
                let slot = state.actors.lookup(&handle)?;
                debug!(handle = %handle, op = ?request.op, "Storage op");
                run_storage_op(slot.storage.as_ref(), request).await
            })
            .await
        }
    })
}

/// `alarm_op`
pub fn alarm_op(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let handle = arg(&args, 0, "handle")?;
                let request: AlarmOpRequest = parse_request(&arg(&args, 1, "payload")?)?;
                let slot = state.actors.lookup(&handle)?;
                debug!(handle = %handle, op = ?request.op, "Alarm op");
                run_alarm_op(slot.storage.as_ref(), request).await
            })
            .await
        }
    })
}

fn required_key(request: &StorageOpRequest) -> Result<&str, BridgeError> {
    request
        .key
        .as_deref()
        .ok_or_else(|| BridgeError::malformed_request("Missing field: key"))
}

async fn run_storage_op(
    storage: &dyn DurableStorage,
    request: StorageOpRequest,
) -> Result<Value, BridgeError> {
    let host = |e: anyhow::Error| BridgeError::host(&e);

    match request.op {
        StorageOp::Get => {
            if let Some(keys) = &request.keys {
                let mut found = Map::new();
                for key in keys {
                    if let Some(value) = storage.get(key).await.map_err(host)? {
                        found.insert(key.clone(), value);
                    }
                }
                return Ok(Value::Object(found));
            }
            let key = required_key(&request)?;
            Ok(storage.get(key).await.map_err(host)?.unwrap_or(Value::Null))
        }
        StorageOp::Put => {
            let key = required_key(&request)?;
            let value = request.value.clone().unwrap_or(Value::Null);
            storage.put(key, value).await.map_err(host)?;
            Ok(Value::Null)
        }
        StorageOp::Delete => {
            let key = required_key(&request)?;
            Ok(Value::Bool(storage.delete(key).await.map_err(host)?))
        }
        StorageOp::List => {
            let options = request.options.unwrap_or_default();
            let entries = storage.list(&options).await.map_err(host)?;
            Ok(Value::Array(
                entries
                    .into_iter()
                    .map(|(key, value)| Value::Array(vec![Value::String(key), value]))
                    .collect(),
            ))
        }
        StorageOp::DeleteAll => {
            storage.delete_all().await.map_err(host)?;
            Ok(Value::Null)
        }
    }
}

async fn run_alarm_op(
    storage: &dyn DurableStorage,
    request: AlarmOpRequest,
) -> Result<Value, BridgeError> {
    let host = |e: anyhow::Error| BridgeError::host(&e);

    match request.op {
        AlarmOp::Get => Ok(storage
            .get_alarm()
            .await
            .map_err(host)?
            .map(Value::from)
            .unwrap_or(Value::Null)),
        AlarmOp::Set => {
            let time = request
                .scheduled_time
                .ok_or_else(|| BridgeError::malformed_request("Missing field: scheduled_time"))?;
            storage.set_alarm(time).await.map_err(host)?;
            Ok(Value::Null)
        }
        AlarmOp::Delete => {
            storage.delete_alarm().await.map_err(host)?;
            Ok(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, state_for};
    use super::*;
    use crate::actor::ActorSlot;
    use crate::host::{HostEnv, MemoryStorage};
    use async_trait::async_trait;
    use serde_json::json;

    fn with_actor(storage: Arc<dyn DurableStorage>) -> (Arc<HostState>, String) {
        let state = state_for(HostEnv::new());
        let handle = state.actors.insert(
            "actor",
            ActorSlot::new("COUNTER", "room-1", storage),
        );
        (state, handle)
    }

    #[tokio::test]
    async fn test_get_unset_key_twice_is_null() {
        let (state, handle) = with_actor(Arc::new(MemoryStorage::new()));
        let f = storage_op(state);
        for _ in 0..2 {
            let envelope = call(&f, &[&handle, r#"{"op":"get","key":"missing"}"#]).await;
            assert!(envelope.ok);
            assert_eq!(envelope.into_result().unwrap(), Value::Null);
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (state, handle) = with_actor(Arc::new(MemoryStorage::new()));
        let f = storage_op(state);

        call(&f, &[&handle, r#"{"op":"put","key":"n","value":{"count":3}}"#]).await;
        let got = call(&f, &[&handle, r#"{"op":"get","key":"n"}"#]).await;
        assert_eq!(got.result, Some(json!({"count": 3})));

        let deleted = call(&f, &[&handle, r#"{"op":"delete","key":"n"}"#]).await;
        assert_eq!(deleted.result, Some(json!(true)));
        let deleted = call(&f, &[&handle, r#"{"op":"delete","key":"n"}"#]).await;
        assert_eq!(deleted.result, Some(json!(false)));
    }

    #[tokio::test]
    async fn test_multi_get_skips_missing() {
        let (state, handle) = with_actor(Arc::new(MemoryStorage::new()));
        let f = storage_op(state);
        call(&f, &[&handle, r#"{"op":"put","key":"a","value":1}"#]).await;
        let got = call(&f, &[&handle, r#"{"op":"get","keys":["a","b"]}"#]).await;
        assert_eq!(got.result, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_list_empty_is_empty_array() {
        let (state, handle) = with_actor(Arc::new(MemoryStorage::new()));
        let f = storage_op(state);
        let listed = call(&f, &[&handle, r#"{"op":"list","options":{"prefix":"x"}}"#]).await;
        assert!(listed.ok);
        assert_eq!(listed.result, Some(json!([])));
    }

    #[tokio::test]
    async fn test_list_reverse_keeps_order() {
        let (state, handle) = with_actor(Arc::new(MemoryStorage::new()));
        let f = storage_op(state);
        for key in ["k1", "k2", "k3"] {
            let payload = json!({"op": "put", "key": key, "value": key}).to_string();
            call(&f, &[&handle, &payload]).await;
        }
        let listed = call(
            &f,
            &[&handle, r#"{"op":"list","options":{"reverse":true,"limit":2}}"#],
        )
        .await;
        assert_eq!(listed.result, Some(json!([["k3", "k3"], ["k2", "k2"]])));
    }

    #[tokio::test]
    async fn test_unknown_handle_and_bad_payload() {
        let (state, handle) = with_actor(Arc::new(MemoryStorage::new()));
        let f = storage_op(state);

        let envelope = call(&f, &["actor:99:00000000", r#"{"op":"get","key":"a"}"#]).await;
        assert_eq!(envelope.error.unwrap().name, "HandleNotActiveError");

        let envelope = call(&f, &["", r#"{"op":"get","key":"a"}"#]).await;
        assert_eq!(envelope.error.unwrap().name, "HandleMalformedError");

        let envelope = call(&f, &[&handle, "{not json"]).await;
        assert_eq!(envelope.error.unwrap().name, "MalformedRequestError");

        let envelope = call(&f, &[&handle, r#"{"op":"get"}"#]).await;
        assert!(envelope.error.unwrap().message.contains("key"));
    }

    struct Broken;

    #[async_trait]
    impl DurableStorage for Broken {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<Value>> {
            anyhow::bail!("replica unavailable")
        }
        async fn put(&self, _key: &str, _value: Value) -> anyhow::Result<()> {
            anyhow::bail!("replica unavailable")
        }
        async fn delete(&self, _key: &str) -> anyhow::Result<bool> {
            anyhow::bail!("replica unavailable")
        }
        async fn delete_all(&self) -> anyhow::Result<()> {
            anyhow::bail!("replica unavailable")
        }
        async fn list(&self, _options: &ListOptions) -> anyhow::Result<Vec<(String, Value)>> {
            anyhow::bail!("replica unavailable")
        }
        async fn get_alarm(&self) -> anyhow::Result<Option<i64>> {
            anyhow::bail!("replica unavailable")
        }
        async fn set_alarm(&self, _scheduled_time: i64) -> anyhow::Result<()> {
            anyhow::bail!("replica unavailable")
        }
        async fn delete_alarm(&self) -> anyhow::Result<()> {
            anyhow::bail!("replica unavailable")
        }
    }

    #[tokio::test]
    async fn test_host_rejection_passes_through() {
        let (state, handle) = with_actor(Arc::new(Broken));
        let f = storage_op(state);
        let envelope = call(&f, &[&handle, r#"{"op":"get","key":"a"}"#]).await;
        let error = envelope.error.unwrap();
        assert_eq!(error.name, "HostError");
        assert_eq!(error.message, "replica unavailable");
    }

    #[tokio::test]
    async fn test_alarm_ops() {
        let (state, handle) = with_actor(Arc::new(MemoryStorage::new()));
        let f = alarm_op(state);

        let envelope = call(&f, &[&handle, r#"{"op":"get"}"#]).await;
        assert_eq!(envelope.into_result().unwrap(), Value::Null);

        call(&f, &[&handle, r#"{"op":"set","scheduled_time":1700000000000}"#]).await;
        let envelope = call(&f, &[&handle, r#"{"op":"get"}"#]).await;
        assert_eq!(envelope.result, Some(json!(1_700_000_000_000i64)));

        call(&f, &[&handle, r#"{"op":"delete"}"#]).await;
        let envelope = call(&f, &[&handle, r#"{"op":"get"}"#]).await;
        assert_eq!(envelope.into_result().unwrap(), Value::Null);

        let envelope = call(&f, &[&handle, r#"{"op":"set"}"#]).await;
        assert_eq!(envelope.error.unwrap().name, "MalformedRequestError");
    }
}
