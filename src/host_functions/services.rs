//! Row store, inference, vector and generic binding host functions.

use super::{arg, host_fn, HostFn, HostState};
use crate::envelope::{parse_request, respond};
use crate::error::BridgeError;
use crate::host::{QueryAction, VectorOperation};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Row-store payload: `{binding, sql, bindings?, action?}`
#[derive(Debug, Clone, Deserialize)]
pub struct RowStoreRequest {
    /// Row store binding
    pub binding: String,
    /// Statement
    pub sql: String,
    /// Positional parameters
    #[serde(default)]
    pub bindings: Vec<Value>,
    /// Result shape
    #[serde(default)]
    pub action: QueryAction,
}

/// Inference payload: `{binding?, model, input?}`
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceRequest {
    /// Inference binding, `AI` when omitted
    #[serde(default = "default_inference_binding")]
    pub binding: String,
    /// Model name
    pub model: String,
    /// Model input
    #[serde(default)]
    pub input: Value,
}

/// Vector payload: `{binding, op, args?}`
#[derive(Debug, Clone, Deserialize)]
pub struct VectorRequest {
    /// Vector index binding
    pub binding: String,
    /// Operation
    pub op: VectorOperation,
    /// Operation arguments
    #[serde(default)]
    pub args: Value,
}

/// Generic binding payload: `{name, method, args?}`
#[derive(Debug, Clone, Deserialize)]
pub struct BindingCallRequest {
    /// Binding name
    pub name: String,
    /// Method name
    pub method: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
}

fn default_inference_binding() -> String {
    "AI".to_string()
}

/// `row_store_query`
pub fn row_store_query(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let request: RowStoreRequest = parse_request(&arg(&args, 0, "payload")?)?;
                if request.sql.trim().is_empty() {
                    return Err(BridgeError::invalid_argument("SQL statement must not be empty"));
                }
                let store = state.env.row_store(&request.binding)?;

                debug!(binding = %request.binding, action = ?request.action, "Row store query");
                store
                    .query(&request.sql, &request.bindings, request.action)
                    .await
                    .map_err(|e| BridgeError::host(&e))
            })
            .await
        }
    })
}

/// `invoke_inference`
pub fn invoke_inference(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let request: InferenceRequest = parse_request(&arg(&args, 0, "payload")?)?;
                if request.model.trim().is_empty() {
                    return Err(BridgeError::invalid_argument("Model name must not be empty"));
                }
                let binding = state.env.inference(&request.binding)?;

                debug!(binding = %request.binding, model = %request.model, "Invoke inference");
                binding
                    .run(&request.model, request.input)
                    .await
                    .map_err(|e| BridgeError::host(&e))
            })
            .await
        }
    })
}

/// `vector_op`
pub fn vector_op(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let request: VectorRequest = parse_request(&arg(&args, 0, "payload")?)?;
                let index = state.env.vector_index(&request.binding)?;

                debug!(binding = %request.binding, op = ?request.op, "Vector op");
                index
                    .call(request.op, request.args)
                    .await
                    .map_err(|e| BridgeError::host(&e))
            })
            .await
        }
    })
}

/// `call_binding`
pub fn call_binding(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let request: BindingCallRequest = parse_request(&arg(&args, 0, "payload")?)?;
                debug!(binding = %request.name, method = %request.method, "Binding call");
                state
                    .env
                    .bindings()
                    .call(&request.name, &request.method, request.args)
                    .await
            })
            .await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, state_for};
    use super::*;
    use crate::capability::Binding;
    use crate::host::{HostEnv, InferenceBinding, RowStore, VectorIndex};
    use async_trait::async_trait;
    use serde_json::json;

    struct Rows;

    #[async_trait]
    impl RowStore for Rows {
        async fn query(
            &self,
            sql: &str,
            bindings: &[Value],
            action: QueryAction,
        ) -> anyhow::Result<Value> {
            match action {
                QueryAction::First => Ok(json!({"sql": sql, "id": bindings[0]})),
                QueryAction::Run => Ok(json!({"changes": 1})),
                QueryAction::All | QueryAction::Raw => {
                    anyhow::bail!("no such table: users")
                }
            }
        }
    }

    struct Model;

    #[async_trait]
    impl InferenceBinding for Model {
        async fn run(&self, model: &str, input: Value) -> anyhow::Result<Value> {
            Ok(json!({"model": model, "echo": input}))
        }
    }

    struct Index;

    #[async_trait]
    impl VectorIndex for Index {
        async fn call(&self, op: VectorOperation, args: Value) -> anyhow::Result<Value> {
            Ok(json!({"op": op, "args": args}))
        }
    }

    struct Greeter;

    #[async_trait]
    impl Binding for Greeter {
        fn methods(&self) -> Vec<String> {
            vec!["greet".into()]
        }

        async fn call(&self, _method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
            Ok(json!(format!("hello {}", args[0].as_str().unwrap_or("?"))))
        }
    }

    #[tokio::test]
    async fn test_row_store_actions() {
        let f = row_store_query(state_for(HostEnv::new().with_row_store("DB", Arc::new(Rows))));

        let first = call(
            &f,
            &[r#"{"binding":"DB","sql":"select * from users where id = ?","bindings":[7],"action":"first"}"#],
        )
        .await;
        assert_eq!(first.result.unwrap()["id"], json!(7));

        let failed = call(&f, &[r#"{"binding":"DB","sql":"select 1"}"#]).await;
        assert_eq!(failed.error.unwrap().message, "no such table: users");

        let missing = call(&f, &[r#"{"binding":"OTHER","sql":"select 1"}"#]).await;
        assert_eq!(missing.error.unwrap().name, "BindingNotFoundError");
    }

    #[tokio::test]
    async fn test_inference_default_binding() {
        let f = invoke_inference(state_for(HostEnv::new().with_inference("AI", Arc::new(Model))));
        let envelope = call(&f, &[r#"{"model":"embed-small","input":{"text":"hi"}}"#]).await;
        assert_eq!(envelope.result.unwrap()["model"], json!("embed-small"));
    }

    #[tokio::test]
    async fn test_vector_op_names() {
        let f = vector_op(state_for(
            HostEnv::new().with_vector_index("VECTORS", Arc::new(Index)),
        ));
        let envelope = call(&f, &[r#"{"binding":"VECTORS","op":"getByIds","args":["a"]}"#]).await;
        assert_eq!(envelope.result.unwrap()["op"], json!("getByIds"));

        let envelope = call(&f, &[r#"{"binding":"VECTORS","op":"truncate"}"#]).await;
        assert_eq!(envelope.error.unwrap().name, "MalformedRequestError");
    }

    #[tokio::test]
    async fn test_call_binding_resolution() {
        let f = call_binding(state_for(HostEnv::new().with_binding("GREETER", Arc::new(Greeter))));

        let envelope = call(&f, &[r#"{"name":"GREETER","method":"greet","args":["ana"]}"#]).await;
        assert_eq!(envelope.result, Some(json!("hello ana")));

        let envelope = call(&f, &[r#"{"name":"GREETER","method":"wave"}"#]).await;
        assert_eq!(envelope.error.unwrap().name, "MethodNotFoundError");
    }
}
