//! Outbound fetch and actor-stub fetch host functions.
//!
//! A timed-out outbound call resolves to a `TIMEOUT` envelope; it is never
//! left as an unhandled failure.

use super::{arg, host_fn, HostFn, HostState};
use crate::actor::{StubRequest, StubTarget};
use crate::envelope::{parse_request, respond};
use crate::error::BridgeError;
use crate::host::FetchRequest;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Actor-stub fetch payload: `{binding, target, request}`
#[derive(Debug, Clone, Deserialize)]
pub struct StubFetchRequest {
    /// Actor namespace binding
    pub binding: String,
    /// Actor address
    pub target: StubTarget,
    /// Request forwarded to the actor
    #[serde(default)]
    pub request: StubRequest,
}

/// `http_fetch`
pub fn http_fetch(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let request: FetchRequest = parse_request(&arg(&args, 0, "payload")?)?;
                if request.url.trim().is_empty() {
                    return Err(BridgeError::invalid_argument("Fetch url must not be empty"));
                }
                let client = state.env.http()?;

                debug!(method = %request.method, url = %request.url, "Outbound fetch");
                let pending = client.fetch(request);
                let response = if state.fetch_timeout_ms == 0 {
                    pending.await
                } else {
                    match timeout(Duration::from_millis(state.fetch_timeout_ms), pending).await {
                        Ok(response) => response,
                        Err(_) => {
                            warn!(timeout_ms = state.fetch_timeout_ms, "Outbound fetch timed out");
                            return Err(BridgeError::timeout(state.fetch_timeout_ms));
                        }
                    }
                };

                let response = response.map_err(|e| BridgeError::host(&e))?;
                Ok(serde_json::to_value(response)?)
            })
            .await
        }
    })
}

/// `stub_fetch`
pub fn stub_fetch(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let payload: StubFetchRequest = parse_request(&arg(&args, 0, "payload")?)?;
                payload.request.validate()?;
                let namespace = state.env.actor_namespace(&payload.binding)?;

                debug!(binding = %payload.binding, target = ?payload.target, "Actor stub fetch");
                let response = namespace
                    .fetch(&payload.target, payload.request)
                    .await
                    .map_err(|e| BridgeError::host(&e))?;
                Ok(serde_json::to_value(response)?)
            })
            .await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{call, state_for};
    use super::*;
    use crate::context::HostResponse;
    use crate::host::{ActorNamespace, HostEnv, HttpClient};
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl HttpClient for Echo {
        async fn fetch(&self, request: FetchRequest) -> anyhow::Result<HostResponse> {
            Ok(HostResponse::ok(format!("{} {}", request.method, request.url)))
        }
    }

    struct Slow;

    #[async_trait]
    impl HttpClient for Slow {
        async fn fetch(&self, _request: FetchRequest) -> anyhow::Result<HostResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(HostResponse::ok("late"))
        }
    }

    struct Rooms;

    #[async_trait]
    impl ActorNamespace for Rooms {
        async fn fetch(
            &self,
            target: &StubTarget,
            request: StubRequest,
        ) -> anyhow::Result<HostResponse> {
            let who = match target {
                StubTarget::Name(name) => format!("name={}", name),
                StubTarget::Id(id) => format!("id={}", id),
            };
            Ok(HostResponse::ok(format!("{} {} {}", who, request.method, request.path)))
        }
    }

    #[tokio::test]
    async fn test_http_fetch() {
        let f = http_fetch(state_for(HostEnv::new().with_http(Arc::new(Echo))));
        let envelope = call(&f, &[r#"{"url":"https://example.com/a"}"#]).await;
        assert_eq!(
            envelope.result.unwrap()["body"],
            json!("GET https://example.com/a")
        );
    }

    #[tokio::test]
    async fn test_http_fetch_timeout_is_envelope() {
        let f = http_fetch(state_for(HostEnv::new().with_http(Arc::new(Slow))));
        let envelope = call(&f, &[r#"{"url":"https://example.com"}"#]).await;
        assert!(!envelope.ok);
        assert_eq!(envelope.error.unwrap().name, "TimeoutError");
    }

    #[tokio::test]
    async fn test_http_fetch_without_client() {
        let f = http_fetch(state_for(HostEnv::new()));
        let envelope = call(&f, &[r#"{"url":"https://example.com"}"#]).await;
        assert_eq!(envelope.error.unwrap().name, "BindingNotFoundError");
    }

    #[tokio::test]
    async fn test_stub_fetch_by_name() {
        let f = stub_fetch(state_for(
            HostEnv::new().with_actor_namespace("ROOMS", Arc::new(Rooms)),
        ));
        let payload = json!({
            "binding": "ROOMS",
            "target": {"type": "name", "value": "lobby"},
            "request": {"method": "POST", "path": "/join", "json": {"user": 1}}
        })
        .to_string();
        let envelope = call(&f, &[&payload]).await;
        assert_eq!(envelope.result.unwrap()["body"], json!("name=lobby POST /join"));
    }

    #[tokio::test]
    async fn test_stub_fetch_rejects_body_and_json() {
        let f = stub_fetch(state_for(
            HostEnv::new().with_actor_namespace("ROOMS", Arc::new(Rooms)),
        ));
        let payload = json!({
            "binding": "ROOMS",
            "target": {"type": "id", "value": "abc"},
            "request": {"body": "x", "json": {"y": 1}}
        })
        .to_string();
        let envelope = call(&f, &[&payload]).await;
        assert_eq!(envelope.error.unwrap().name, "ArgumentError");
    }
}
