//! Streaming rewrite host function.
//!
//! The host owns the native rewriter; each token a guest handler declared
//! interest in is sent back into the guest, one round trip at a time.

use super::{arg, host_fn, HostFn, HostState};
use crate::envelope::{parse_request, respond};
use crate::rewrite::html::{EventSink, NativeRewriter};
use crate::rewrite::{EventKind, RewriteCommand, TransformRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Delivers native rewriter events to the guest dispatcher
struct GuestSink {
    state: Arc<HostState>,
}

#[async_trait]
impl EventSink for GuestSink {
    async fn deliver(
        &mut self,
        handler_id: &str,
        kind: EventKind,
        payload: Value,
    ) -> Vec<RewriteCommand> {
        self.state.metrics.record_rewrite_event();
        self.state
            .rewrite
            .dispatch_event(handler_id, kind, payload)
            .await
    }
}

/// `rewrite_transform`
pub fn rewrite_transform(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let request: TransformRequest = parse_request(&arg(&args, 0, "payload")?)?;
                let rewriter = NativeRewriter::from_request(&request)?;

                debug!(
                    element_handlers = request.element_handlers.len(),
                    document_handlers = request.document_handlers.len(),
                    "Rewrite transform"
                );

                let mut response = request.response;
                let mut sink = GuestSink {
                    state: Arc::clone(&state),
                };
                response.body = rewriter.run(&response.body, &mut sink).await;
                response.headers.remove("content-length");

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
    use crate::host::HostEnv;
    use crate::rewrite::guest::{ContentType, ElementHandlers, GuestHandler};
    use serde_json::json;

    #[tokio::test]
    async fn test_transform_round_trip() {
        let state = state_for(HostEnv::new());
        let handlers = state.rewrite.handlers();
        let scope = handlers.new_scope();
        let id = handlers
            .register(
                scope,
                GuestHandler::Element(ElementHandlers::new().element(|el| {
                    el.set_attribute("rel", "noopener");
                    el.append(" ↗", ContentType::Text);
                    Ok(())
                })),
            )
            .unwrap();

        let f = rewrite_transform(Arc::clone(&state));
        let payload = json!({
            "options": {},
            "elementHandlers": [{"selector": "a[href^=http]", "handlerId": id, "methods": ["element"]}],
            "documentHandlers": [],
            "response": {
                "body": "<a href=\"https://x.test\">x</a><a href=\"/local\">y</a>",
                "status": 200,
                "headers": {"content-type": "text/html", "content-length": "48"}
            }
        })
        .to_string();

        let result = call(&f, &[&payload]).await.into_result().unwrap();
        assert_eq!(
            result["body"],
            json!("<a href=\"https://x.test\" rel=\"noopener\">x ↗</a><a href=\"/local\">y</a>")
        );
        assert!(result["headers"].get("content-length").is_none());
        assert_eq!(result["headers"]["content-type"], json!("text/html"));
        assert_eq!(state.metrics.rewrite_events(), 1);
    }

    #[tokio::test]
    async fn test_bad_selector_is_invalid_argument() {
        let f = rewrite_transform(state_for(HostEnv::new()));
        let payload = json!({
            "elementHandlers": [{"selector": "a:hover", "handlerId": "rw:0:0", "methods": ["element"]}],
            "response": {"body": "<a></a>"}
        })
        .to_string();
        let envelope = call(&f, &[&payload]).await;
        assert_eq!(envelope.error.unwrap().name, "ArgumentError");
    }

    #[tokio::test]
    async fn test_missing_response_is_malformed() {
        let f = rewrite_transform(state_for(HostEnv::new()));
        let envelope = call(&f, &[r#"{"elementHandlers":[]}"#]).await;
        assert_eq!(envelope.error.unwrap().name, "MalformedRequestError");
    }
}
