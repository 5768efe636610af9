//! Queue settlement host functions.

use super::{arg, host_fn, HostFn, HostState};
use crate::envelope::{parse_request, respond};
use crate::error::BridgeError;
use crate::queue::QueueOpRequest;
use serde_json::Value;
use std::sync::Arc;

/// `queue_message_op`: `{handle, op: "ack"|"retry", delaySeconds?}`
pub fn message_op(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let request: QueueOpRequest = parse_request(&arg(&args, 0, "payload")?)?;
                if request.handle.trim().is_empty() {
                    return Err(BridgeError::handle_malformed());
                }
                state
                    .queues
                    .settle_message(&request.handle, request.op, request.delay_seconds)
                    .await?;
                Ok(Value::Null)
            })
            .await
        }
    })
}

/// `queue_batch_op`: `{handle, op: "ack_all"|"retry_all", delaySeconds?}`
pub fn batch_op(state: Arc<HostState>) -> HostFn {
    host_fn(move |args| {
        let state = Arc::clone(&state);
        async move {
            let masker = state.masker.clone();
            respond(&masker, async move {
                let request: QueueOpRequest = parse_request(&arg(&args, 0, "payload")?)?;
                if request.handle.trim().is_empty() {
                    return Err(BridgeError::handle_malformed());
                }
                state
                    .queues
                    .settle_batch(&request.handle, request.op, request.delay_seconds)
                    .await?;
                Ok(Value::Null)
            })
            .await
        }
    })
}
