//! The Call Envelope: the only channel describing an outcome across the boundary.
//!
//! Every host capability answers with `{ok, result}` or `{ok: false, error}`
//! serialized to JSON. Nothing raised below [`respond`] escapes untranslated:
//! request parse failures, host rejections and panics are all folded into
//! the envelope shape.

use crate::config::ErrorMasking;
use crate::error::{BridgeError, ErrorCode};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error};

/// Error half of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    /// Message (generic when masked)
    pub message: String,
    /// Error class name
    pub name: String,
    /// Stack trace, omitted when masked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Wire shape of every bridge call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Whether the call succeeded
    pub ok: bool,
    /// Result value (present when `ok`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error details (present when not `ok`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

impl CallEnvelope {
    /// Successful envelope; a `null` result is still serialized
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed envelope with the error already masked
    pub fn failure(error: EnvelopeError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    /// Serialize to the wire string
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize envelope");
                r#"{"ok":false,"error":{"message":"Envelope serialization failed","name":"SerializationError"}}"#
                    .to_string()
            }
        }
    }

    /// Parse a wire string, rejecting shapes where `ok=false` lacks an error
    pub fn parse(json: &str) -> Result<Self, BridgeError> {
        let envelope: CallEnvelope = serde_json::from_str(json).map_err(|e| {
            BridgeError::new(
                ErrorCode::SerializationError,
                format!("Invalid envelope: {}", e),
            )
        })?;

        if !envelope.ok && envelope.error.is_none() {
            return Err(BridgeError::new(
                ErrorCode::SerializationError,
                "Invalid envelope: ok=false without error",
            ));
        }

        Ok(envelope)
    }

    /// Unwrap the result, raising the carried error on `ok=false`
    pub fn into_result(self) -> Result<Value, BridgeError> {
        if self.ok {
            return Ok(self.result.unwrap_or(Value::Null));
        }

        let error = self.error.unwrap_or_else(|| EnvelopeError {
            message: "Unknown error".into(),
            name: ErrorCode::InternalError.error_name().into(),
            stack: None,
        });

        let code = code_for_name(&error.name).unwrap_or(ErrorCode::HostError);
        let mut bridged = BridgeError::new(code, error.message).with_name(error.name);
        bridged.stack = error.stack;
        Err(bridged)
    }
}

fn code_for_name(name: &str) -> Option<ErrorCode> {
    const CODES: &[ErrorCode] = &[
        ErrorCode::MalformedRequest,
        ErrorCode::MissingCapability,
        ErrorCode::HandleMalformed,
        ErrorCode::HandleNotActive,
        ErrorCode::AlreadySettled,
        ErrorCode::BindingNotFound,
        ErrorCode::MethodNotFound,
        ErrorCode::InvalidArgument,
        ErrorCode::HostError,
        ErrorCode::GuestError,
        ErrorCode::Timeout,
        ErrorCode::SerializationError,
        ErrorCode::InternalError,
    ];
    CODES.iter().copied().find(|c| c.error_name() == name)
}

/// Applies the masking mode chosen once per guest-runtime instance
#[derive(Debug, Clone)]
pub struct Masker {
    mode: ErrorMasking,
    generic_message: String,
}

impl Masker {
    /// Create a masker
    pub fn new(mode: ErrorMasking, generic_message: impl Into<String>) -> Self {
        Self {
            mode,
            generic_message: generic_message.into(),
        }
    }

    /// The active mode
    pub fn mode(&self) -> ErrorMasking {
        self.mode
    }

    /// The message substituted in production
    pub fn generic_message(&self) -> &str {
        &self.generic_message
    }

    /// Shape an error for the wire
    pub fn mask(&self, error: &BridgeError) -> EnvelopeError {
        if self.mode.is_masked() && !error.code.is_client_fault() {
            EnvelopeError {
                message: self.generic_message.clone(),
                name: error.name.clone(),
                stack: None,
            }
        } else {
            EnvelopeError {
                message: error.message.clone(),
                name: error.name.clone(),
                stack: error.stack.clone(),
            }
        }
    }

    /// Build the envelope for an outcome
    pub fn envelope(&self, outcome: Result<Value, BridgeError>) -> CallEnvelope {
        match outcome {
            Ok(value) => CallEnvelope::success(value),
            Err(e) => CallEnvelope::failure(self.mask(&e)),
        }
    }
}

/// Parse a JSON request payload, mapping failures to `MALFORMED_REQUEST`
pub fn parse_request<T: DeserializeOwned>(payload: &str) -> Result<T, BridgeError> {
    serde_json::from_str(payload)
        .map_err(|e| BridgeError::malformed_request(format!("Invalid request payload: {}", e)))
}

/// Run one host capability and serialize its outcome.
///
/// Panics inside `work` are converted into an `INTERNAL_ERROR` envelope.
pub async fn respond<F>(masker: &Masker, work: F) -> String
where
    F: Future<Output = Result<Value, BridgeError>>,
{
    let outcome = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!(panic = %detail, "Host capability panicked");
            Err(BridgeError::internal_error(detail))
        }
    };

    if let Err(e) = &outcome {
        debug!(code = %e.code, name = %e.name, "Host capability failed");
    }

    masker.envelope(outcome).to_json()
}

/// Best-effort text for a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
