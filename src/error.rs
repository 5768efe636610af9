//! Error types for the bridge.
//!
//! This module defines error codes, the serializable [`BridgeError`] that
//! travels inside a Call Envelope, and the crate-level [`RuntimeError`].

use serde::{Deserialize, Serialize};

/// Error codes for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request payload could not be parsed or is missing a required field
    MalformedRequest,
    /// No host function is bound under the requested capability name
    MissingCapability,
    /// Handle is empty or otherwise unusable as a token
    HandleMalformed,
    /// Handle is well formed but not registered (released, settled, or never issued)
    HandleNotActive,
    /// Settlement attempted against a handle that is already settled
    AlreadySettled,
    /// Named binding is not present in the host environment
    BindingNotFound,
    /// Method is not exposed by the named binding
    MethodNotFound,
    /// Argument has the right shape but an unusable value
    InvalidArgument,
    /// Downstream host capability rejected the operation
    HostError,
    /// Guest handler raised during dispatch
    GuestError,
    /// Outbound call exceeded its time limit
    Timeout,
    /// Serialization/deserialization error
    SerializationError,
    /// Internal bridge error (bug)
    InternalError,
}

impl ErrorCode {
    /// The error `name` reported across the boundary for this code
    pub fn error_name(&self) -> &'static str {
        match self {
            ErrorCode::MalformedRequest => "MalformedRequestError",
            ErrorCode::MissingCapability => "MissingCapabilityError",
            ErrorCode::HandleMalformed => "HandleMalformedError",
            ErrorCode::HandleNotActive => "HandleNotActiveError",
            ErrorCode::AlreadySettled => "AlreadySettledError",
            ErrorCode::BindingNotFound => "BindingNotFoundError",
            ErrorCode::MethodNotFound => "MethodNotFoundError",
            ErrorCode::InvalidArgument => "ArgumentError",
            ErrorCode::HostError => "HostError",
            ErrorCode::GuestError => "GuestError",
            ErrorCode::Timeout => "TimeoutError",
            ErrorCode::SerializationError => "SerializationError",
            ErrorCode::InternalError => "InternalError",
        }
    }

    /// Whether the message is authored by the bridge itself.
    ///
    /// These describe caller mistakes and never carry downstream detail, so
    /// they are exposed verbatim even when production masking is on.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ErrorCode::MalformedRequest
                | ErrorCode::HandleMalformed
                | ErrorCode::HandleNotActive
                | ErrorCode::AlreadySettled
                | ErrorCode::BindingNotFound
                | ErrorCode::MethodNotFound
                | ErrorCode::InvalidArgument
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::MalformedRequest => write!(f, "MALFORMED_REQUEST"),
            ErrorCode::MissingCapability => write!(f, "MISSING_CAPABILITY"),
            ErrorCode::HandleMalformed => write!(f, "HANDLE_MALFORMED"),
            ErrorCode::HandleNotActive => write!(f, "HANDLE_NOT_ACTIVE"),
            ErrorCode::AlreadySettled => write!(f, "ALREADY_SETTLED"),
            ErrorCode::BindingNotFound => write!(f, "BINDING_NOT_FOUND"),
            ErrorCode::MethodNotFound => write!(f, "METHOD_NOT_FOUND"),
            ErrorCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            ErrorCode::HostError => write!(f, "HOST_ERROR"),
            ErrorCode::GuestError => write!(f, "GUEST_ERROR"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::SerializationError => write!(f, "SERIALIZATION_ERROR"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// Error crossing the guest/host boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeError {
    /// Error code
    pub code: ErrorCode,

    /// Error class name as seen by the guest (e.g. `HandleNotActiveError`)
    pub name: String,

    /// Human-readable message
    pub message: String,

    /// Stack trace or error chain, when one is available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Additional context for debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl BridgeError {
    /// Create a new bridge error named after its code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            name: code.error_name().to_string(),
            message: message.into(),
            stack: None,
            context: None,
        }
    }

    /// Create a malformed request error
    pub fn malformed_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedRequest, message)
    }

    /// Create a missing capability error
    pub fn missing_capability(name: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MissingCapability,
            format!("Host capability '{}' is not registered", name.into()),
        )
    }

    /// Create a malformed handle error
    pub fn handle_malformed() -> Self {
        Self::new(ErrorCode::HandleMalformed, "Handle is missing or empty")
    }

    /// Create a handle not active error
    pub fn handle_not_active(handle: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::HandleNotActive,
            format!("Handle '{}' is not active", handle.into()),
        )
    }

    /// Create an already settled error
    pub fn already_settled(handle: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::AlreadySettled,
            format!("Handle '{}' is already settled", handle.into()),
        )
    }

    /// Create a binding not found error
    pub fn binding_not_found(name: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::BindingNotFound,
            format!("Binding '{}' not found", name.into()),
        )
    }

    /// Create a method not found error
    pub fn method_not_found(binding: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!(
                "Method '{}' not found on binding '{}'",
                method.into(),
                binding.into()
            ),
        )
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    /// Wrap a downstream host rejection, keeping its error chain as the stack
    pub fn host(err: &anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        let error = Self::new(ErrorCode::HostError, err.to_string());
        if chain.is_empty() {
            error
        } else {
            error.with_stack(chain.join("\n"))
        }
    }

    /// Create a guest error
    pub fn guest(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GuestError, message)
    }

    /// Shape an error raised by guest code.
    ///
    /// Bridge errors propagated by the guest with `?` keep their code; anything
    /// else becomes a `GUEST_ERROR` with the cause chain as its stack.
    pub fn from_guest(err: &anyhow::Error) -> Self {
        if let Some(bridged) = err.downcast_ref::<BridgeError>() {
            return bridged.clone();
        }
        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        let error = Self::guest(err.to_string());
        if chain.is_empty() {
            error
        } else {
            error.with_stack(chain.join("\n"))
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Operation exceeded {}ms time limit", timeout_ms),
        )
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Override the error class name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Add context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.name, self.message)
    }
}

impl std::error::Error for BridgeError {}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::new(ErrorCode::SerializationError, e.to_string())
    }
}

/// Main error type for the runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Error raised across the bridge
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Guest code raised during a host-initiated dispatch
    #[error("Guest error: {0}")]
    Guest(BridgeError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A capability was called before it was registered
    #[error("Missing host capability: {0}")]
    MissingCapability(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RuntimeError {
    /// Convert to the boundary error shape
    pub fn to_bridge_error(&self) -> BridgeError {
        match self {
            RuntimeError::Bridge(e) | RuntimeError::Guest(e) => e.clone(),
            RuntimeError::Config(e) => BridgeError::invalid_argument(e.to_string()),
            RuntimeError::MissingCapability(name) => BridgeError::missing_capability(name.clone()),
            RuntimeError::Serialization(msg) => {
                BridgeError::new(ErrorCode::SerializationError, msg.clone())
            }
            RuntimeError::InvalidState(msg) => BridgeError::internal_error(msg.clone()),
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Serialization(e.to_string())
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
