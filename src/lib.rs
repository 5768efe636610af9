//! # Edge Guest Bridge
//!
//! This library connects a sandboxed guest runtime to the capabilities of an
//! edge-compute host: durable actors and their storage, queue deliveries,
//! row stores, outbound fetch, inference, vector indexes and streaming HTML
//! rewriting.
//!
//! ## Architecture
//!
//! ```text
//! Host (request / scheduled / queue / actor dispatch)
//!     │
//!     │ BridgeRuntime entry points
//!     ▼
//! Guest code (GuestApp / GuestActor)
//!     │
//!     │ HostBridge: capability name + string args
//!     ▼
//! Host functions ──► Call Envelope {ok, result | error}
//! ```
//!
//! ## Features
//!
//! - **Uniform Envelopes**: every host call resolves to one JSON shape
//! - **Error Masking**: host faults are hidden outside development
//! - **Handle Tables**: host resources cross the boundary as opaque strings
//! - **Streaming Rewrite**: guest handlers run inside the host's rewriter
//! - **Per-Instance State**: nothing is shared between runtime instances

#![deny(missing_docs)]

pub mod actor;
pub mod bridge;
pub mod capability;
pub mod config;
pub mod context;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod handles;
pub mod host;
pub mod host_functions;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod rewrite;

// Re-export commonly used types
pub use actor::{ActorContext, ActorMetadata, ActorStub, GuestActor, StubRequest, StubTarget};
pub use bridge::HostBridge;
pub use capability::{Binding, HostCapability};
pub use config::{BridgeConfig, ErrorMasking, MaskingPolicy};
pub use context::{GuestValue, HostRequest, HostResponse, ScheduledEvent};
pub use engine::{BridgeRuntime, GuestApp, GuestInstance};
pub use envelope::{CallEnvelope, EnvelopeError, Masker};
pub use error::{BridgeError, ErrorCode, RuntimeError};
pub use handles::Handle;
pub use host::HostEnv;
pub use metrics::{BridgeMetrics, BridgeStats};
pub use queue::{NativeBatch, NativeMessage, QueueBatch, QueueMessage};
pub use rewrite::guest::{DocumentHandlers, ElementHandlers, HtmlRewriter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.0.0");
    }
}
