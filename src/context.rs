//! Request, response and return-value types shared by every dispatch path.
//!
//! Guest handlers return loosely shaped values; [`GuestValue::into_response`]
//! is the single normalization step used by request, actor fetch and actor
//! alarm dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Header map; keys are stored lower-cased
pub type Headers = BTreeMap<String, String>;

/// Inbound request handed to guest code
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequest {
    /// HTTP method
    pub method: String,

    /// Request path (without query string)
    pub path: String,

    /// Query parameters
    #[serde(default)]
    pub query: BTreeMap<String, String>,

    /// Request headers
    #[serde(default)]
    pub headers: Headers,

    /// Raw body, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HostRequest {
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

    /// Set the body
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Header lookup (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Normalized response returned to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponse {
    /// Response body
    #[serde(default)]
    pub body: String,

    /// Status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: Headers,
}

impl Default for HostResponse {
    fn default() -> Self {
        Self {
            body: String::new(),
            status: 200,
            headers: Headers::new(),
        }
    }
}

impl HostResponse {
    /// Create a response
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            status,
            headers: Headers::new(),
        }
    }

    /// Plain 200 response
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    /// Add a header
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Header lookup (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn default_status() -> u16 {
    200
}

/// What a guest handler hands back
#[derive(Debug, Clone, PartialEq)]
pub enum GuestValue {
    /// Nothing returned
    Nil,
    /// An explicit response object
    Response(HostResponse),
    /// A hash / map
    Hash(Map<String, Value>),
    /// A plain string
    Text(String),
    /// Any other value
    Other(Value),
}

impl GuestValue {
    /// Normalize into a host response.
    ///
    /// `Nil` is an empty 200; a hash carrying `body`, `status` or `headers`
    /// is read as a response; any other hash is JSON-encoded as the body;
    /// strings become the body; everything else is stringified.
    pub fn into_response(self) -> HostResponse {
        match self {
            GuestValue::Nil => HostResponse::default(),
            GuestValue::Response(response) => response,
            GuestValue::Hash(map) if is_response_shaped(&map) => response_from_hash(map),
            GuestValue::Hash(map) => HostResponse::ok(Value::Object(map).to_string())
                .with_header("content-type", "application/json"),
            GuestValue::Text(text) => {
                HostResponse::ok(text).with_header("content-type", "text/plain; charset=utf-8")
            }
            GuestValue::Other(Value::Null) => HostResponse::default(),
            GuestValue::Other(Value::String(s)) => GuestValue::Text(s).into_response(),
            GuestValue::Other(Value::Object(map)) => GuestValue::Hash(map).into_response(),
            GuestValue::Other(value) => HostResponse::ok(value.to_string())
                .with_header("content-type", "text/plain; charset=utf-8"),
        }
    }
}

impl From<Value> for GuestValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => GuestValue::Nil,
            Value::String(s) => GuestValue::Text(s),
            Value::Object(map) => GuestValue::Hash(map),
            other => GuestValue::Other(other),
        }
    }
}

impl From<HostResponse> for GuestValue {
    fn from(response: HostResponse) -> Self {
        GuestValue::Response(response)
    }
}

impl From<&str> for GuestValue {
    fn from(s: &str) -> Self {
        GuestValue::Text(s.to_string())
    }
}

impl From<String> for GuestValue {
    fn from(s: String) -> Self {
        GuestValue::Text(s)
    }
}

fn is_response_shaped(map: &Map<String, Value>) -> bool {
    ["body", "status", "headers"]
        .iter()
        .any(|k| map.contains_key(*k))
}

fn response_from_hash(mut map: Map<String, Value>) -> HostResponse {
    let status = map
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(200);

    let body = match map.remove("body") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    };

    let mut headers = Headers::new();
    if let Some(Value::Object(raw)) = map.remove("headers") {
        for (name, value) in raw {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            headers.insert(name.to_ascii_lowercase(), value);
        }
    }

    HostResponse {
        body,
        status,
        headers,
    }
}

/// A scheduled (cron) tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEvent {
    /// Cron expression that fired
    pub cron: String,
    /// Scheduled time in milliseconds since the Unix epoch
    pub scheduled_time: i64,
}

impl ScheduledEvent {
    /// Create an event for the given cron expression firing now
    pub fn now(cron: impl Into<String>) -> Self {
        Self {
            cron: cron.into(),
            scheduled_time: chrono::Utc::now().timestamp_millis(),
        }
    }
}
