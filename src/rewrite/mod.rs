//! Streaming rewrite event bridge.
//!
//! The host runs a native token-by-token markup rewriter. For each token a
//! guest handler declared interest in, the host sends
//! `(handlerId, eventType, payloadJson)` to the guest and receives back an
//! ordered list of [`RewriteCommand`]s, which it replays against the live
//! token before moving on to the next one.
//!
//! - [`guest`]: handler registry, event views and the guest-side rewriter
//! - [`html`]: the native streaming rewriter
//! - [`selector`]: the selector engine used to match element handlers

pub mod guest;
pub mod html;
pub mod selector;

use crate::context::HostResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Event kinds a handler can implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Element start tag
    Element,
    /// Text chunk
    Text,
    /// Comment
    Comments,
    /// Doctype
    Doctype,
    /// End of document
    End,
    /// Element end tag (nested registrations only)
    EndTag,
}

impl EventKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Element => "element",
            EventKind::Text => "text",
            EventKind::Comments => "comments",
            EventKind::Doctype => "doctype",
            EventKind::End => "end",
            EventKind::EndTag => "end_tag",
        }
    }

    /// Parse a wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "element" => Some(EventKind::Element),
            "text" => Some(EventKind::Text),
            "comments" => Some(EventKind::Comments),
            "doctype" => Some(EventKind::Doctype),
            "end" => Some(EventKind::End),
            "end_tag" => Some(EventKind::EndTag),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inserted content; escaped unless `html` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Content
    pub content: String,
    /// Insert as raw markup
    #[serde(default)]
    pub html: bool,
}

impl Content {
    /// Markup ready for output
    pub fn render(&self) -> String {
        if self.html {
            self.content.clone()
        } else {
            escape_text(&self.content)
        }
    }
}

/// One mutation recorded by a guest handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RewriteCommand {
    /// Set an attribute
    SetAttribute {
        /// Attribute name
        name: String,
        /// Attribute value
        value: String,
    },
    /// Remove an attribute
    RemoveAttribute {
        /// Attribute name
        name: String,
    },
    /// Add a class
    AddClass {
        /// Class name
        name: String,
    },
    /// Remove a class
    RemoveClass {
        /// Class name
        name: String,
    },
    /// Toggle a class
    ToggleClass {
        /// Class name
        name: String,
        /// Force on or off
        #[serde(default, skip_serializing_if = "Option::is_none")]
        force: Option<bool>,
    },
    /// Replace the element's children
    SetInnerContent(Content),
    /// Replace the element and its children
    SetOuterContent(Content),
    /// Insert before the closing tag
    Append(Content),
    /// Insert after the opening tag
    Prepend(Content),
    /// Insert before the token
    Before(Content),
    /// Insert after the token
    After(Content),
    /// Replace the token
    Replace(Content),
    /// Remove the token (and an element's children)
    Remove,
    /// Remove the element's tags, keeping its children
    RemoveAndKeepContent,
    /// Fire a nested handler on this element's end tag
    OnEndTag {
        /// Registration token of the end-tag handler
        handler_id: String,
    },
}

impl RewriteCommand {
    /// Command name as sent on the wire
    pub fn name(&self) -> &'static str {
        match self {
            RewriteCommand::SetAttribute { .. } => "set_attribute",
            RewriteCommand::RemoveAttribute { .. } => "remove_attribute",
            RewriteCommand::AddClass { .. } => "add_class",
            RewriteCommand::RemoveClass { .. } => "remove_class",
            RewriteCommand::ToggleClass { .. } => "toggle_class",
            RewriteCommand::SetInnerContent(_) => "set_inner_content",
            RewriteCommand::SetOuterContent(_) => "set_outer_content",
            RewriteCommand::Append(_) => "append",
            RewriteCommand::Prepend(_) => "prepend",
            RewriteCommand::Before(_) => "before",
            RewriteCommand::After(_) => "after",
            RewriteCommand::Replace(_) => "replace",
            RewriteCommand::Remove => "remove",
            RewriteCommand::RemoveAndKeepContent => "remove_and_keep_content",
            RewriteCommand::OnEndTag { .. } => "on_end_tag",
        }
    }
}

/// Element handler registration on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementHandlerSpec {
    /// CSS selector
    pub selector: String,
    /// Registration token
    pub handler_id: String,
    /// Implemented event kinds
    pub methods: Vec<EventKind>,
}

/// Document handler registration on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHandlerSpec {
    /// Registration token
    pub handler_id: String,
    /// Implemented event kinds
    pub methods: Vec<EventKind>,
}

/// `rewrite_transform` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformRequest {
    /// Rewriter options, forwarded as given
    #[serde(default)]
    pub options: Value,
    /// Element handlers in registration order
    #[serde(default)]
    pub element_handlers: Vec<ElementHandlerSpec>,
    /// Document handlers in registration order
    #[serde(default)]
    pub document_handlers: Vec<DocumentHandlerSpec>,
    /// Response whose body is rewritten
    pub response: HostResponse,
}

/// `element` event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementPayload {
    /// Lower-cased tag name
    pub tag_name: String,
    /// Namespace URI
    #[serde(rename = "namespaceURI")]
    pub namespace_uri: String,
    /// Attributes as `[name, value]` pairs, in source order
    pub attributes: Vec<(String, String)>,
    /// Written as `<tag/>`
    #[serde(default)]
    pub self_closing: bool,
    /// Already removed by an earlier handler
    #[serde(default)]
    pub removed: bool,
}

/// `text` event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextPayload {
    /// Text of this chunk
    pub text: String,
    /// Whether this is the last chunk of the text node
    pub last_in_text_node: bool,
}

/// `comments` event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentPayload {
    /// Comment text without delimiters
    pub text: String,
}

/// `doctype` event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctypePayload {
    /// Doctype name, e.g. `html`
    #[serde(default)]
    pub name: Option<String>,
    /// Raw doctype markup
    pub text: String,
}

/// `end_tag` event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndTagPayload {
    /// Lower-cased tag name
    pub name: String,
}

/// Escape text for insertion as markup
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}
