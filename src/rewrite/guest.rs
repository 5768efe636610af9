//! Guest side of the rewrite bridge.
//!
//! Guest handlers are plain closures. They never touch the native token:
//! each event is materialized as a small view ([`Element`], [`TextChunk`],
//! ...) whose mutating methods only record [`RewriteCommand`]s. The recorded
//! list, in call order, is what crosses back to the host.
//!
//! Handlers live in an index-addressed arena owned by the guest runtime.
//! Registering mid-stream (an end-tag handler created inside an element
//! handler) is just another insert.

use super::{
    CommentPayload, Content, DoctypePayload, DocumentHandlerSpec, ElementHandlerSpec,
    ElementPayload, EndTagPayload, EventKind, RewriteCommand, TextPayload, TransformRequest,
};
use crate::bridge::{report_best_effort, HostBridge};
use crate::capability::HostCapability;
use crate::context::HostResponse;
use crate::envelope::panic_message;
use crate::error::BridgeError;
use crate::host_functions::HostFunctionRegistry;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Element handler closure
pub type ElementFn = Arc<dyn Fn(&mut Element) -> anyhow::Result<()> + Send + Sync>;
/// Text handler closure
pub type TextFn = Arc<dyn Fn(&mut TextChunk) -> anyhow::Result<()> + Send + Sync>;
/// Comment handler closure
pub type CommentFn = Arc<dyn Fn(&mut Comment) -> anyhow::Result<()> + Send + Sync>;
/// Doctype handler closure
pub type DoctypeFn = Arc<dyn Fn(&mut Doctype) -> anyhow::Result<()> + Send + Sync>;
/// Document end handler closure
pub type EndFn = Arc<dyn Fn(&mut DocumentEnd) -> anyhow::Result<()> + Send + Sync>;
/// End tag handler closure
pub type EndTagFn = Arc<dyn Fn(&mut EndTag) -> anyhow::Result<()> + Send + Sync>;

/// Handlers attached to a selector
#[derive(Clone, Default)]
pub struct ElementHandlers {
    element: Option<ElementFn>,
    text: Option<TextFn>,
    comments: Option<CommentFn>,
}

impl ElementHandlers {
    /// No handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle matching start tags
    pub fn element<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Element) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.element = Some(Arc::new(f));
        self
    }

    /// Handle text inside matching elements
    pub fn text<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut TextChunk) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.text = Some(Arc::new(f));
        self
    }

    /// Handle comments inside matching elements
    pub fn comments<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Comment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.comments = Some(Arc::new(f));
        self
    }

    /// Event kinds this handler implements
    pub fn methods(&self) -> Vec<EventKind> {
        let mut methods = Vec::new();
        if self.element.is_some() {
            methods.push(EventKind::Element);
        }
        if self.text.is_some() {
            methods.push(EventKind::Text);
        }
        if self.comments.is_some() {
            methods.push(EventKind::Comments);
        }
        methods
    }
}

/// Document-wide handlers
#[derive(Clone, Default)]
pub struct DocumentHandlers {
    doctype: Option<DoctypeFn>,
    text: Option<TextFn>,
    comments: Option<CommentFn>,
    end: Option<EndFn>,
}

impl DocumentHandlers {
    /// No handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle the doctype
    pub fn doctype<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Doctype) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.doctype = Some(Arc::new(f));
        self
    }

    /// Handle every text chunk
    pub fn text<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut TextChunk) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.text = Some(Arc::new(f));
        self
    }

    /// Handle every comment
    pub fn comments<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Comment) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.comments = Some(Arc::new(f));
        self
    }

    /// Handle the end of the document
    pub fn end<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut DocumentEnd) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.end = Some(Arc::new(f));
        self
    }

    /// Event kinds this handler implements
    pub fn methods(&self) -> Vec<EventKind> {
        let mut methods = Vec::new();
        if self.doctype.is_some() {
            methods.push(EventKind::Doctype);
        }
        if self.text.is_some() {
            methods.push(EventKind::Text);
        }
        if self.comments.is_some() {
            methods.push(EventKind::Comments);
        }
        if self.end.is_some() {
            methods.push(EventKind::End);
        }
        methods
    }
}

/// A registered guest callback
#[derive(Clone)]
pub enum GuestHandler {
    /// Selector-bound handlers
    Element(ElementHandlers),
    /// Document handlers
    Document(DocumentHandlers),
    /// One-shot handler for a specific element's end tag
    EndTag(EndTagFn),
}

impl fmt::Debug for GuestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestHandler::Element(handlers) => f
                .debug_tuple("Element")
                .field(&handlers.methods())
                .finish(),
            GuestHandler::Document(handlers) => f
                .debug_tuple("Document")
                .field(&handlers.methods())
                .finish(),
            GuestHandler::EndTag(_) => f.write_str("EndTag"),
        }
    }
}

/// How inserted content is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Escaped before insertion
    Text,
    /// Inserted as markup
    Html,
}

fn content(content: &str, content_type: ContentType) -> Content {
    Content {
        content: content.to_string(),
        html: content_type == ContentType::Html,
    }
}

/// Start tag view
pub struct Element {
    tag_name: String,
    namespace_uri: String,
    attributes: Vec<(String, String)>,
    self_closing: bool,
    removed: bool,
    commands: Vec<RewriteCommand>,
    end_tag_handlers: Vec<EndTagFn>,
}

impl Element {
    fn from_payload(payload: ElementPayload) -> Self {
        Self {
            tag_name: payload.tag_name,
            namespace_uri: payload.namespace_uri,
            attributes: payload.attributes,
            self_closing: payload.self_closing,
            removed: payload.removed,
            commands: Vec::new(),
            end_tag_handlers: Vec::new(),
        }
    }

    /// Lower-cased tag name
    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    /// Namespace URI
    pub fn namespace_uri(&self) -> &str {
        &self.namespace_uri
    }

    /// Attributes as seen after the commands recorded so far
    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// Attribute value
    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.attributes
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether an attribute is present
    pub fn has_attribute(&self, name: &str) -> bool {
        self.get_attribute(name).is_some()
    }

    /// Written as `<tag/>`
    pub fn is_self_closing(&self) -> bool {
        self.self_closing
    }

    /// Whether the element has been removed or replaced
    pub fn removed(&self) -> bool {
        self.removed
    }

    /// Set an attribute
    pub fn set_attribute(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.attributes.push((key, value.to_string())),
        }
        self.commands.push(RewriteCommand::SetAttribute {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Remove an attribute
    pub fn remove_attribute(&mut self, name: &str) {
        let key = name.to_ascii_lowercase();
        self.attributes.retain(|(k, _)| *k != key);
        self.commands.push(RewriteCommand::RemoveAttribute {
            name: name.to_string(),
        });
    }

    /// Add a class
    pub fn add_class(&mut self, class: &str) {
        self.mirror_class(class, Some(true));
        self.commands.push(RewriteCommand::AddClass {
            name: class.to_string(),
        });
    }

    /// Remove a class
    pub fn remove_class(&mut self, class: &str) {
        self.mirror_class(class, Some(false));
        self.commands.push(RewriteCommand::RemoveClass {
            name: class.to_string(),
        });
    }

    /// Toggle a class, or force it on/off
    pub fn toggle_class(&mut self, class: &str, force: Option<bool>) {
        self.mirror_class(class, force);
        self.commands.push(RewriteCommand::ToggleClass {
            name: class.to_string(),
            force,
        });
    }

    fn mirror_class(&mut self, class: &str, force: Option<bool>) {
        let mut classes: Vec<String> = self
            .get_attribute("class")
            .map(|v| v.split_ascii_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let present = classes.iter().any(|c| c == class);
        let wanted = force.unwrap_or(!present);
        if wanted == present {
            return;
        }
        if wanted {
            classes.push(class.to_string());
        } else {
            classes.retain(|c| c != class);
        }
        let joined = classes.join(" ");
        match self.attributes.iter_mut().find(|(k, _)| k == "class") {
            Some(slot) => slot.1 = joined,
            None => self.attributes.push(("class".into(), joined)),
        }
    }

    /// Replace the element's children
    pub fn set_inner_content(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::SetInnerContent(content(value, content_type)));
    }

    /// Replace the whole element
    pub fn set_outer_content(&mut self, value: &str, content_type: ContentType) {
        self.removed = true;
        self.commands
            .push(RewriteCommand::SetOuterContent(content(value, content_type)));
    }

    /// Insert before the closing tag
    pub fn append(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::Append(content(value, content_type)));
    }

    /// Insert after the opening tag
    pub fn prepend(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::Prepend(content(value, content_type)));
    }

    /// Insert before the element
    pub fn before(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::Before(content(value, content_type)));
    }

    /// Insert after the element
    pub fn after(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::After(content(value, content_type)));
    }

    /// Replace the element
    pub fn replace(&mut self, value: &str, content_type: ContentType) {
        self.removed = true;
        self.commands
            .push(RewriteCommand::Replace(content(value, content_type)));
    }

    /// Remove the element and its children
    pub fn remove(&mut self) {
        self.removed = true;
        self.commands.push(RewriteCommand::Remove);
    }

    /// Remove the tags, keeping the children
    pub fn remove_and_keep_content(&mut self) {
        self.commands.push(RewriteCommand::RemoveAndKeepContent);
    }

    /// Run `f` when this element's end tag is reached.
    ///
    /// Ignored for void and self-closing elements, which have no end tag.
    pub fn on_end_tag<F>(&mut self, f: F)
    where
        F: Fn(&mut EndTag) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.end_tag_handlers.push(Arc::new(f));
        self.commands.push(RewriteCommand::OnEndTag {
            handler_id: String::new(),
        });
    }
}

/// Text chunk view
pub struct TextChunk {
    text: String,
    last_in_text_node: bool,
    removed: bool,
    commands: Vec<RewriteCommand>,
}

impl TextChunk {
    /// Text of this chunk
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether this is the last chunk of its text node
    pub fn last_in_text_node(&self) -> bool {
        self.last_in_text_node
    }

    /// Whether the chunk has been removed or replaced
    pub fn removed(&self) -> bool {
        self.removed
    }

    /// Insert before the chunk
    pub fn before(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::Before(content(value, content_type)));
    }

    /// Insert after the chunk
    pub fn after(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::After(content(value, content_type)));
    }

    /// Replace the chunk
    pub fn replace(&mut self, value: &str, content_type: ContentType) {
        self.removed = true;
        self.commands
            .push(RewriteCommand::Replace(content(value, content_type)));
    }

    /// Remove the chunk
    pub fn remove(&mut self) {
        self.removed = true;
        self.commands.push(RewriteCommand::Remove);
    }
}

/// Comment view
pub struct Comment {
    text: String,
    removed: bool,
    commands: Vec<RewriteCommand>,
}

impl Comment {
    /// Comment text without delimiters
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the comment has been removed or replaced
    pub fn removed(&self) -> bool {
        self.removed
    }

    /// Insert before the comment
    pub fn before(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::Before(content(value, content_type)));
    }

    /// Insert after the comment
    pub fn after(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::After(content(value, content_type)));
    }

    /// Replace the comment
    pub fn replace(&mut self, value: &str, content_type: ContentType) {
        self.removed = true;
        self.commands
            .push(RewriteCommand::Replace(content(value, content_type)));
    }

    /// Remove the comment
    pub fn remove(&mut self) {
        self.removed = true;
        self.commands.push(RewriteCommand::Remove);
    }
}

/// Doctype view
pub struct Doctype {
    name: Option<String>,
    text: String,
    commands: Vec<RewriteCommand>,
}

impl Doctype {
    /// Doctype name, e.g. `html`
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Raw doctype markup
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Remove the doctype
    pub fn remove(&mut self) {
        self.commands.push(RewriteCommand::Remove);
    }
}

/// End-of-document view
#[derive(Default)]
pub struct DocumentEnd {
    commands: Vec<RewriteCommand>,
}

impl DocumentEnd {
    /// Append to the end of the document
    pub fn append(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::Append(content(value, content_type)));
    }
}

/// End tag view
pub struct EndTag {
    name: String,
    commands: Vec<RewriteCommand>,
}

impl EndTag {
    /// Lower-cased tag name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert before the end tag
    pub fn before(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::Before(content(value, content_type)));
    }

    /// Insert after the end tag
    pub fn after(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::After(content(value, content_type)));
    }

    /// Replace the end tag
    pub fn replace(&mut self, value: &str, content_type: ContentType) {
        self.commands
            .push(RewriteCommand::Replace(content(value, content_type)));
    }

    /// Remove the end tag
    pub fn remove(&mut self) {
        self.commands.push(RewriteCommand::Remove);
    }
}

/// Registrations made by one `transform()` call share a scope
pub type ScopeId = u64;

const TOKEN_PREFIX: &str = "rw";

struct Entry {
    handler: GuestHandler,
    scope: ScopeId,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
}

/// Index-addressed table of guest handlers.
///
/// Tokens are `rw:{index}:{generation}`. A slot's generation is bumped on
/// release, so a reused index never revives an old token.
pub struct HandlerRegistry {
    max_handlers: usize,
    arena: Mutex<Arena>,
    next_scope: AtomicU64,
}

impl HandlerRegistry {
    /// Create a registry holding at most `max_handlers` live entries
    pub fn new(max_handlers: usize) -> Self {
        Self {
            max_handlers,
            arena: Mutex::new(Arena::default()),
            next_scope: AtomicU64::new(1),
        }
    }

    /// Open a registration scope
    pub fn new_scope(&self) -> ScopeId {
        self.next_scope.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a handler, returning its token
    pub fn register(&self, scope: ScopeId, handler: GuestHandler) -> Result<String, BridgeError> {
        let mut arena = self.arena.lock();
        if arena.live >= self.max_handlers {
            return Err(BridgeError::invalid_argument(format!(
                "Too many live rewrite handlers (limit {})",
                self.max_handlers
            )));
        }

        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                arena.slots.push(Slot::default());
                arena.slots.len() - 1
            }
        };
        let slot = &mut arena.slots[index];
        slot.entry = Some(Entry { handler, scope });
        let token = format!("{}:{}:{}", TOKEN_PREFIX, index, slot.generation);
        arena.live += 1;

        debug!(token = %token, scope, "Registered rewrite handler");
        Ok(token)
    }

    /// Resolve a token to its handler and scope
    pub fn get(&self, token: &str) -> Result<(GuestHandler, ScopeId), BridgeError> {
        if token.trim().is_empty() {
            return Err(BridgeError::handle_malformed());
        }
        let (index, generation) =
            parse_token(token).ok_or_else(|| BridgeError::handle_not_active(token))?;

        let arena = self.arena.lock();
        arena
            .slots
            .get(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.entry.as_ref())
            .map(|entry| (entry.handler.clone(), entry.scope))
            .ok_or_else(|| BridgeError::handle_not_active(token))
    }

    /// Release one handler; returns whether it was live
    pub fn release(&self, token: &str) -> bool {
        let Some((index, generation)) = parse_token(token) else {
            return false;
        };
        let mut arena = self.arena.lock();
        let released = match arena.slots.get_mut(index) {
            Some(slot) if slot.generation == generation && slot.entry.is_some() => {
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        };
        if released {
            arena.live -= 1;
            arena.free.push(index);
        }
        released
    }

    /// Release every handler registered under `scope`
    pub fn release_scope(&self, scope: ScopeId) -> usize {
        let mut arena = self.arena.lock();
        let mut freed = Vec::new();
        for (index, slot) in arena.slots.iter_mut().enumerate() {
            if slot.entry.as_ref().map_or(false, |entry| entry.scope == scope) {
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                freed.push(index);
            }
        }
        arena.live -= freed.len();
        let count = freed.len();
        arena.free.extend(freed);
        count
    }

    /// Live handlers
    pub fn len(&self) -> usize {
        self.arena.lock().live
    }

    /// Whether no handlers are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_token(token: &str) -> Option<(usize, u32)> {
    let mut parts = token.splitn(3, ':');
    if parts.next()? != TOKEN_PREFIX {
        return None;
    }
    let index = parts.next()?.parse().ok()?;
    let generation = parts.next()?.parse().ok()?;
    Some((index, generation))
}

/// Guest entry point for rewrite events sent by the host
pub struct RewriteDispatcher {
    handlers: Arc<HandlerRegistry>,
    registry: OnceCell<Weak<HostFunctionRegistry>>,
}

impl RewriteDispatcher {
    /// Create a dispatcher over `handlers`
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            handlers,
            registry: OnceCell::new(),
        }
    }

    /// The handler table
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Attach the registry used to report handler failures
    pub fn attach(&self, registry: &Arc<HostFunctionRegistry>) {
        if self.registry.set(Arc::downgrade(registry)).is_err() {
            debug!("Rewrite dispatcher already attached");
        }
    }

    /// Wire entry point: `(handlerId, eventType, payloadJson)` to a JSON command list.
    ///
    /// Never fails; a handler fault is reported and answered with `[]`.
    pub async fn dispatch(&self, handler_id: &str, event_type: &str, payload: &str) -> String {
        let outcome = EventKind::parse(event_type)
            .ok_or_else(|| {
                BridgeError::invalid_argument(format!("Unknown rewrite event '{}'", event_type))
            })
            .and_then(|kind| {
                let payload: Value = serde_json::from_str(payload).map_err(|e| {
                    BridgeError::malformed_request(format!("Invalid event payload: {}", e))
                })?;
                Ok((kind, payload))
            });

        let commands = match outcome {
            Ok((kind, payload)) => self.dispatch_event(handler_id, kind, payload).await,
            Err(error) => {
                self.fail(handler_id, event_type, &error).await;
                Vec::new()
            }
        };
        serde_json::to_string(&commands).unwrap_or_else(|_| "[]".to_string())
    }

    /// Run one event through its handler and return the recorded commands
    pub async fn dispatch_event(
        &self,
        handler_id: &str,
        kind: EventKind,
        payload: Value,
    ) -> Vec<RewriteCommand> {
        match self.run_handler(handler_id, kind, payload) {
            Ok(commands) => commands,
            Err(error) => {
                self.fail(handler_id, kind.as_str(), &error).await;
                Vec::new()
            }
        }
    }

    async fn fail(&self, handler_id: &str, event_type: &str, error: &BridgeError) {
        warn!(
            handler_id = %handler_id,
            event = %event_type,
            code = %error.code,
            "Rewrite handler failed: {}",
            error.message
        );
        let context = json!({"handlerId": handler_id, "event": event_type});
        match self.registry.get().and_then(Weak::upgrade) {
            Some(registry) => report_best_effort(&registry, error, context).await,
            None => debug!("No registry attached; rewrite handler error not reported"),
        }
    }

    fn run_handler(
        &self,
        handler_id: &str,
        kind: EventKind,
        payload: Value,
    ) -> Result<Vec<RewriteCommand>, BridgeError> {
        let (handler, scope) = self.handlers.get(handler_id)?;

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            invoke(&handler, handler_id, kind, payload)
        }))
        .unwrap_or_else(|panic| Err(BridgeError::guest(panic_message(panic.as_ref()))));

        if matches!(handler, GuestHandler::EndTag(_)) {
            self.handlers.release(handler_id);
        }

        let (mut commands, end_tag_handlers) = outcome?;
        let mut pending = end_tag_handlers.into_iter();
        for command in commands.iter_mut() {
            if let RewriteCommand::OnEndTag { handler_id } = command {
                if handler_id.is_empty() {
                    if let Some(f) = pending.next() {
                        *handler_id = self.handlers.register(scope, GuestHandler::EndTag(f))?;
                    }
                }
            }
        }
        Ok(commands)
    }
}

type Recorded = (Vec<RewriteCommand>, Vec<EndTagFn>);

fn invoke(
    handler: &GuestHandler,
    handler_id: &str,
    kind: EventKind,
    payload: Value,
) -> Result<Recorded, BridgeError> {
    let missing =
        || BridgeError::invalid_argument(format!("Handler '{}' does not implement '{}'", handler_id, kind));

    match (handler, kind) {
        (GuestHandler::Element(h), EventKind::Element) => {
            let f = h.element.as_ref().ok_or_else(missing)?;
            let mut element = Element::from_payload(decode(payload)?);
            f(&mut element).map_err(|e| BridgeError::from_guest(&e))?;
            Ok((element.commands, element.end_tag_handlers))
        }
        (GuestHandler::Element(ElementHandlers { text: f, .. }), EventKind::Text)
        | (GuestHandler::Document(DocumentHandlers { text: f, .. }), EventKind::Text) => {
            let f = f.as_ref().ok_or_else(missing)?;
            let payload: TextPayload = decode(payload)?;
            let mut chunk = TextChunk {
                text: payload.text,
                last_in_text_node: payload.last_in_text_node,
                removed: false,
                commands: Vec::new(),
            };
            f(&mut chunk).map_err(|e| BridgeError::from_guest(&e))?;
            Ok((chunk.commands, Vec::new()))
        }
        (GuestHandler::Element(ElementHandlers { comments: f, .. }), EventKind::Comments)
        | (GuestHandler::Document(DocumentHandlers { comments: f, .. }), EventKind::Comments) => {
            let f = f.as_ref().ok_or_else(missing)?;
            let payload: CommentPayload = decode(payload)?;
            let mut comment = Comment {
                text: payload.text,
                removed: false,
                commands: Vec::new(),
            };
            f(&mut comment).map_err(|e| BridgeError::from_guest(&e))?;
            Ok((comment.commands, Vec::new()))
        }
        (GuestHandler::Document(h), EventKind::Doctype) => {
            let f = h.doctype.as_ref().ok_or_else(missing)?;
            let payload: DoctypePayload = decode(payload)?;
            let mut doctype = Doctype {
                name: payload.name,
                text: payload.text,
                commands: Vec::new(),
            };
            f(&mut doctype).map_err(|e| BridgeError::from_guest(&e))?;
            Ok((doctype.commands, Vec::new()))
        }
        (GuestHandler::Document(h), EventKind::End) => {
            let f = h.end.as_ref().ok_or_else(missing)?;
            let mut end = DocumentEnd::default();
            f(&mut end).map_err(|e| BridgeError::from_guest(&e))?;
            Ok((end.commands, Vec::new()))
        }
        (GuestHandler::EndTag(f), EventKind::EndTag) => {
            let payload: EndTagPayload = decode(payload)?;
            let mut end_tag = EndTag {
                name: payload.name,
                commands: Vec::new(),
            };
            f(&mut end_tag).map_err(|e| BridgeError::from_guest(&e))?;
            Ok((end_tag.commands, Vec::new()))
        }
        _ => Err(missing()),
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, BridgeError> {
    serde_json::from_value(payload)
        .map_err(|e| BridgeError::malformed_request(format!("Invalid event payload: {}", e)))
}

struct ScopeGuard {
    handlers: Arc<HandlerRegistry>,
    scope: ScopeId,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let released = self.handlers.release_scope(self.scope);
        debug!(scope = self.scope, released, "Released rewrite handlers");
    }
}

/// Guest-facing streaming rewriter.
///
/// Every handler registered through one rewriter, including end-tag
/// handlers registered while the stream runs, is released when the
/// rewriter is dropped. `transform` consumes it.
pub struct HtmlRewriter {
    bridge: HostBridge,
    guard: ScopeGuard,
    options: Value,
    element_handlers: Vec<ElementHandlerSpec>,
    document_handlers: Vec<DocumentHandlerSpec>,
}

impl HtmlRewriter {
    /// Create a rewriter bound to `bridge`
    pub fn new(bridge: HostBridge) -> Self {
        let handlers = Arc::clone(bridge.handlers());
        let scope = handlers.new_scope();
        Self {
            bridge,
            guard: ScopeGuard { handlers, scope },
            options: Value::Object(Default::default()),
            element_handlers: Vec::new(),
            document_handlers: Vec::new(),
        }
    }

    /// Forward rewriter options to the host
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Register handlers for elements matching `selector`
    pub fn on(&mut self, selector: &str, handlers: ElementHandlers) -> Result<&mut Self, BridgeError> {
        let methods = handlers.methods();
        let handler_id = self
            .guard
            .handlers
            .register(self.guard.scope, GuestHandler::Element(handlers))?;
        self.element_handlers.push(ElementHandlerSpec {
            selector: selector.to_string(),
            handler_id,
            methods,
        });
        Ok(self)
    }

    /// Register document handlers
    pub fn on_document(&mut self, handlers: DocumentHandlers) -> Result<&mut Self, BridgeError> {
        let methods = handlers.methods();
        let handler_id = self
            .guard
            .handlers
            .register(self.guard.scope, GuestHandler::Document(handlers))?;
        self.document_handlers.push(DocumentHandlerSpec { handler_id, methods });
        Ok(self)
    }

    /// Rewrite `response`'s body
    pub async fn transform(self, response: HostResponse) -> Result<HostResponse, BridgeError> {
        let request = TransformRequest {
            options: self.options.clone(),
            element_handlers: self.element_handlers.clone(),
            document_handlers: self.document_handlers.clone(),
            response,
        };
        let result = self
            .bridge
            .call(
                HostCapability::RewriteTransform,
                vec![serde_json::to_string(&request)?],
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CallEnvelope;
    use crate::host_functions::host_fn;
    use crate::metrics::BridgeMetrics;

    fn dispatcher() -> RewriteDispatcher {
        RewriteDispatcher::new(Arc::new(HandlerRegistry::new(8)))
    }

    fn element_payload(tag: &str) -> String {
        json!({
            "tagName": tag,
            "namespaceURI": "http://www.w3.org/1999/xhtml",
            "attributes": [["class", "a"]],
        })
        .to_string()
    }

    fn commands(json: &str) -> Vec<RewriteCommand> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_tokens_are_never_reused() {
        let registry = HandlerRegistry::new(8);
        let scope = registry.new_scope();
        let first = registry
            .register(scope, GuestHandler::Document(DocumentHandlers::new()))
            .unwrap();
        assert!(registry.release(&first));
        let second = registry
            .register(scope, GuestHandler::Document(DocumentHandlers::new()))
            .unwrap();

        assert_ne!(first, second);
        assert!(first.starts_with("rw:0:"));
        assert!(second.starts_with("rw:0:"));
        assert_eq!(
            registry.get(&first).err().unwrap().code,
            crate::error::ErrorCode::HandleNotActive
        );
        assert!(registry.get(&second).is_ok());
    }

    #[test]
    fn test_limit_and_scope_release() {
        let registry = HandlerRegistry::new(2);
        let a = registry.new_scope();
        let b = registry.new_scope();
        registry
            .register(a, GuestHandler::Document(DocumentHandlers::new()))
            .unwrap();
        registry
            .register(b, GuestHandler::Document(DocumentHandlers::new()))
            .unwrap();
        let err = registry
            .register(a, GuestHandler::Document(DocumentHandlers::new()))
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidArgument);

        assert_eq!(registry.release_scope(a), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("").unwrap_err().code, crate::error::ErrorCode::HandleMalformed);
    }

    #[test]
    fn test_handler_debug_names_methods() {
        let registry = HandlerRegistry::new(4);
        let scope = registry.new_scope();
        let token = registry
            .register(scope, GuestHandler::Element(ElementHandlers::new().text(|_| Ok(()))))
            .unwrap();
        let (handler, _) = registry.get(&token).unwrap();
        assert_eq!(format!("{:?}", handler), "Element([Text])");
        assert_eq!(
            format!("{:?}", GuestHandler::Document(DocumentHandlers::new())),
            "Document([])"
        );
    }

    #[test]
    fn test_methods_follow_closures() {
        let handlers = ElementHandlers::new().comments(|_| Ok(()));
        assert_eq!(handlers.methods(), vec![EventKind::Comments]);
        let document = DocumentHandlers::new().doctype(|_| Ok(())).end(|_| Ok(()));
        assert_eq!(document.methods(), vec![EventKind::Doctype, EventKind::End]);
    }

    #[tokio::test]
    async fn test_commands_keep_recorded_order() {
        let dispatcher = dispatcher();
        let scope = dispatcher.handlers().new_scope();
        let id = dispatcher
            .handlers()
            .register(
                scope,
                GuestHandler::Element(ElementHandlers::new().element(|el| {
                    assert_eq!(el.tag_name(), "div");
                    el.add_class("b");
                    assert_eq!(el.get_attribute("class"), Some("a b"));
                    el.set_inner_content("x", ContentType::Text);
                    el.remove();
                    Ok(())
                })),
            )
            .unwrap();

        let out = commands(&dispatcher.dispatch(&id, "element", &element_payload("div")).await);
        let names: Vec<&str> = out.iter().map(RewriteCommand::name).collect();
        assert_eq!(names, vec!["add_class", "set_inner_content", "remove"]);
    }

    #[tokio::test]
    async fn test_end_tag_handler_registered_and_released_after_firing() {
        let dispatcher = dispatcher();
        let scope = dispatcher.handlers().new_scope();
        let id = dispatcher
            .handlers()
            .register(
                scope,
                GuestHandler::Element(ElementHandlers::new().element(|el| {
                    el.on_end_tag(|end| {
                        end.before("!", ContentType::Text);
                        Ok(())
                    });
                    Ok(())
                })),
            )
            .unwrap();

        let out = commands(&dispatcher.dispatch(&id, "element", &element_payload("p")).await);
        let end_id = match &out[0] {
            RewriteCommand::OnEndTag { handler_id } => handler_id.clone(),
            other => panic!("unexpected command {:?}", other),
        };
        assert_eq!(dispatcher.handlers().len(), 2);

        let fired = commands(
            &dispatcher
                .dispatch(&end_id, "end_tag", r#"{"name":"p"}"#)
                .await,
        );
        assert_eq!(fired.len(), 1);
        assert_eq!(dispatcher.handlers().len(), 1);

        let again = dispatcher.dispatch(&end_id, "end_tag", r#"{"name":"p"}"#).await;
        assert_eq!(again, "[]");
    }

    #[tokio::test]
    async fn test_failing_handler_reports_and_returns_nothing() {
        let reports = Arc::new(Mutex::new(Vec::<String>::new()));
        let registry = Arc::new(HostFunctionRegistry::new(Arc::new(BridgeMetrics::new())));
        let sink = Arc::clone(&reports);
        registry.register_once("report_error", move || {
            host_fn(move |args| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(args[0].clone());
                    CallEnvelope::success(Value::Null).to_json()
                }
            })
        });

        let dispatcher = dispatcher();
        dispatcher.attach(&registry);
        let scope = dispatcher.handlers().new_scope();
        let failing = dispatcher
            .handlers()
            .register(
                scope,
                GuestHandler::Document(DocumentHandlers::new().text(|_| anyhow::bail!("bad text"))),
            )
            .unwrap();
        let panicking = dispatcher
            .handlers()
            .register(
                scope,
                GuestHandler::Document(DocumentHandlers::new().text(|_| panic!("kaboom"))),
            )
            .unwrap();

        let payload = r#"{"text":"hi","lastInTextNode":true}"#;
        assert_eq!(dispatcher.dispatch(&failing, "text", payload).await, "[]");
        assert_eq!(dispatcher.dispatch(&panicking, "text", payload).await, "[]");
        assert_eq!(dispatcher.dispatch(&failing, "doctype", "{}").await, "[]");

        let reports = reports.lock();
        assert_eq!(reports.len(), 3);
        assert!(reports[0].contains("bad text"));
        assert!(reports[1].contains("kaboom"));
    }

    #[tokio::test]
    async fn test_unknown_token_returns_no_commands() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.dispatch("rw:4:0", "text", "{}").await, "[]");
        assert_eq!(dispatcher.dispatch("nope", "bogus", "{").await, "[]");
    }
}
