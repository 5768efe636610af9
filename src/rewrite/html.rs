//! Native streaming markup rewriter.
//!
//! Tokens are processed strictly in order: every listener for a token is
//! delivered its event and its commands are applied before the next token
//! is read. Content that has been removed or replaced is never delivered to
//! any listener.

use super::selector::{ElementInfo, Selector};
use super::{
    CommentPayload, DoctypePayload, ElementPayload, EndTagPayload, EventKind, RewriteCommand,
    TextPayload, TransformRequest,
};
use crate::error::BridgeError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::debug;

const HTML_NS: &str = "http://www.w3.org/1999/xhtml";
const SVG_NS: &str = "http://www.w3.org/2000/svg";
const MATHML_NS: &str = "http://www.w3.org/1998/Math/MathML";

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

/// Receives events and answers with the commands to apply
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one event to one handler
    async fn deliver(
        &mut self,
        handler_id: &str,
        kind: EventKind,
        payload: Value,
    ) -> Vec<RewriteCommand>;
}

/// Element handler bound to a selector
#[derive(Debug, Clone)]
pub struct ElementListener {
    /// Parsed selector
    pub selector: Selector,
    /// Registration token
    pub handler_id: String,
    /// Implemented event kinds
    pub methods: Vec<EventKind>,
}

/// Document-wide handler
#[derive(Debug, Clone)]
pub struct DocumentListener {
    /// Registration token
    pub handler_id: String,
    /// Implemented event kinds
    pub methods: Vec<EventKind>,
}

/// Streaming rewriter over a fixed set of listeners
#[derive(Debug, Clone, Default)]
pub struct NativeRewriter {
    elements: Vec<ElementListener>,
    documents: Vec<DocumentListener>,
}

impl NativeRewriter {
    /// Create a rewriter
    pub fn new(elements: Vec<ElementListener>, documents: Vec<DocumentListener>) -> Self {
        Self {
            elements,
            documents,
        }
    }

    /// Build from a transform request, parsing every selector
    pub fn from_request(request: &TransformRequest) -> Result<Self, BridgeError> {
        let elements = request
            .element_handlers
            .iter()
            .map(|handler| {
                Ok(ElementListener {
                    selector: Selector::parse(&handler.selector)?,
                    handler_id: handler.handler_id.clone(),
                    methods: handler.methods.clone(),
                })
            })
            .collect::<Result<Vec<_>, BridgeError>>()?;

        let documents = request
            .document_handlers
            .iter()
            .map(|handler| DocumentListener {
                handler_id: handler.handler_id.clone(),
                methods: handler.methods.clone(),
            })
            .collect();

        Ok(Self::new(elements, documents))
    }

    /// Rewrite `input`, delivering events to `sink`
    pub async fn run<S: EventSink>(&self, input: &str, sink: &mut S) -> String {
        let mut run = Run {
            rewriter: self,
            sink,
            out: String::with_capacity(input.len()),
            stack: Vec::new(),
        };

        for token in Tokenizer::new(input) {
            match token {
                Token::Text(text) => run.text(text).await,
                Token::Comment { raw, text } => run.comment(raw, text).await,
                Token::Doctype { raw, name } => run.doctype(raw, name).await,
                Token::StartTag {
                    raw,
                    name,
                    attributes,
                    self_closing,
                } => run.start_tag(raw, name, attributes, self_closing).await,
                Token::EndTag { raw, name } => run.end_tag(raw, name).await,
                Token::Other(raw) => {
                    if !run.suppressed() {
                        run.out.push_str(&raw);
                    }
                }
            }
        }

        run.finish().await
    }
}

struct Open {
    info: ElementInfo,
    namespace: &'static str,
    matched: Vec<usize>,
    suppress_children: bool,
    removed: bool,
    keep_end_tag: bool,
    append: String,
    after: String,
    end_tag_handlers: Vec<String>,
}

impl Open {
    fn placeholder(name: &str) -> Self {
        Self {
            info: ElementInfo::new(name, Vec::new()),
            namespace: HTML_NS,
            matched: Vec::new(),
            suppress_children: true,
            removed: true,
            keep_end_tag: false,
            append: String::new(),
            after: String::new(),
            end_tag_handlers: Vec::new(),
        }
    }
}

#[derive(Default)]
struct ElementState {
    attributes: Vec<(String, String)>,
    attributes_changed: bool,
    before: String,
    after: String,
    prepend: String,
    append: String,
    inner: Option<String>,
    outer: Option<String>,
    removed: bool,
    keep_content: bool,
    end_tag_handlers: Vec<String>,
}

impl ElementState {
    fn apply(&mut self, command: RewriteCommand) {
        match command {
            RewriteCommand::SetAttribute { name, value } => {
                let name = name.to_ascii_lowercase();
                match self.attributes.iter_mut().find(|(k, _)| *k == name) {
                    Some(slot) => slot.1 = value,
                    None => self.attributes.push((name, value)),
                }
                self.attributes_changed = true;
            }
            RewriteCommand::RemoveAttribute { name } => {
                let name = name.to_ascii_lowercase();
                self.attributes.retain(|(k, _)| *k != name);
                self.attributes_changed = true;
            }
            RewriteCommand::AddClass { name } => self.toggle_class(&name, Some(true)),
            RewriteCommand::RemoveClass { name } => self.toggle_class(&name, Some(false)),
            RewriteCommand::ToggleClass { name, force } => self.toggle_class(&name, force),
            RewriteCommand::SetInnerContent(content) => {
                self.inner = Some(content.render());
                self.prepend.clear();
                self.append.clear();
            }
            RewriteCommand::SetOuterContent(content) | RewriteCommand::Replace(content) => {
                self.outer = Some(content.render());
                self.removed = true;
            }
            RewriteCommand::Append(content) => self.append.push_str(&content.render()),
            RewriteCommand::Prepend(content) => self.prepend.insert_str(0, &content.render()),
            RewriteCommand::Before(content) => self.before.push_str(&content.render()),
            RewriteCommand::After(content) => self.after.insert_str(0, &content.render()),
            RewriteCommand::Remove => {
                self.outer = None;
                self.removed = true;
            }
            RewriteCommand::RemoveAndKeepContent => self.keep_content = true,
            RewriteCommand::OnEndTag { handler_id } => self.end_tag_handlers.push(handler_id),
        }
    }

    fn toggle_class(&mut self, class: &str, force: Option<bool>) {
        let mut classes: Vec<String> = self
            .attributes
            .iter()
            .find(|(k, _)| k == "class")
            .map(|(_, v)| v.split_ascii_whitespace().map(str::to_string).collect())
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

        self.apply(RewriteCommand::SetAttribute {
            name: "class".into(),
            value: classes.join(" "),
        });
    }
}

#[derive(Default)]
struct TokenState {
    before: String,
    after: String,
    replacement: Option<String>,
    removed: bool,
}

impl TokenState {
    fn apply(&mut self, command: RewriteCommand) {
        match command {
            RewriteCommand::Before(content) => self.before.push_str(&content.render()),
            RewriteCommand::After(content) => self.after.insert_str(0, &content.render()),
            RewriteCommand::Replace(content) | RewriteCommand::SetOuterContent(content) => {
                self.replacement = Some(content.render());
                self.removed = true;
            }
            RewriteCommand::Remove => {
                self.replacement = None;
                self.removed = true;
            }
            other => debug!(command = other.name(), "Ignoring command not valid for token"),
        }
    }

    fn render(&self, original: &str) -> String {
        let mut out = self.before.clone();
        if self.removed {
            out.push_str(self.replacement.as_deref().unwrap_or(""));
        } else {
            out.push_str(original);
        }
        out.push_str(&self.after);
        out
    }
}

struct Run<'a, S: EventSink> {
    rewriter: &'a NativeRewriter,
    sink: &'a mut S,
    out: String,
    stack: Vec<Open>,
}

impl<'a, S: EventSink> Run<'a, S> {
    fn suppressed(&self) -> bool {
        self.stack.iter().any(|open| open.suppress_children)
    }

    async fn deliver<P: Serialize>(
        &mut self,
        handler_id: &str,
        kind: EventKind,
        payload: &P,
    ) -> Vec<RewriteCommand> {
        let payload = serde_json::to_value(payload).unwrap_or_default();
        self.sink.deliver(handler_id, kind, payload).await
    }

    /// Handlers for a content token: scoped element handlers first, then document handlers
    fn content_listeners(&self, kind: EventKind) -> Vec<String> {
        let in_scope: BTreeSet<usize> = self
            .stack
            .iter()
            .flat_map(|open| open.matched.iter().copied())
            .collect();

        let rewriter = self.rewriter;
        in_scope
            .into_iter()
            .map(|i| &rewriter.elements[i])
            .filter(|listener| listener.methods.contains(&kind))
            .map(|listener| listener.handler_id.clone())
            .chain(
                rewriter
                    .documents
                    .iter()
                    .filter(|listener| listener.methods.contains(&kind))
                    .map(|listener| listener.handler_id.clone()),
            )
            .collect()
    }

    async fn content_token<P: Serialize>(
        &mut self,
        kind: EventKind,
        original: &str,
        payload: &P,
    ) {
        if self.suppressed() {
            return;
        }

        let listeners = self.content_listeners(kind);
        let mut state = TokenState::default();
        for handler_id in listeners {
            if state.removed {
                break;
            }
            for command in self.deliver(&handler_id, kind, payload).await {
                state.apply(command);
            }
        }
        let rendered = state.render(original);
        self.out.push_str(&rendered);
    }

    async fn text(&mut self, text: String) {
        let payload = TextPayload {
            text: text.clone(),
            last_in_text_node: true,
        };
        self.content_token(EventKind::Text, &text, &payload).await;
    }

    async fn comment(&mut self, raw: String, text: String) {
        self.content_token(EventKind::Comments, &raw, &CommentPayload { text })
            .await;
    }

    async fn doctype(&mut self, raw: String, name: Option<String>) {
        if self.suppressed() {
            return;
        }

        let rewriter = self.rewriter;
        let listeners: Vec<String> = rewriter
            .documents
            .iter()
            .filter(|listener| listener.methods.contains(&EventKind::Doctype))
            .map(|listener| listener.handler_id.clone())
            .collect();

        let payload = DoctypePayload {
            name,
            text: raw.clone(),
        };
        let mut state = TokenState::default();
        for handler_id in listeners {
            for command in self.deliver(&handler_id, EventKind::Doctype, &payload).await {
                state.apply(command);
            }
        }
        let rendered = state.render(&raw);
        self.out.push_str(&rendered);
    }

    async fn start_tag(
        &mut self,
        raw: String,
        name: String,
        attributes: Vec<(String, String)>,
        self_closing: bool,
    ) {
        let info = ElementInfo::new(name.as_str(), attributes.clone());
        let void = self_closing || VOID_ELEMENTS.contains(&info.name.as_str());

        if self.suppressed() {
            if !void {
                self.stack.push(Open::placeholder(&info.name));
            }
            return;
        }

        let ancestors: Vec<ElementInfo> = self.stack.iter().map(|open| open.info.clone()).collect();
        let rewriter = self.rewriter;
        let matched: Vec<usize> = rewriter
            .elements
            .iter()
            .enumerate()
            .filter(|(_, listener)| listener.selector.matches(&info, &ancestors))
            .map(|(i, _)| i)
            .collect();

        let namespace = match info.name.as_str() {
            "svg" => SVG_NS,
            "math" => MATHML_NS,
            _ => self.stack.last().map_or(HTML_NS, |parent| parent.namespace),
        };

        let mut state = ElementState {
            attributes: info.attributes.clone(),
            ..Default::default()
        };
        for &i in &matched {
            let listener = &rewriter.elements[i];
            if !listener.methods.contains(&EventKind::Element) {
                continue;
            }
            let payload = ElementPayload {
                tag_name: info.name.clone(),
                namespace_uri: namespace.to_string(),
                attributes: state.attributes.clone(),
                self_closing,
                removed: state.removed,
            };
            for command in self
                .deliver(&listener.handler_id, EventKind::Element, &payload)
                .await
            {
                state.apply(command);
            }
        }

        self.out.push_str(&state.before);

        let start_tag = if state.attributes_changed {
            serialize_start_tag(&name, &state.attributes, self_closing)
        } else {
            raw
        };

        if void {
            if state.removed {
                self.out.push_str(state.outer.as_deref().unwrap_or(""));
            } else if !state.keep_content {
                self.out.push_str(&start_tag);
            }
            self.out.push_str(&state.after);
            if !state.end_tag_handlers.is_empty() {
                debug!(tag = %info.name, "Element has no end tag; end tag handlers not invoked");
            }
            return;
        }

        if state.removed {
            self.out.push_str(state.outer.as_deref().unwrap_or(""));
            self.stack.push(Open {
                info,
                namespace,
                matched,
                suppress_children: true,
                removed: true,
                keep_end_tag: false,
                append: String::new(),
                after: state.after,
                end_tag_handlers: Vec::new(),
            });
            return;
        }

        if !state.keep_content {
            self.out.push_str(&start_tag);
        }
        self.out.push_str(&state.prepend);
        let suppress_children = match &state.inner {
            Some(inner) => {
                self.out.push_str(inner);
                true
            }
            None => false,
        };

        self.stack.push(Open {
            info,
            namespace,
            matched,
            suppress_children,
            removed: false,
            keep_end_tag: !state.keep_content,
            append: state.append,
            after: state.after,
            end_tag_handlers: state.end_tag_handlers,
        });
    }

    async fn end_tag(&mut self, raw: String, name: String) {
        let Some(index) = self.stack.iter().rposition(|open| open.info.name == name) else {
            if !self.suppressed() {
                self.out.push_str(&raw);
            }
            return;
        };

        while self.stack.len() > index + 1 {
            if let Some(open) = self.stack.pop() {
                self.close(open, None).await;
            }
        }
        if let Some(open) = self.stack.pop() {
            self.close(open, Some(raw)).await;
        }
    }

    async fn close(&mut self, open: Open, raw_end: Option<String>) {
        if self.suppressed() {
            return;
        }
        if open.removed {
            self.out.push_str(&open.after);
            return;
        }

        self.out.push_str(&open.append);

        if let Some(raw) = raw_end {
            let payload = EndTagPayload {
                name: open.info.name.clone(),
            };
            let mut state = TokenState::default();
            for handler_id in &open.end_tag_handlers {
                for command in self.deliver(handler_id, EventKind::EndTag, &payload).await {
                    state.apply(command);
                }
            }
            if open.keep_end_tag {
                let rendered = state.render(&raw);
                self.out.push_str(&rendered);
            } else {
                self.out.push_str(&state.before);
                self.out.push_str(&state.after);
            }
        }

        self.out.push_str(&open.after);
    }

    async fn finish(mut self) -> String {
        while let Some(open) = self.stack.pop() {
            self.close(open, None).await;
        }

        let rewriter = self.rewriter;
        for listener in rewriter
            .documents
            .iter()
            .filter(|listener| listener.methods.contains(&EventKind::End))
        {
            for command in self.deliver(&listener.handler_id, EventKind::End, &json!({})).await {
                match command {
                    RewriteCommand::Append(content) => self.out.push_str(&content.render()),
                    other => debug!(command = other.name(), "Ignoring command at document end"),
                }
            }
        }

        self.out
    }
}

fn serialize_start_tag(name: &str, attributes: &[(String, String)], self_closing: bool) -> String {
    let mut tag = format!("<{}", name);
    for (key, value) in attributes {
        tag.push(' ');
        tag.push_str(key);
        tag.push_str("=\"");
        for c in value.chars() {
            match c {
                '&' => tag.push_str("&amp;"),
                '"' => tag.push_str("&quot;"),
                c => tag.push(c),
            }
        }
        tag.push('"');
    }
    if self_closing {
        tag.push_str(" /");
    }
    tag.push('>');
    tag
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Comment {
        raw: String,
        text: String,
    },
    Doctype {
        raw: String,
        name: Option<String>,
    },
    StartTag {
        raw: String,
        name: String,
        attributes: Vec<(String, String)>,
        self_closing: bool,
    },
    EndTag {
        raw: String,
        name: String,
    },
    /// Processing instructions, CDATA and other declarations, passed through
    Other(String),
}

struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
    raw_text_end: Option<String>,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            raw_text_end: None,
        }
    }

    fn take(&mut self, len: usize, token: Token) -> Option<Token> {
        self.pos += len;
        Some(token)
    }
}

/// Offset of the `</name` that closes a raw-text element, or the input length
fn raw_text_end(rest: &str, name: &str) -> usize {
    let lower = rest.to_ascii_lowercase();
    let closing = format!("</{}", name);
    let mut from = 0;
    while let Some(i) = lower[from..].find(&closing) {
        let at = from + i;
        match lower.as_bytes().get(at + closing.len()).copied() {
            None | Some(b'>' | b'/') => return at,
            Some(b) if b.is_ascii_whitespace() => return at,
            _ => from = at + closing.len(),
        }
    }
    rest.len()
}

impl Iterator for Tokenizer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        let rest = &self.input[self.pos..];
        if rest.is_empty() {
            return None;
        }

        if let Some(name) = self.raw_text_end.take() {
            let end = raw_text_end(rest, &name);
            if end > 0 {
                return self.take(end, Token::Text(rest[..end].to_string()));
            }
        }

        if let Some(after) = rest.strip_prefix("<!--") {
            let (len, text) = match after.find("-->") {
                Some(i) => (4 + i + 3, &after[..i]),
                None => (rest.len(), after),
            };
            let token = Token::Comment {
                raw: rest[..len].to_string(),
                text: text.to_string(),
            };
            return self.take(len, token);
        }

        if rest.starts_with("<!") || rest.starts_with("<?") {
            let len = rest.find('>').map_or(rest.len(), |i| i + 1);
            let raw = &rest[..len];
            let body = raw[2..].trim_end_matches('>');
            let is_doctype = body
                .as_bytes()
                .get(..7)
                .map_or(false, |b| b.eq_ignore_ascii_case(b"doctype"));
            let token = if is_doctype {
                Token::Doctype {
                    raw: raw.to_string(),
                    name: body
                        .get(7..)
                        .unwrap_or_default()
                        .split_ascii_whitespace()
                        .next()
                        .map(str::to_ascii_lowercase),
                }
            } else {
                Token::Other(raw.to_string())
            };
            return self.take(len, token);
        }

        if rest.starts_with("</") && starts_with_alpha(&rest[2..]) {
            if let Some(i) = rest.find('>') {
                let name: String = rest[2..i]
                    .chars()
                    .take_while(|c| !c.is_ascii_whitespace() && *c != '/')
                    .collect();
                let token = Token::EndTag {
                    raw: rest[..=i].to_string(),
                    name: name.to_ascii_lowercase(),
                };
                return self.take(i + 1, token);
            }
        }

        if rest.starts_with('<') && starts_with_alpha(&rest[1..]) {
            if let Some((len, token)) = parse_start_tag(rest) {
                if let Token::StartTag {
                    name, self_closing, ..
                } = &token
                {
                    let lower = name.to_ascii_lowercase();
                    if !self_closing && RAW_TEXT_ELEMENTS.contains(&lower.as_str()) {
                        self.raw_text_end = Some(lower);
                    }
                }
                return self.take(len, token);
            }
        }

        let start = if rest.starts_with('<') { 1 } else { 0 };
        let len = rest[start..]
            .match_indices('<')
            .map(|(i, _)| i + start)
            .find(|&i| starts_token(&rest[i..]))
            .unwrap_or(rest.len());
        self.take(len, Token::Text(rest[..len].to_string()))
    }
}

fn starts_with_alpha(s: &str) -> bool {
    s.chars().next().map_or(false, |c| c.is_ascii_alphabetic())
}

fn starts_token(s: &str) -> bool {
    s.starts_with("<!")
        || s.starts_with("<?")
        || (s.starts_with("</") && starts_with_alpha(&s[2..]))
        || starts_with_alpha(&s[1..])
}

fn parse_start_tag(rest: &str) -> Option<(usize, Token)> {
    let bytes = rest.as_bytes();
    let len = bytes.len();
    let mut i = 1;

    while i < len && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' && bytes[i] != b'/' {
        i += 1;
    }
    let name = rest[1..i].to_string();

    let mut attributes: Vec<(String, String)> = Vec::new();
    let mut self_closing = false;

    loop {
        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            return None;
        }
        match bytes[i] {
            b'>' => {
                i += 1;
                break;
            }
            b'/' => {
                if bytes.get(i + 1) == Some(&b'>') {
                    self_closing = true;
                    i += 2;
                    break;
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        let start = i;
        while i < len
            && !bytes[i].is_ascii_whitespace()
            && bytes[i] != b'='
            && bytes[i] != b'>'
            && !(bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'>'))
        {
            i += 1;
        }
        if start == i {
            i += 1;
            continue;
        }
        let key = rest[start..i].to_ascii_lowercase();

        while i < len && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let mut value = String::new();
        if i < len && bytes[i] == b'=' {
            i += 1;
            while i < len && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i < len && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let quote = bytes[i];
                i += 1;
                let value_start = i;
                while i < len && bytes[i] != quote {
                    i += 1;
                }
                if i >= len {
                    return None;
                }
                value = rest[value_start..i].to_string();
                i += 1;
            } else {
                let value_start = i;
                while i < len && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                    i += 1;
                }
                value = rest[value_start..i].to_string();
            }
        }

        if !attributes.iter().any(|(k, _)| *k == key) {
            attributes.push((key, value));
        }
    }

    let token = Token::StartTag {
        raw: rest[..i].to_string(),
        name,
        attributes,
        self_closing,
    };
    Some((i, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::Content;

    type Script = Box<dyn FnMut(&str, EventKind, &Value) -> Vec<RewriteCommand> + Send>;

    struct Scripted {
        script: Script,
        seen: Vec<(String, EventKind, Value)>,
    }

    impl Scripted {
        fn new(
            script: impl FnMut(&str, EventKind, &Value) -> Vec<RewriteCommand> + Send + 'static,
        ) -> Self {
            Self {
                script: Box::new(script),
                seen: Vec::new(),
            }
        }

        fn kinds_for(&self, handler_id: &str) -> Vec<EventKind> {
            self.seen
                .iter()
                .filter(|(id, _, _)| id == handler_id)
                .map(|(_, kind, _)| *kind)
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for Scripted {
        async fn deliver(
            &mut self,
            handler_id: &str,
            kind: EventKind,
            payload: Value,
        ) -> Vec<RewriteCommand> {
            let commands = (self.script)(handler_id, kind, &payload);
            self.seen.push((handler_id.to_string(), kind, payload));
            commands
        }
    }

    fn on(selector: &str, id: &str, methods: &[EventKind]) -> ElementListener {
        ElementListener {
            selector: Selector::parse(selector).unwrap(),
            handler_id: id.to_string(),
            methods: methods.to_vec(),
        }
    }

    fn html(content: &str) -> Content {
        Content {
            content: content.into(),
            html: true,
        }
    }

    fn text(content: &str) -> Content {
        Content {
            content: content.into(),
            html: false,
        }
    }

    async fn rewrite(rewriter: &NativeRewriter, input: &str, sink: &mut Scripted) -> String {
        rewriter.run(input, sink).await
    }

    #[test]
    fn test_tokenizer() {
        let tokens: Vec<Token> =
            Tokenizer::new("<!DOCTYPE html><p class=\"a\" hidden>x &lt; y<br/></p><!-- c -->")
                .collect();
        assert_eq!(
            tokens[0],
            Token::Doctype {
                raw: "<!DOCTYPE html>".into(),
                name: Some("html".into())
            }
        );
        assert!(matches!(
            &tokens[1],
            Token::StartTag { name, attributes, self_closing: false, .. }
                if name == "p" && attributes == &vec![("class".into(), "a".into()), ("hidden".into(), String::new())]
        ));
        assert_eq!(tokens[2], Token::Text("x &lt; y".into()));
        assert!(matches!(&tokens[3], Token::StartTag { self_closing: true, .. }));
        assert!(matches!(&tokens[4], Token::EndTag { name, .. } if name == "p"));
        assert!(matches!(&tokens[5], Token::Comment { text, .. } if text == " c "));
    }

    #[test]
    fn test_tokenizer_raw_text_and_stray_lt() {
        let tokens: Vec<Token> = Tokenizer::new("<script>if (a<b) {}</script>1 < 2").collect();
        assert_eq!(tokens[1], Token::Text("if (a<b) {}".into()));
        assert!(matches!(&tokens[2], Token::EndTag { name, .. } if name == "script"));
        assert_eq!(tokens[3], Token::Text("1 < 2".into()));
    }

    #[test]
    fn test_tokenizer_raw_text_ignores_longer_tag_names() {
        let tokens: Vec<Token> =
            Tokenizer::new("<script>s = '</scripts>';</SCRIPT >x").collect();
        assert_eq!(tokens[1], Token::Text("s = '</scripts>';".into()));
        assert!(matches!(&tokens[2], Token::EndTag { name, .. } if name == "script"));
        assert_eq!(tokens[3], Token::Text("x".into()));
    }

    #[test]
    fn test_tokenizer_multibyte_declarations() {
        let tokens: Vec<Token> = Tokenizer::new("<!———><!abcde€><?xml é?><!doctype").collect();
        assert_eq!(
            tokens,
            vec![
                Token::Other("<!———>".into()),
                Token::Other("<!abcde€>".into()),
                Token::Other("<?xml é?>".into()),
                Token::Doctype {
                    raw: "<!doctype".into(),
                    name: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_multibyte_declaration_passes_through() {
        let input = "<!———><p>é</p>";
        let mut sink = Scripted::new(|_, _, _| Vec::new());
        let out = rewrite(&NativeRewriter::default(), input, &mut sink).await;
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_passthrough_without_listeners() {
        let input = "<!doctype html><html><body><p id=x>Hi <b>there</b></p><img src=a.png></body></html>";
        let mut sink = Scripted::new(|_, _, _| Vec::new());
        let out = rewrite(&NativeRewriter::default(), input, &mut sink).await;
        assert_eq!(out, input);
        assert!(sink.seen.is_empty());
    }

    #[tokio::test]
    async fn test_attribute_commands() {
        let rewriter = NativeRewriter::new(vec![on("a", "h1", &[EventKind::Element])], vec![]);
        let mut sink = Scripted::new(|_, _, _| {
            vec![
                RewriteCommand::SetAttribute {
                    name: "href".into(),
                    value: "https://x.test/?a=1&b=\"2\"".into(),
                },
                RewriteCommand::AddClass { name: "ext".into() },
                RewriteCommand::RemoveAttribute {
                    name: "target".into(),
                },
            ]
        });
        let out = rewrite(&rewriter, r#"<a href="/" target=_blank class="nav">go</a>"#, &mut sink).await;
        assert_eq!(
            out,
            r#"<a href="https://x.test/?a=1&amp;b=&quot;2&quot;" class="nav ext">go</a>"#
        );
    }

    #[tokio::test]
    async fn test_remove_after_inner_content_wins() {
        let rewriter = NativeRewriter::new(
            vec![
                on("div", "outer", &[EventKind::Element]),
                on("span", "inner", &[EventKind::Element, EventKind::Text]),
            ],
            vec![],
        );
        let mut sink = Scripted::new(|id, _, _| {
            if id == "outer" {
                vec![
                    RewriteCommand::SetInnerContent(text("x")),
                    RewriteCommand::Remove,
                ]
            } else {
                Vec::new()
            }
        });
        let out = rewrite(&rewriter, "<p>a</p><div><span>b</span></div><p>c</p>", &mut sink).await;
        assert_eq!(out, "<p>a</p><p>c</p>");
        assert!(sink.kinds_for("inner").is_empty());
    }

    #[tokio::test]
    async fn test_inner_content_suppresses_children() {
        let rewriter = NativeRewriter::new(
            vec![
                on("div", "d", &[EventKind::Element]),
                on("b", "b", &[EventKind::Element]),
            ],
            vec![],
        );
        let mut sink = Scripted::new(|id, _, _| {
            if id == "d" {
                vec![
                    RewriteCommand::SetInnerContent(text("<safe>")),
                    RewriteCommand::Append(html("<i>!</i>")),
                ]
            } else {
                Vec::new()
            }
        });
        let out = rewrite(&rewriter, "<div><div><b>old</b></div></div>", &mut sink).await;
        assert_eq!(out, "<div>&lt;safe&gt;<i>!</i></div>");
        assert!(sink.kinds_for("b").is_empty());
    }

    #[tokio::test]
    async fn test_insertion_order() {
        let rewriter = NativeRewriter::new(vec![on("p", "p", &[EventKind::Element])], vec![]);
        let mut sink = Scripted::new(|_, _, _| {
            vec![
                RewriteCommand::Before(html("1")),
                RewriteCommand::Before(html("2")),
                RewriteCommand::After(html("4")),
                RewriteCommand::After(html("3")),
                RewriteCommand::Prepend(html("b")),
                RewriteCommand::Prepend(html("a")),
                RewriteCommand::Append(html("y")),
                RewriteCommand::Append(html("z")),
            ]
        });
        let out = rewrite(&rewriter, "<p>-</p>", &mut sink).await;
        assert_eq!(out, "12<p>ab-yz</p>34");
    }

    #[tokio::test]
    async fn test_replace_and_remove_and_keep_content() {
        let rewriter = NativeRewriter::new(
            vec![
                on("em", "em", &[EventKind::Element]),
                on("u", "u", &[EventKind::Element]),
            ],
            vec![],
        );
        let mut sink = Scripted::new(|id, _, _| {
            if id == "em" {
                vec![RewriteCommand::Replace(html("<strong>E</strong>"))]
            } else {
                vec![RewriteCommand::RemoveAndKeepContent]
            }
        });
        let out = rewrite(&rewriter, "<em>e</em> <u>kept</u>", &mut sink).await;
        assert_eq!(out, "<strong>E</strong> kept");
    }

    #[tokio::test]
    async fn test_end_tag_handler_fires_for_its_element_only() {
        let rewriter = NativeRewriter::new(vec![on("li.mark", "li", &[EventKind::Element])], vec![]);
        let mut sink = Scripted::new(|id, kind, _| match (id, kind) {
            ("li", EventKind::Element) => vec![RewriteCommand::OnEndTag {
                handler_id: "end-1".into(),
            }],
            ("end-1", EventKind::EndTag) => vec![RewriteCommand::Before(html("!"))],
            _ => Vec::new(),
        });
        let out = rewrite(
            &rewriter,
            "<ul><li>a</li><li class=mark>b</li><li>c</li></ul>",
            &mut sink,
        )
        .await;
        assert_eq!(out, "<ul><li>a</li><li class=mark>b!</li><li>c</li></ul>");
        assert_eq!(sink.kinds_for("end-1"), vec![EventKind::EndTag]);
    }

    #[tokio::test]
    async fn test_void_element_never_fires_end_tag() {
        let rewriter = NativeRewriter::new(vec![on("img", "img", &[EventKind::Element])], vec![]);
        let mut sink = Scripted::new(|id, _, _| {
            if id == "img" {
                vec![RewriteCommand::OnEndTag {
                    handler_id: "end".into(),
                }]
            } else {
                Vec::new()
            }
        });
        let out = rewrite(&rewriter, "<p><img src=a></p>", &mut sink).await;
        assert_eq!(out, "<p><img src=a></p>");
        assert!(sink.kinds_for("end").is_empty());
    }

    #[tokio::test]
    async fn test_comments_only_handler_never_sees_elements() {
        let rewriter = NativeRewriter::new(
            vec![on("div", "c", &[EventKind::Comments])],
            vec![],
        );
        let mut sink = Scripted::new(|_, _, _| vec![RewriteCommand::Remove]);
        let out = rewrite(
            &rewriter,
            "<!-- out --><div><!-- in --><p>t</p></div>",
            &mut sink,
        )
        .await;
        assert_eq!(out, "<!-- out --><div><p>t</p></div>");
        assert_eq!(sink.kinds_for("c"), vec![EventKind::Comments]);
    }

    #[tokio::test]
    async fn test_document_handlers() {
        let rewriter = NativeRewriter::new(
            vec![],
            vec![DocumentListener {
                handler_id: "doc".into(),
                methods: vec![EventKind::Doctype, EventKind::Text, EventKind::End],
            }],
        );
        let mut sink = Scripted::new(|_, kind, payload| match kind {
            EventKind::Text if payload["text"] == "secret" => {
                vec![RewriteCommand::Replace(text("[redacted]"))]
            }
            EventKind::End => vec![RewriteCommand::Append(html("<!-- done -->"))],
            _ => Vec::new(),
        });
        let out = rewrite(&rewriter, "<!DOCTYPE html><p>secret</p>", &mut sink).await;
        assert_eq!(out, "<!DOCTYPE html><p>[redacted]</p><!-- done -->");
        assert_eq!(
            sink.kinds_for("doc"),
            vec![EventKind::Doctype, EventKind::Text, EventKind::End]
        );
    }

    #[tokio::test]
    async fn test_element_payload() {
        let rewriter = NativeRewriter::new(vec![on("circle", "c", &[EventKind::Element])], vec![]);
        let mut sink = Scripted::new(|_, _, _| Vec::new());
        rewrite(&rewriter, "<svg><circle r=\"2\"/></svg>", &mut sink).await;
        let (_, _, payload) = &sink.seen[0];
        assert_eq!(payload["tagName"], json!("circle"));
        assert_eq!(payload["namespaceURI"], json!(SVG_NS));
        assert_eq!(payload["attributes"], json!([["r", "2"]]));
        assert_eq!(payload["selfClosing"], json!(true));
    }

    #[tokio::test]
    async fn test_unclosed_elements_are_closed_at_end() {
        let rewriter = NativeRewriter::new(vec![on("p", "p", &[EventKind::Element])], vec![]);
        let mut sink = Scripted::new(|_, _, _| vec![RewriteCommand::Append(html("."))]);
        let out = rewrite(&rewriter, "<div><p>one", &mut sink).await;
        assert_eq!(out, "<div><p>one.");
    }
}
