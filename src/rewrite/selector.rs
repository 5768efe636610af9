//! CSS selector subset for element handlers.
//!
//! Supported: `*`, type, `#id`, `.class`, `[attr]`, `[attr=v]`, `[attr~=v]`,
//! `[attr^=v]`, `[attr$=v]`, `[attr*=v]`, compound selectors, the descendant
//! and child combinators, and comma-separated lists.

use crate::error::BridgeError;
use std::fmt;

/// Element facts a selector is matched against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementInfo {
    /// Lower-cased tag name
    pub name: String,
    /// Attributes with lower-cased names
    pub attributes: Vec<(String, String)>,
}

impl ElementInfo {
    /// Create element facts
    pub fn new(name: impl Into<String>, attributes: Vec<(String, String)>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        }
    }

    /// Attribute lookup
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map_or(false, |c| c.split_ascii_whitespace().any(|c| c == class))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals(String),
    Includes(String),
    Prefix(String),
    Suffix(String),
    Substring(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrMatcher {
    name: String,
    op: AttrOp,
}

impl AttrMatcher {
    fn matches(&self, element: &ElementInfo) -> bool {
        let Some(value) = element.attr(&self.name) else {
            return false;
        };
        match &self.op {
            AttrOp::Exists => true,
            AttrOp::Equals(v) => value == v,
            AttrOp::Includes(v) => value.split_ascii_whitespace().any(|w| w == v),
            AttrOp::Prefix(v) => !v.is_empty() && value.starts_with(v.as_str()),
            AttrOp::Suffix(v) => !v.is_empty() && value.ends_with(v.as_str()),
            AttrOp::Substring(v) => !v.is_empty() && value.contains(v.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrMatcher>,
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.id.is_none() && self.classes.is_empty() && self.attrs.is_empty()
    }

    fn matches(&self, element: &ElementInfo) -> bool {
        if let Some(tag) = &self.tag {
            if tag != "*" && *tag != element.name {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if element.attr("id") != Some(id.as_str()) {
                return false;
            }
        }
        self.classes.iter().all(|c| element.has_class(c))
            && self.attrs.iter().all(|a| a.matches(element))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

/// One selector without commas: compounds joined by combinators
#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    /// `(combinator to the previous compound, compound)`; the first combinator is unused
    parts: Vec<(Combinator, Compound)>,
}

impl Complex {
    fn matches(&self, element: &ElementInfo, ancestors: &[ElementInfo]) -> bool {
        self.matches_at(self.parts.len() - 1, element, ancestors)
    }

    fn matches_at(&self, index: usize, element: &ElementInfo, ancestors: &[ElementInfo]) -> bool {
        let (combinator, compound) = &self.parts[index];
        if !compound.matches(element) {
            return false;
        }
        if index == 0 {
            return true;
        }
        match combinator {
            Combinator::Child => match ancestors.split_last() {
                Some((parent, rest)) => self.matches_at(index - 1, parent, rest),
                None => false,
            },
            Combinator::Descendant => (0..ancestors.len())
                .rev()
                .any(|i| self.matches_at(index - 1, &ancestors[i], &ancestors[..i])),
        }
    }
}

/// A parsed, comma-separated selector list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    alternatives: Vec<Complex>,
}

impl Selector {
    /// Parse a selector, rejecting anything outside the supported subset
    pub fn parse(source: &str) -> Result<Self, BridgeError> {
        let invalid = |reason: &str| {
            BridgeError::invalid_argument(format!("Invalid selector '{}': {}", source, reason))
        };

        let mut alternatives = Vec::new();
        for part in split_top_level(source) {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid("empty selector"));
            }
            alternatives.push(Parser::new(part).complex().map_err(|e| invalid(&e))?);
        }
        if alternatives.is_empty() {
            return Err(invalid("empty selector"));
        }

        Ok(Self {
            source: source.to_string(),
            alternatives,
        })
    }

    /// Whether `element`, nested under `ancestors` (outermost first), matches
    pub fn matches(&self, element: &ElementInfo, ancestors: &[ElementInfo]) -> bool {
        self.alternatives
            .iter()
            .any(|alt| alt.matches(element, ancestors))
    }

    /// The selector as written
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn split_top_level(source: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in source.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&source[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&source[start..]);
    parts
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
        }
    }

    fn complex(&mut self) -> Result<Complex, String> {
        let mut parts = Vec::new();
        let mut combinator = Combinator::Descendant;

        loop {
            let saw_space = self.skip_whitespace();
            match self.chars.peek() {
                None => break,
                Some('>') => {
                    self.chars.next();
                    if parts.is_empty() {
                        return Err("selector starts with a combinator".into());
                    }
                    self.skip_whitespace();
                    combinator = Combinator::Child;
                    continue;
                }
                Some(_) => {
                    if !parts.is_empty() && !saw_space && combinator != Combinator::Child {
                        return Err("unexpected character".into());
                    }
                }
            }

            let compound = self.compound()?;
            parts.push((combinator, compound));
            combinator = Combinator::Descendant;
        }

        if parts.is_empty() {
            return Err("empty selector".into());
        }
        if combinator == Combinator::Child {
            return Err("dangling combinator".into());
        }
        Ok(Complex { parts })
    }

    fn compound(&mut self) -> Result<Compound, String> {
        let mut compound = Compound::default();

        if self.chars.peek() == Some(&'*') {
            self.chars.next();
            compound.tag = Some("*".into());
        } else if self.chars.peek().map_or(false, |c| is_ident_char(*c)) {
            compound.tag = Some(self.ident()?.to_ascii_lowercase());
        }

        while let Some(&c) = self.chars.peek() {
            match c {
                '#' => {
                    self.chars.next();
                    compound.id = Some(self.ident()?);
                }
                '.' => {
                    self.chars.next();
                    compound.classes.push(self.ident()?);
                }
                '[' => {
                    self.chars.next();
                    compound.attrs.push(self.attribute()?);
                }
                c if c.is_whitespace() || c == '>' => break,
                c => return Err(format!("unsupported character '{}'", c)),
            }
        }

        if compound.is_empty() {
            return Err("expected a selector".into());
        }
        Ok(compound)
    }

    fn attribute(&mut self) -> Result<AttrMatcher, String> {
        self.skip_whitespace();
        let name = self.ident()?.to_ascii_lowercase();
        self.skip_whitespace();

        let op = match self.chars.next() {
            Some(']') => return Ok(AttrMatcher { name, op: AttrOp::Exists }),
            Some('=') => "=",
            Some(c @ ('~' | '^' | '$' | '*')) => {
                if self.chars.next() != Some('=') {
                    return Err(format!("expected '=' after '{}'", c));
                }
                match c {
                    '~' => "~=",
                    '^' => "^=",
                    '$' => "$=",
                    _ => "*=",
                }
            }
            _ => return Err("malformed attribute selector".into()),
        };

        self.skip_whitespace();
        let value = match self.chars.peek() {
            Some(&q) if q == '"' || q == '\'' => {
                self.chars.next();
                let mut value = String::new();
                loop {
                    match self.chars.next() {
                        Some(c) if c == q => break,
                        Some(c) => value.push(c),
                        None => return Err("unterminated string".into()),
                    }
                }
                value
            }
            _ => self.ident()?,
        };
        self.skip_whitespace();
        if self.chars.next() != Some(']') {
            return Err("expected ']'".into());
        }

        let op = match op {
            "=" => AttrOp::Equals(value),
            "~=" => AttrOp::Includes(value),
            "^=" => AttrOp::Prefix(value),
            "$=" => AttrOp::Suffix(value),
            _ => AttrOp::Substring(value),
        };
        Ok(AttrMatcher { name, op })
    }

    fn ident(&mut self) -> Result<String, String> {
        let mut ident = String::new();
        while let Some(&c) = self.chars.peek() {
            if !is_ident_char(c) {
                break;
            }
            ident.push(c);
            self.chars.next();
        }
        if ident.is_empty() {
            return Err("expected an identifier".into());
        }
        Ok(ident)
    }

    fn skip_whitespace(&mut self) -> bool {
        let mut skipped = false;
        while self.chars.peek().map_or(false, |c| c.is_whitespace()) {
            self.chars.next();
            skipped = true;
        }
        skipped
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || !c.is_ascii()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn el(name: &str, attrs: &[(&str, &str)]) -> ElementInfo {
        ElementInfo::new(
            name,
            attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn matches(selector: &str, element: &ElementInfo, ancestors: &[ElementInfo]) -> bool {
        Selector::parse(selector).unwrap().matches(element, ancestors)
    }

    #[test]
    fn test_simple_selectors() {
        let a = el("A", &[("id", "home"), ("class", "nav link"), ("href", "/docs/intro")]);
        assert!(matches("a", &a, &[]));
        assert!(matches("*", &a, &[]));
        assert!(matches("#home", &a, &[]));
        assert!(matches("a.link.nav", &a, &[]));
        assert!(!matches("a.button", &a, &[]));
        assert!(!matches("div", &a, &[]));
    }

    #[test]
    fn test_attribute_operators() {
        let a = el("a", &[("href", "https://example.com/page"), ("rel", "nofollow noopener")]);
        assert!(matches("[href]", &a, &[]));
        assert!(matches("a[href^='https://']", &a, &[]));
        assert!(matches("a[href$=\"/page\"]", &a, &[]));
        assert!(matches("a[href*=example]", &a, &[]));
        assert!(matches("[rel~=noopener]", &a, &[]));
        assert!(!matches("[rel=noopener]", &a, &[]));
        assert!(!matches("[title]", &a, &[]));
    }

    #[test]
    fn test_combinators() {
        let html = el("html", &[]);
        let body = el("body", &[]);
        let div = el("div", &[("class", "post")]);
        let p = el("p", &[]);

        assert!(matches("body p", &p, &[html.clone(), body.clone(), div.clone()]));
        assert!(matches("div.post > p", &p, &[html.clone(), body.clone(), div.clone()]));
        assert!(!matches("body > p", &p, &[html.clone(), body.clone(), div.clone()]));
        assert!(matches("html div p", &p, &[html, body, div]));
    }

    #[test]
    fn test_selector_list() {
        let h2 = el("h2", &[]);
        assert!(matches("h1, h2", &h2, &[]));
        assert!(!matches("h1, h3", &h2, &[]));
    }

    #[test]
    fn test_invalid_selectors() {
        for bad in ["", "  ", "a >", "> a", "a:hover", "[href", "a,", "a[x|=y]"] {
            let err = Selector::parse(bad).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidArgument, "{}", bad);
        }
    }
}
