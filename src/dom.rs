//! A small owned XML element tree.
//!
//! CNXML modules, collection manifests and the assembled book are all read into
//! [`Element`] trees with `quick-xml`, rewritten in place, and written back out as
//! strings. Qualified names are kept verbatim (`c:link`, `md:title`) and every
//! element also remembers the namespace URI its prefix resolved to at parse time.

use std::borrow::Cow;
use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::namespaces;

#[derive(Debug, thiserror::Error)]
pub enum DomError {
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: u64, message: String },

    #[error("document has no root element")]
    NoRoot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

impl Node {
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Node::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Node::Text(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub namespace: Option<String>,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }

    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn is(&self, local: &str) -> bool {
        self.local_name() == local
    }

    /// Matches on namespace URI and local name. Elements built in code without a
    /// namespace match on local name alone.
    pub fn is_ns(&self, namespace: &str, local: &str) -> bool {
        self.is(local)
            && match self.namespace.as_deref() {
                Some(ns) => ns == namespace,
                None => true,
            }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Attribute lookup ignoring any prefix on the attribute name.
    pub fn attr_local(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == local || key.rsplit(':').next() == Some(local))
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name, value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(key, _)| key == name)?;
        Some(self.attrs.remove(idx).1)
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or_default().split_whitespace()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes().any(|c| c == class)
    }

    pub fn data_type(&self) -> Option<&str> {
        self.attr("data-type")
    }

    /// Concatenated descendant text.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(Node::as_element)
    }

    pub fn child_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(Node::as_element_mut)
    }

    pub fn first_child(&self, local: &str) -> Option<&Element> {
        self.child_elements().find(|el| el.is(local))
    }

    /// Pre-order iterator over this element and all of its descendants.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants { stack: vec![self] }
    }

    pub fn find(&self, pred: impl Fn(&Element) -> bool) -> Option<&Element> {
        self.descendants().find(|el| pred(el))
    }

    pub fn find_all(&self, pred: impl Fn(&Element) -> bool) -> Vec<&Element> {
        self.descendants().filter(|el| pred(el)).collect()
    }

    pub fn element_by_id(&self, id: &str) -> Option<&Element> {
        self.find(|el| el.id() == Some(id))
    }

    /// Visits this element and every descendant, parents before children.
    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut Element)) {
        f(self);
        for child in self.child_elements_mut() {
            child.walk_mut(f);
        }
    }

    /// Fallible variant of [`Element::walk_mut`].
    pub fn try_walk_mut<E>(
        &mut self,
        f: &mut impl FnMut(&mut Element) -> Result<(), E>,
    ) -> Result<(), E> {
        f(self)?;
        for child in self.child_elements_mut() {
            child.try_walk_mut(f)?;
        }
        Ok(())
    }

    /// Offers every descendant element to `f`. When `f` returns replacement nodes the
    /// element is swapped for them and its subtree is not visited; otherwise the
    /// walk descends into it.
    pub fn splice<E>(
        &mut self,
        f: &mut impl FnMut(&mut Element) -> Result<Option<Vec<Node>>, E>,
    ) -> Result<(), E> {
        let children = std::mem::take(&mut self.children);
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Node::Element(mut el) => match f(&mut el)? {
                    Some(replacement) => out.extend(replacement),
                    None => {
                        el.splice(f)?;
                        out.push(Node::Element(el));
                    }
                },
                other => out.push(other),
            }
        }
        self.children = out;
        Ok(())
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        write_element(self, &mut out);
        out
    }
}

pub struct Descendants<'a> {
    stack: Vec<&'a Element>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.stack.pop()?;
        for child in next.children.iter().rev() {
            if let Node::Element(el) = child {
                self.stack.push(el);
            }
        }
        Some(next)
    }
}

fn collect_text(el: &Element, out: &mut String) {
    for child in &el.children {
        match child {
            Node::Text(text) => out.push_str(text),
            Node::Element(inner) => collect_text(inner, out),
            Node::Comment(_) => {}
        }
    }
}

/// Parses a well-formed XML document into its root element.
pub fn parse(xml: &str) -> Result<Element, DomError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    let nodes = TreeBuilder::new().build(&mut reader)?;
    nodes
        .into_iter()
        .find_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
        .ok_or(DomError::NoRoot)
}

/// Parses a well-formed XML fragment (any number of top-level nodes).
pub fn parse_fragment(xml: &str) -> Result<Vec<Node>, DomError> {
    let wrapped = format!("<fragment-root>{xml}</fragment-root>");
    let root = parse(&wrapped)?;
    Ok(root.children)
}

struct TreeBuilder {
    stack: Vec<Element>,
    scopes: Vec<HashMap<String, String>>,
    top: Vec<Node>,
}

impl TreeBuilder {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            scopes: Vec::new(),
            top: Vec::new(),
        }
    }

    fn build(mut self, reader: &mut Reader<&[u8]>) -> Result<Vec<Node>, DomError> {
        loop {
            let position = reader.buffer_position() as u64;
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(err) => {
                    return Err(DomError::Malformed {
                        position,
                        message: err.to_string(),
                    });
                }
            };
            match event {
                Event::Start(start) => {
                    let el = self.open(&start, position)?;
                    self.push_scope(&el);
                    self.stack.push(el);
                }
                Event::Empty(start) => {
                    let el = self.open(&start, position)?;
                    self.attach(Node::Element(el));
                }
                Event::End(end) => {
                    let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    self.close(&name, position)?;
                }
                Event::Text(text) => {
                    let raw = String::from_utf8_lossy(&text).into_owned();
                    let value = unescape_at(&raw, position)?;
                    if !value.is_empty() {
                        self.attach(Node::Text(value));
                    }
                }
                Event::CData(data) => {
                    let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    self.attach(Node::Text(value));
                }
                Event::Comment(comment) => {
                    let value = String::from_utf8_lossy(&comment).into_owned();
                    self.attach(Node::Comment(value));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = self.stack.last() {
            return Err(DomError::Malformed {
                position: reader.buffer_position() as u64,
                message: format!("unclosed element <{}>", open.name),
            });
        }

        Ok(self.top)
    }

    fn open(&mut self, start: &BytesStart<'_>, position: u64) -> Result<Element, DomError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut el = Element::new(name);

        for attr in start.attributes() {
            let attr = attr.map_err(|err| DomError::Malformed {
                position,
                message: err.to_string(),
            })?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let raw = String::from_utf8_lossy(&attr.value).into_owned();
            let value = unescape_at(&raw, position)?;
            el.attrs.push((key, value));
        }

        el.namespace = self.resolve_namespace(&el);
        Ok(el)
    }

    fn resolve_namespace(&self, el: &Element) -> Option<String> {
        let prefix = el.prefix().unwrap_or_default();
        let declared = if prefix.is_empty() {
            el.attr("xmlns")
        } else {
            el.attr(&format!("xmlns:{prefix}"))
        };
        if let Some(uri) = declared {
            return Some(uri.to_owned());
        }
        if prefix == "xml" {
            return Some(namespaces::XML.to_owned());
        }
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(prefix))
            .cloned()
    }

    fn push_scope(&mut self, el: &Element) {
        let mut scope = HashMap::new();
        for (key, value) in &el.attrs {
            if key == "xmlns" {
                scope.insert(String::new(), value.clone());
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                scope.insert(prefix.to_owned(), value.clone());
            }
        }
        self.scopes.push(scope);
    }

    fn close(&mut self, name: &str, position: u64) -> Result<(), DomError> {
        let el = self.stack.pop().ok_or_else(|| DomError::Malformed {
            position,
            message: format!("unexpected end tag </{name}>"),
        })?;
        self.scopes.pop();
        self.attach(Node::Element(el));
        Ok(())
    }

    fn attach(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.top.push(node),
        }
    }

}

fn unescape_at(raw: &str, position: u64) -> Result<String, DomError> {
    unescape(raw).map_err(|err| DomError::Malformed {
        position,
        message: err.to_string(),
    })
}

/// Unescapes character data: the five predefined XML entities and character
/// references.
pub fn unescape(raw: &str) -> Result<String, quick_xml::escape::EscapeError> {
    quick_xml::escape::unescape(raw).map(Cow::into_owned)
}

fn write_element(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.name);
    for (key, value) in &el.attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    if el.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &el.children {
        match child {
            Node::Element(inner) => write_element(inner, out),
            Node::Text(text) => out.push_str(&escape_text(text)),
            Node::Comment(comment) => {
                out.push_str("<!--");
                out.push_str(&comment.replace("--", "- -"));
                out.push_str("-->");
            }
        }
    }
    out.push_str("</");
    out.push_str(&el.name);
    out.push('>');
}

pub fn escape_text(text: &str) -> Cow<'_, str> {
    quick_xml::escape::partial_escape(text)
}

pub fn escape_attr(value: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(value)
}

/// Serializes `root` as a standalone XHTML document.
pub fn to_document(root: &Element) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE html>\n");
    write_element(root, &mut out);
    out.push('\n');
    out
}
