//! Browser-grade HTML reading for markup that is not well-formed XML.
//!
//! Rendered exercise and interactive HTML often leaves `<p>` open, uses void tags
//! without a slash, or carries named entities such as `&eacute;`. Those strings go
//! through html5ever's tree builder and come back as [`Node`]s.

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::tree_builder::{ElementFlags, NodeOrText, QuirksMode, TreeSink};
use html5ever::{Attribute, ParseOpts, QualName, parse_document};

use crate::dom::{Element, Node};
use crate::namespaces;

/// Parses `html` the way a browser would and returns the `<body>` children. Input
/// that is not already a full document is parsed as the body of one.
pub fn parse_fragment(html: &str) -> Vec<Node> {
    let source = if looks_like_document(html) {
        Cow::Borrowed(html)
    } else {
        Cow::Owned(format!("<!DOCTYPE html><html><head></head><body>{html}</body></html>"))
    };
    parse_document(BodySink::default(), ParseOpts::default())
        .from_utf8()
        .one(source.as_bytes())
}

fn looks_like_document(html: &str) -> bool {
    let head: String = html
        .trim_start()
        .chars()
        .take(9)
        .collect::<String>()
        .to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

type NodeRef = Rc<SinkNode>;

struct SinkNode {
    kind: SinkKind,
    parent: RefCell<Weak<SinkNode>>,
    children: RefCell<Vec<NodeRef>>,
}

enum SinkKind {
    Document,
    Element {
        name: QualName,
        attrs: RefCell<Vec<Attribute>>,
    },
    Text(RefCell<String>),
    Comment(String),
}

impl SinkNode {
    fn new(kind: SinkKind) -> NodeRef {
        Rc::new(Self {
            kind,
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
        })
    }

    fn parent(&self) -> Option<NodeRef> {
        self.parent.borrow().upgrade()
    }

    fn element_name(&self) -> Option<&QualName> {
        match &self.kind {
            SinkKind::Element { name, .. } => Some(name),
            _ => None,
        }
    }
}

fn detach(node: &NodeRef) {
    if let Some(parent) = node.parent() {
        parent.children.borrow_mut().retain(|child| !Rc::ptr_eq(child, node));
    }
    *node.parent.borrow_mut() = Weak::new();
}

fn append_to(parent: &NodeRef, child: NodeOrText<NodeRef>) {
    match child {
        NodeOrText::AppendNode(node) => {
            detach(&node);
            *node.parent.borrow_mut() = Rc::downgrade(parent);
            parent.children.borrow_mut().push(node);
        }
        NodeOrText::AppendText(text) => {
            if let Some(last) = parent.children.borrow().last()
                && let SinkKind::Text(existing) = &last.kind
            {
                existing.borrow_mut().push_str(&text);
                return;
            }
            let node = SinkNode::new(SinkKind::Text(RefCell::new(text.to_string())));
            *node.parent.borrow_mut() = Rc::downgrade(parent);
            parent.children.borrow_mut().push(node);
        }
    }
}

/// Tree sink whose output is the converted `<body>` content.
struct BodySink {
    document: NodeRef,
}

impl Default for BodySink {
    fn default() -> Self {
        Self {
            document: SinkNode::new(SinkKind::Document),
        }
    }
}

impl TreeSink for BodySink {
    type Handle = NodeRef;
    type Output = Vec<Node>;
    type ElemName<'a>
        = &'a QualName
    where
        Self: 'a;

    fn finish(self) -> Self::Output {
        let Some(body) = find_element(&self.document, "html").and_then(|html| find_element(&html, "body")) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for child in body.children.borrow().iter() {
            convert(child, namespaces::XHTML, &mut out);
        }
        out
    }

    fn parse_error(&self, msg: Cow<'static, str>) {
        tracing::trace!(%msg, "html parse error");
    }

    fn get_document(&self) -> Self::Handle {
        Rc::clone(&self.document)
    }

    fn elem_name<'a>(&'a self, target: &'a Self::Handle) -> Self::ElemName<'a> {
        static NONE: QualName = QualName {
            prefix: None,
            ns: html5ever::ns!(),
            local: html5ever::local_name!(""),
        };
        target.element_name().unwrap_or(&NONE)
    }

    fn create_element(&self, name: QualName, attrs: Vec<Attribute>, _flags: ElementFlags) -> Self::Handle {
        SinkNode::new(SinkKind::Element {
            name,
            attrs: RefCell::new(attrs),
        })
    }

    fn create_comment(&self, text: StrTendril) -> Self::Handle {
        SinkNode::new(SinkKind::Comment(text.to_string()))
    }

    fn create_pi(&self, _target: StrTendril, _data: StrTendril) -> Self::Handle {
        SinkNode::new(SinkKind::Comment(String::new()))
    }

    fn append(&self, parent: &Self::Handle, child: NodeOrText<Self::Handle>) {
        append_to(parent, child);
    }

    fn append_based_on_parent_node(
        &self,
        element: &Self::Handle,
        prev_element: &Self::Handle,
        child: NodeOrText<Self::Handle>,
    ) {
        if element.parent().is_some() {
            self.append_before_sibling(element, child);
        } else {
            append_to(prev_element, child);
        }
    }

    fn append_doctype_to_document(&self, _name: StrTendril, _public_id: StrTendril, _system_id: StrTendril) {}

    // Template contents stay inline under the template element.
    fn get_template_contents(&self, target: &Self::Handle) -> Self::Handle {
        Rc::clone(target)
    }

    fn same_node(&self, x: &Self::Handle, y: &Self::Handle) -> bool {
        Rc::ptr_eq(x, y)
    }

    fn set_quirks_mode(&self, _mode: QuirksMode) {}

    fn append_before_sibling(&self, sibling: &Self::Handle, new_node: NodeOrText<Self::Handle>) {
        let Some(parent) = sibling.parent() else {
            return;
        };
        let Some(idx) = parent
            .children
            .borrow()
            .iter()
            .position(|child| Rc::ptr_eq(child, sibling))
        else {
            return;
        };
        let node = match new_node {
            NodeOrText::AppendNode(node) => {
                detach(&node);
                node
            }
            NodeOrText::AppendText(text) => {
                if idx > 0
                    && let SinkKind::Text(existing) = &parent.children.borrow()[idx - 1].kind
                {
                    existing.borrow_mut().push_str(&text);
                    return;
                }
                SinkNode::new(SinkKind::Text(RefCell::new(text.to_string())))
            }
        };
        // Detaching may have shifted the sibling.
        let idx = parent
            .children
            .borrow()
            .iter()
            .position(|child| Rc::ptr_eq(child, sibling))
            .unwrap_or(idx);
        *node.parent.borrow_mut() = Rc::downgrade(&parent);
        parent.children.borrow_mut().insert(idx, node);
    }

    fn add_attrs_if_missing(&self, target: &Self::Handle, attrs: Vec<Attribute>) {
        if let SinkKind::Element { attrs: existing, .. } = &target.kind {
            let mut existing = existing.borrow_mut();
            for attr in attrs {
                if !existing.iter().any(|a| a.name == attr.name) {
                    existing.push(attr);
                }
            }
        }
    }

    fn remove_from_parent(&self, target: &Self::Handle) {
        detach(target);
    }

    fn reparent_children(&self, node: &Self::Handle, new_parent: &Self::Handle) {
        let children = std::mem::take(&mut *node.children.borrow_mut());
        for child in children {
            *child.parent.borrow_mut() = Rc::downgrade(new_parent);
            new_parent.children.borrow_mut().push(child);
        }
    }
}

fn find_element(parent: &NodeRef, local: &str) -> Option<NodeRef> {
    parent
        .children
        .borrow()
        .iter()
        .find(|child| child.element_name().is_some_and(|name| &*name.local == local))
        .cloned()
}

/// Copies the sink tree into owned nodes. Elements leaving the parent's namespace
/// (inline MathML, SVG) get an explicit `xmlns` so the XHTML serialization keeps them.
fn convert(node: &NodeRef, parent_ns: &str, out: &mut Vec<Node>) {
    match &node.kind {
        SinkKind::Document => {}
        SinkKind::Text(text) => out.push(Node::Text(text.borrow().clone())),
        SinkKind::Comment(text) => out.push(Node::Comment(text.clone())),
        SinkKind::Element { name, attrs } => {
            let ns: &str = &name.ns;
            let mut el = Element::new(&*name.local);
            if !ns.is_empty() && ns != parent_ns {
                el.set_attr("xmlns", ns);
            }
            for attr in attrs.borrow().iter() {
                let key = match &attr.name.prefix {
                    Some(prefix) => format!("{}:{}", &**prefix, &*attr.name.local),
                    None => attr.name.local.to_string(),
                };
                el.set_attr(key, attr.value.to_string());
            }
            el.namespace = (!ns.is_empty()).then(|| ns.to_owned());
            for child in node.children.borrow().iter() {
                convert(child, ns, &mut el.children);
            }
            out.push(Node::Element(el));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(nodes: Vec<Node>) -> Element {
        let mut root = Element::new("root");
        root.children = nodes;
        root
    }

    #[test]
    fn named_entities_decode_and_implied_ends_close() {
        let root = root(parse_fragment("<p>caf&eacute; &nbsp;x</p><p>one<p>two"));
        assert_eq!(
            root.to_xml(),
            "<root><p>caf\u{e9} \u{a0}x</p><p>one</p><p>two</p></root>"
        );
    }

    #[test]
    fn void_tags_need_no_close() {
        let root = root(parse_fragment("<p>a<br>b</p><img src=\"x.png\" alt=\"x\">"));
        assert_eq!(root.to_xml(), "<root><p>a<br/>b</p><img src=\"x.png\" alt=\"x\"/></root>");
    }

    #[test]
    fn full_documents_yield_body_content_only() {
        let root = root(parse_fragment(
            "<!DOCTYPE html><html><head><title>T</title></head><body><div>d</div></body></html>",
        ));
        assert_eq!(root.to_xml(), "<root><div>d</div></root>");
    }

    #[test]
    fn inline_math_keeps_its_namespace() {
        let root = root(parse_fragment("<p><math><mi>x</mi></math></p>"));
        let math = root
            .find(|el| el.is("math"))
            .map(|el| (el.attr("xmlns").map(str::to_owned), el.namespace.clone()));
        assert_eq!(
            math,
            Some((
                Some(namespaces::MATHML.to_owned()),
                Some(namespaces::MATHML.to_owned())
            ))
        );
        let mi = root.find(|el| el.is("mi")).and_then(|el| el.attr("xmlns"));
        assert_eq!(mi, None);
    }
}
