//! Emits one book as a single XHTML document.

use crate::bookpart::{Binder, BookPart, Document};
use crate::dom::{Element, Node};
use crate::metadata::{self, BlockKind};
use crate::namespaces;
use crate::toc;

const ACCESSIBILITY_FEATURES: &[&str] = &[
    "alternativeText",
    "captions",
    "structuredNavigation",
    "MathML",
    "longDescription",
    "transcript",
    "tableOfContents",
    "readingOrder",
];

/// Body attributes a page wrapper inherits.
fn copied_body_attr(key: &str) -> bool {
    matches!(key, "class" | "itemscope" | "itemtype" | "lang") || key.starts_with("data-")
}

/// Builds the `<html>` tree of the assembled book rooted at `root`.
pub fn assemble(root: &BookPart) -> Element {
    let md = root.metadata();
    let mut html = namespaces::html_root(md.language.as_deref().unwrap_or_default());

    let mut head = Element::new("head").with_child(Element::new("title").with_text(root.title()));
    for feature in ACCESSIBILITY_FEATURES {
        head.push(
            Element::new("meta")
                .with_attr("itemprop", "accessibilityFeature")
                .with_attr("content", *feature),
        );
    }
    let modified = md
        .revised
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
    head.push(
        Element::new("meta")
            .with_attr("itemprop", "dateModified")
            .with_attr("content", modified),
    );
    html.push(head);

    let mut body = Element::new("body")
        .with_attr("itemscope", "itemscope")
        .with_attr("itemtype", "http://schema.org/Book");
    body.push(metadata::metadata_block(md, BlockKind::Book));
    body.push(toc::nav(root));
    for child in root.children() {
        body.children.extend(emit(child));
    }
    html.push(body);

    namespaces::cleanup(&mut html);
    html
}

fn emit(part: &BookPart) -> Vec<Node> {
    match part {
        BookPart::Collection(binder) | BookPart::Subcollection(binder) => {
            vec![Node::Element(emit_binder(part, binder))]
        }
        BookPart::Document(doc) => emit_document(part, doc),
    }
}

fn emit_binder(part: &BookPart, binder: &Binder) -> Element {
    let mut div = Element::new("div").with_attr("data-type", part.toc_type(false));
    if let Some(class) = &binder.class {
        div.set_attr("class", class.clone());
    }
    div.push(
        Element::new("h1")
            .with_attr("data-type", "document-title")
            .with_text(part.title()),
    );
    div.push(metadata::metadata_block(&binder.metadata, BlockKind::Binder));
    for child in &binder.children {
        div.children.extend(emit(child));
    }
    div
}

fn emit_document(part: &BookPart, doc: &Document) -> Vec<Node> {
    let Some(body) = doc
        .content
        .as_ref()
        .and_then(|html| html.child_elements().find(|el| el.is("body")))
    else {
        tracing::warn!(page = %doc.uuid(), "page has no transformed body; skipped");
        return Vec::new();
    };

    let mut div = Element::new("div")
        .with_attr("data-type", part.toc_type(false))
        .with_attr("id", doc.page_id());
    for (key, value) in &body.attrs {
        if copied_body_attr(key) && key != "data-type" {
            div.set_attr(key.clone(), value.clone());
        }
    }
    div.children = body.children.clone();
    vec![Node::Element(div)]
}
