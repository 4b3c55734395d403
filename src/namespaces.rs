use std::collections::{BTreeSet, HashMap};

use crate::dom::{Element, Node};

pub const XHTML: &str = "http://www.w3.org/1999/xhtml";
pub const EPUB: &str = "http://www.idpf.org/2007/ops";
pub const RDF: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
pub const DC: &str = "http://purl.org/dc/elements/1.1/";
pub const LRMI: &str = "http://lrmi.net/the-specification";
pub const BIB: &str = "http://bibtexml.sf.net/";
pub const DATA: &str = "http://www.w3.org/TR/html5/dom.html#custom-data-attribute";
pub const QML: &str = "http://cnx.rice.edu/qml/1.0";
pub const DATADEV: &str = "http://dev.w3.org/html5/spec/#custom";
pub const MOD: &str = "http://cnx.rice.edu/#moduleIds";
pub const MDML: &str = "http://cnx.rice.edu/mdml";
pub const CNXML: &str = "http://cnx.rice.edu/cnxml";
pub const COLLXML: &str = "http://cnx.rice.edu/collxml";
pub const MATHML: &str = "http://www.w3.org/1998/Math/MathML";
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";

/// Prefix declarations carried by every emitted XHTML document, in emission order.
pub const PREFIXES: &[(&str, &str)] = &[
    ("epub", EPUB),
    ("rdf", RDF),
    ("dc", DC),
    ("lrmi", LRMI),
    ("bib", BIB),
    ("data", DATA),
    ("qml", QML),
    ("datadev", DATADEV),
    ("mod", MOD),
    ("md", MDML),
    ("c", CNXML),
    ("col", COLLXML),
    ("m", MATHML),
];

pub fn uri_for_prefix(prefix: &str) -> Option<&'static str> {
    PREFIXES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, uri)| *uri)
}

/// Root `<html>` with the default XHTML namespace and the full prefix map.
pub fn html_root(lang: &str) -> Element {
    let mut root = Element::new("html").with_attr("xmlns", XHTML);
    for (prefix, uri) in PREFIXES {
        root.set_attr(format!("xmlns:{prefix}"), *uri);
    }
    if !lang.is_empty() {
        root.set_attr("lang", lang);
    }
    root.namespace = Some(XHTML.to_owned());
    root
}

/// Hoists every prefixed namespace declaration to the root and drops prefixes that
/// no element or attribute name uses. Default-namespace declarations on descendants
/// survive only where they differ from the root's (inline MathML, SVG).
pub fn cleanup(root: &mut Element) {
    let mut declared: HashMap<String, String> = HashMap::new();
    let mut used: BTreeSet<String> = BTreeSet::new();
    let root_default = root.attr("xmlns").map(str::to_owned);

    for (key, value) in &root.attrs {
        if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared.insert(prefix.to_owned(), value.clone());
        }
    }
    collect_usage(root, &mut used);
    for child in root.children.iter_mut() {
        if let Node::Element(el) = child {
            strip_declarations(el, root_default.as_deref(), &mut declared);
        }
    }

    root.attrs.retain(|(key, _)| !key.starts_with("xmlns:"));
    for prefix in used {
        if prefix == "xml" || prefix == "xmlns" {
            continue;
        }
        let uri = declared
            .get(&prefix)
            .cloned()
            .or_else(|| uri_for_prefix(&prefix).map(str::to_owned));
        match uri {
            Some(uri) => root.attrs.push((format!("xmlns:{prefix}"), uri)),
            None => tracing::warn!(prefix = %prefix, "no namespace known for prefix"),
        }
    }
}

fn collect_usage(el: &Element, used: &mut BTreeSet<String>) {
    if let Some(prefix) = el.prefix() {
        used.insert(prefix.to_owned());
    }
    for (key, _) in &el.attrs {
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        if let Some((prefix, _)) = key.split_once(':') {
            used.insert(prefix.to_owned());
        }
    }
    for child in el.child_elements() {
        collect_usage(child, used);
    }
}

fn strip_declarations(
    el: &mut Element,
    root_default: Option<&str>,
    declared: &mut HashMap<String, String>,
) {
    el.attrs.retain(|(key, value)| {
        if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared
                .entry(prefix.to_owned())
                .or_insert_with(|| value.clone());
            return false;
        }
        if key == "xmlns" {
            return Some(value.as_str()) != root_default;
        }
        true
    });
    for child in el.child_elements_mut() {
        strip_declarations(child, root_default, declared);
    }
}
