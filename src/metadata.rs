//! Page and book metadata in both dialects: the `md:` block of CNXML/collection
//! files and the `data-type="metadata"` block embedded in XHTML.
//!
//! [`metadata_block`] writes the XHTML dialect and [`parse_xhtml_metadata`] reads it
//! back, so the two must stay in step.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::dom::{Element, Node};
use crate::error::AssembleError;
use crate::license;
use crate::namespaces;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Person {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SuperTag {
    #[serde(rename = "type")]
    pub kind: String,
    pub link: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SuperMetadata {
    pub subject_name: String,
    pub tags: Vec<SuperTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metadata {
    pub title: Option<String>,
    /// Abstract as serialized XHTML markup.
    pub summary: Option<String>,
    pub uuid: Option<String>,
    pub version: Option<String>,
    pub revised: Option<String>,
    pub created: Option<String>,
    pub canonical_book_uuid: Option<String>,
    pub slug: Option<String>,
    pub language: Option<String>,
    pub license_url: Option<String>,
    pub license_text: Option<String>,
    pub authors: Vec<Person>,
    pub editors: Vec<Person>,
    pub illustrators: Vec<Person>,
    pub translators: Vec<Person>,
    pub publishers: Vec<Person>,
    pub copyright_holders: Vec<Person>,
    pub subjects: Vec<String>,
    pub keywords: Vec<String>,
    pub cnx_archive_uri: Option<String>,
    pub cnx_archive_shortid: Option<String>,
    pub derived_from_uri: Option<String>,
    pub derived_from_title: Option<String>,
    pub super_metadata: Option<SuperMetadata>,
    /// Legacy `m<digits>` module id, when the source declares one.
    pub legacy_id: Option<String>,
}

impl Metadata {
    pub fn archive_uri(&self) -> Option<String> {
        match (&self.uuid, &self.version) {
            (Some(uuid), Some(version)) => Some(format!("{uuid}@{version}")),
            (Some(uuid), None) => Some(uuid.clone()),
            _ => None,
        }
    }

    fn finish(&mut self) {
        if self.cnx_archive_uri.is_none() {
            self.cnx_archive_uri = self.archive_uri();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    Collection,
    Document,
}

/// Role names in the order the metadata block lists them.
const ROLES: &[(&str, &str, &str)] = &[
    // (data-type, wrapper class, itemprop)
    ("author", "authors", "author"),
    ("publisher", "publishers", "publisher"),
    ("editor", "editors", "editor"),
    ("illustrator", "illustrators", "illustrator"),
    ("translator", "translators", "contributor"),
    ("copyright-holder", "copyright-holders", "copyrightHolder"),
];

fn role_list_mut<'a>(md: &'a mut Metadata, role: &str) -> Option<&'a mut Vec<Person>> {
    let list = match role {
        "author" => &mut md.authors,
        "editor" => &mut md.editors,
        "illustrator" => &mut md.illustrators,
        "translator" => &mut md.translators,
        "publisher" | "maintainer" => &mut md.publishers,
        "copyright-holder" | "copyright_holder" | "licensor" => &mut md.copyright_holders,
        _ => return None,
    };
    Some(list)
}

fn role_list<'a>(md: &'a Metadata, role: &str) -> &'a [Person] {
    match role {
        "author" => &md.authors,
        "editor" => &md.editors,
        "illustrator" => &md.illustrators,
        "translator" => &md.translators,
        "publisher" => &md.publishers,
        _ => &md.copyright_holders,
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Collapses runs of whitespace in title text.
pub fn normalize_space(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `md:` elements, tolerating versioned namespace URIs (`.../mdml/0.4`).
fn is_md(el: &Element, local: &str) -> bool {
    el.is(local)
        && el
            .namespace
            .as_deref()
            .is_none_or(|ns| ns.starts_with(namespaces::MDML))
}

/// Direct `md:` children first, so titles nested in `md:derived-from` or actor
/// records never shadow the scope's own.
fn md_text(scope: &Element, local: &str) -> Option<String> {
    scope
        .child_elements()
        .find(|el| is_md(el, local))
        .or_else(|| scope.find(|el| is_md(el, local) && !std::ptr::eq(el, scope)))
        .and_then(|el| non_empty(el.text()))
}

fn display_seqs(scope: &Element) -> HashMap<String, i64> {
    scope
        .descendants()
        .filter(|el| el.is("meta") && el.attr("property") == Some("display-seq"))
        .filter_map(|el| {
            let id = el.attr("refines")?.trim_start_matches('#').to_owned();
            let seq = el.attr("content")?.trim().parse::<i64>().ok()?;
            Some((id, seq))
        })
        .collect()
}

/// Unrefined people keep document order and come first; refined ones follow in
/// ascending `display-seq` order.
pub fn order_people(people: Vec<(Option<String>, Person)>, seqs: &HashMap<String, i64>) -> Vec<Person> {
    let mut keyed: Vec<(Option<i64>, usize, Person)> = people
        .into_iter()
        .enumerate()
        .map(|(idx, (refine_key, person))| {
            let seq = refine_key.and_then(|key| seqs.get(&key).copied());
            (seq, idx, person)
        })
        .collect();
    keyed.sort_by_key(|(seq, idx, _)| (*seq, *idx));
    keyed.into_iter().map(|(_, _, person)| person).collect()
}

/// Reads the `md:` metadata of a CNXML module or of a collection's metadata element.
pub fn parse_cnxml_metadata(
    root: &Element,
    path: &Path,
    kind: MetadataKind,
) -> Result<Metadata, AssembleError> {
    let scope = root.find(|el| el.is("metadata")).unwrap_or(root);

    let mut md = Metadata {
        title: md_text(scope, "title")
            .or_else(|| {
                root.child_elements()
                    .find(|el| el.is("title"))
                    .and_then(|el| non_empty(el.text()))
            })
            .or_else(|| {
                root.find(|el| el.data_type() == Some("document-title"))
                    .and_then(|el| non_empty(el.text()))
            })
            .map(|title| normalize_space(&title)),
        uuid: md_text(scope, "uuid"),
        version: md_text(scope, "version"),
        revised: md_text(scope, "revised"),
        created: md_text(scope, "created"),
        canonical_book_uuid: md_text(scope, "canonical-book-uuid"),
        slug: md_text(scope, "slug"),
        language: md_text(scope, "language"),
        legacy_id: md_text(scope, "content-id")
            .or_else(|| root.attr("module-id").map(str::to_owned)),
        cnx_archive_shortid: md_text(scope, "shortId"),
        ..Metadata::default()
    };

    if let Some(abstract_el) = scope.find(|el| is_md(el, "abstract")) {
        let nodes = crate::transform::convert_children(abstract_el);
        let markup: String = nodes.iter().map(node_markup).collect();
        md.summary = non_empty(markup);
    }

    if let Some(license_el) = scope.find(|el| is_md(el, "license"))
        && let Some(url) = license_el.attr("url").or_else(|| license_el.attr("href"))
    {
        let inner = license_el.text();
        let resolved = license::resolve(url, Some(&inner), md.language.as_deref())?;
        md.license_url = Some(resolved.url);
        md.license_text = Some(resolved.text);
    }

    md.subjects = scope
        .find_all(|el| is_md(el, "subject"))
        .into_iter()
        .filter_map(|el| non_empty(el.text()))
        .collect();
    md.keywords = scope
        .find_all(|el| is_md(el, "keyword"))
        .into_iter()
        .filter_map(|el| non_empty(el.text()))
        .collect();

    if let Some(derived) = scope.find(|el| is_md(el, "derived-from")) {
        md.derived_from_uri = derived.attr("url").map(str::to_owned);
        md.derived_from_title = md_text(derived, "title");
    }

    md.super_metadata = scope
        .find(|el| is_md(el, "super"))
        .map(parse_cnxml_super);

    parse_cnxml_people(scope, &mut md);
    md.finish();

    require(&md, path, kind)?;
    Ok(md)
}

fn parse_cnxml_super(el: &Element) -> SuperMetadata {
    let subject_name = el
        .find(|child| is_md(child, "subject-name") || child.is("subject"))
        .map(|child| normalize_space(&child.text()))
        .or_else(|| el.attr("subject-name").map(str::to_owned))
        .unwrap_or_default();
    let tags = el
        .find_all(|child| child.is("tag"))
        .into_iter()
        .map(|tag| SuperTag {
            kind: tag.attr("type").unwrap_or_default().to_owned(),
            link: tag.attr("link").map(str::to_owned),
            text: normalize_space(&tag.text()),
        })
        .collect();
    SuperMetadata { subject_name, tags }
}

fn parse_cnxml_people(scope: &Element, md: &mut Metadata) {
    let mut actors: HashMap<String, Person> = HashMap::new();
    for actor in scope.find_all(|el| {
        is_md(el, "person") || is_md(el, "organization")
    }) {
        let Some(userid) = actor.attr("userid") else {
            continue;
        };
        let name = md_text(actor, "fullname")
            .or_else(|| {
                let parts: Vec<String> = ["firstname", "surname"]
                    .iter()
                    .filter_map(|local| md_text(actor, local))
                    .collect();
                non_empty(parts.join(" "))
            })
            .unwrap_or_else(|| userid.to_owned());
        actors.insert(
            userid.to_owned(),
            Person {
                id: Some(userid.to_owned()),
                name,
                kind: "cnx-id".to_owned(),
            },
        );
    }

    let seqs = display_seqs(scope);
    let mut by_role: HashMap<&'static str, Vec<(Option<String>, Person)>> = HashMap::new();
    for role in scope.find_all(|el| is_md(el, "role")) {
        let Some(kind) = role.attr("type") else {
            continue;
        };
        let Some(bucket) = canonical_role(kind) else {
            tracing::debug!(role = kind, "ignoring unknown metadata role");
            continue;
        };
        for userid in role.text().split_whitespace() {
            let person = actors.get(userid).cloned().unwrap_or_else(|| Person {
                id: Some(userid.to_owned()),
                name: userid.to_owned(),
                kind: "cnx-id".to_owned(),
            });
            by_role
                .entry(bucket)
                .or_default()
                .push((Some(userid.to_owned()), person));
        }
    }

    for (role, people) in by_role {
        if let Some(list) = role_list_mut(md, role) {
            *list = order_people(people, &seqs);
        }
    }
}

fn canonical_role(kind: &str) -> Option<&'static str> {
    let role = match kind {
        "author" => "author",
        "editor" => "editor",
        "illustrator" => "illustrator",
        "translator" => "translator",
        "publisher" | "maintainer" => "publisher",
        "licensor" | "copyright_holder" | "copyright-holder" => "copyright-holder",
        _ => return None,
    };
    Some(role)
}

fn require(md: &Metadata, path: &Path, kind: MetadataKind) -> Result<(), AssembleError> {
    if md.title.is_none() {
        return Err(AssembleError::MissingMetadata {
            path: path.to_path_buf(),
            key: "title",
        });
    }
    if kind == MetadataKind::Collection && md.uuid.is_none() {
        return Err(AssembleError::MissingMetadata {
            path: path.to_path_buf(),
            key: "uuid",
        });
    }
    Ok(())
}

fn node_markup(node: &Node) -> String {
    match node {
        Node::Element(el) => el.to_xml(),
        Node::Text(text) => crate::dom::escape_text(text).into_owned(),
        Node::Comment(_) => String::new(),
    }
}

fn data_value<'a>(block: &'a Element, data_type: &str) -> Option<&'a str> {
    block
        .find(|el| el.data_type() == Some(data_type))
        .and_then(|el| el.attr("data-value"))
        .filter(|value| !value.trim().is_empty())
}

/// Reads a `data-type="metadata"` block (searched for under `root`).
pub fn parse_xhtml_metadata(
    root: &Element,
    path: &Path,
    kind: MetadataKind,
) -> Result<Metadata, AssembleError> {
    let block = root
        .find(|el| el.data_type() == Some("metadata"))
        .unwrap_or(root);

    let mut md = Metadata {
        title: block
            .find(|el| el.data_type() == Some("document-title"))
            .or_else(|| root.find(|el| el.data_type() == Some("document-title")))
            .or_else(|| root.find(|el| el.is("title")))
            .and_then(|el| non_empty(el.text()))
            .map(|title| normalize_space(&title)),
        uuid: data_value(block, "uuid").map(str::to_owned),
        version: data_value(block, "version").map(str::to_owned),
        revised: data_value(block, "revised").map(str::to_owned),
        created: data_value(block, "created").map(str::to_owned),
        canonical_book_uuid: data_value(block, "canonical-book-uuid").map(str::to_owned),
        slug: data_value(block, "slug").map(str::to_owned),
        language: data_value(block, "language").map(str::to_owned),
        cnx_archive_uri: data_value(block, "cnx-archive-uri").map(str::to_owned),
        cnx_archive_shortid: data_value(block, "cnx-archive-shortid").map(str::to_owned),
        legacy_id: data_value(block, "legacy-id").map(str::to_owned),
        ..Metadata::default()
    };

    if md.uuid.is_none()
        && let Some(uri) = &md.cnx_archive_uri
    {
        let (uuid, version) = match uri.split_once('@') {
            Some((uuid, version)) => (uuid, Some(version)),
            None => (uri.as_str(), None),
        };
        md.uuid = non_empty(uuid.to_owned());
        if md.version.is_none() {
            md.version = version.and_then(|v| non_empty(v.to_owned()));
        }
    }

    if let Some(license_el) = block.find(|el| el.data_type() == Some("license"))
        && let Some(url) = license_el.attr("href")
    {
        let inner = license_el.text();
        let resolved = license::resolve(url, Some(&inner), md.language.as_deref())?;
        md.license_url = Some(resolved.url);
        md.license_text = Some(resolved.text);
    }

    if let Some(summary) = block.find(|el| el.data_type() == Some("abstract")) {
        let markup: String = summary.children.iter().map(node_markup).collect();
        md.summary = non_empty(markup);
    }

    md.subjects = block
        .find_all(|el| el.data_type() == Some("subject"))
        .into_iter()
        .filter_map(|el| non_empty(el.text()))
        .collect();
    md.keywords = block
        .find_all(|el| el.data_type() == Some("keyword"))
        .into_iter()
        .filter_map(|el| non_empty(el.text()))
        .collect();

    if let Some(derived) = block.find(|el| el.attr("itemprop") == Some("isBasedOnUrl")) {
        md.derived_from_uri = derived.attr("href").map(str::to_owned);
        md.derived_from_title = non_empty(derived.text());
    }

    if let Some(super_el) = block.find(|el| el.data_type() == Some("super")) {
        md.super_metadata = Some(SuperMetadata {
            subject_name: super_el
                .attr("data-subject-name")
                .unwrap_or_default()
                .to_owned(),
            tags: super_el
                .find_all(|el| el.data_type() == Some("super-tag"))
                .into_iter()
                .map(|tag| SuperTag {
                    kind: tag.attr("data-tag-type").unwrap_or_default().to_owned(),
                    link: tag.attr("data-link").map(str::to_owned),
                    text: normalize_space(&tag.text()),
                })
                .collect(),
        });
    }

    let seqs = display_seqs(block);
    for (data_type, _, _) in ROLES {
        let people: Vec<(Option<String>, Person)> = block
            .find_all(|el| el.data_type() == Some(*data_type))
            .into_iter()
            .map(|el| {
                let refine_key = el.id().map(str::to_owned);
                let person = Person {
                    id: el
                        .attr("data-person-id")
                        .or_else(|| el.id())
                        .map(str::to_owned),
                    name: normalize_space(&el.text()),
                    kind: el
                        .attr("data-person-type")
                        .unwrap_or("cnx-id")
                        .to_owned(),
                };
                (refine_key, person)
            })
            .collect();
        if let Some(list) = role_list_mut(&mut md, data_type) {
            *list = order_people(people, &seqs);
        }
    }

    md.finish();
    require(&md, path, kind)?;
    Ok(md)
}

/// Which flavor of metadata block to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Book,
    Binder,
    Page,
}

fn value_span(data_type: &str, value: &str) -> Element {
    Element::new("span")
        .with_attr("data-type", data_type)
        .with_attr("data-value", value)
}

/// Emits the inline metadata block in the XHTML dialect.
pub fn metadata_block(md: &Metadata, kind: BlockKind) -> Element {
    let mut block = Element::new("div")
        .with_attr("data-type", "metadata")
        .with_attr("style", "display: none;");

    if let Some(title) = &md.title {
        block.push(
            Element::new("h1")
                .with_attr("data-type", "document-title")
                .with_attr("itemprop", "name")
                .with_text(title.clone()),
        );
    }

    let values = [
        ("uuid", &md.uuid),
        ("version", &md.version),
        ("revised", &md.revised),
        ("created", &md.created),
        ("canonical-book-uuid", &md.canonical_book_uuid),
        ("slug", &md.slug),
        ("language", &md.language),
        ("legacy-id", &md.legacy_id),
        ("cnx-archive-uri", &md.cnx_archive_uri),
        ("cnx-archive-shortid", &md.cnx_archive_shortid),
    ];
    for (data_type, value) in values {
        if let Some(value) = value {
            block.push(value_span(data_type, value));
        }
    }
    if let Some(revised) = &md.revised {
        block.push(
            Element::new("meta")
                .with_attr("itemprop", "dateModified")
                .with_attr("content", revised.clone()),
        );
    }

    if kind == BlockKind::Binder {
        block.push(value_span("binding", "translucent"));
    }

    for (data_type, class, itemprop) in ROLES {
        let people = role_list(md, data_type);
        if people.is_empty() {
            continue;
        }
        let mut wrapper = Element::new("div").with_attr("class", *class);
        for person in people {
            let mut span = Element::new("span")
                .with_attr("data-type", *data_type)
                .with_attr("itemprop", *itemprop)
                .with_attr("itemscope", "itemscope")
                .with_attr("itemtype", "http://schema.org/Person")
                .with_attr("data-person-type", person.kind.clone());
            if let Some(id) = &person.id {
                span.set_attr("data-person-id", id.clone());
            }
            wrapper.push(span.with_text(person.name.clone()));
        }
        block.push(wrapper);
    }

    if let Some(uri) = &md.derived_from_uri {
        let title = md.derived_from_title.clone().unwrap_or_else(|| uri.clone());
        block.push(
            Element::new("div")
                .with_attr("class", "derived-from")
                .with_text("Derived from ")
                .with_child(
                    Element::new("a")
                        .with_attr("href", uri.clone())
                        .with_attr("itemprop", "isBasedOnUrl")
                        .with_text(title),
                ),
        );
    }

    if let (Some(url), Some(text)) = (&md.license_url, &md.license_text) {
        block.push(
            Element::new("div").with_attr("class", "permissions").with_child(
                Element::new("p")
                    .with_attr("class", "license")
                    .with_text("Licensed: ")
                    .with_child(
                        Element::new("a")
                            .with_attr("href", url.clone())
                            .with_attr("itemprop", "dc:license,lrmi:useRightsURL")
                            .with_attr("data-type", "license")
                            .with_text(text.clone()),
                    ),
            ),
        );
    }

    if let Some(summary) = &md.summary {
        let mut description = Element::new("div")
            .with_attr("data-type", "abstract")
            .with_attr("itemprop", "description");
        description.children = crate::dom::parse_fragment(summary)
            .unwrap_or_else(|_| crate::html::parse_fragment(summary));
        block.push(description);
    }

    for keyword in &md.keywords {
        block.push(
            Element::new("div")
                .with_attr("itemprop", "keywords")
                .with_attr("data-type", "keyword")
                .with_text(keyword.clone()),
        );
    }
    for subject in &md.subjects {
        block.push(
            Element::new("div")
                .with_attr("itemprop", "about")
                .with_attr("data-type", "subject")
                .with_text(subject.clone()),
        );
    }

    if let Some(super_md) = &md.super_metadata {
        let mut super_el = Element::new("div")
            .with_attr("data-type", "super")
            .with_attr("data-subject-name", super_md.subject_name.clone());
        for tag in &super_md.tags {
            let mut span = Element::new("span")
                .with_attr("data-type", "super-tag")
                .with_attr("data-tag-type", tag.kind.clone());
            if let Some(link) = &tag.link {
                span.set_attr("data-link", link.clone());
            }
            super_el.push(span.with_text(tag.text.clone()));
        }
        block.push(super_el);
    }

    block
}
