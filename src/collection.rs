//! Streaming parser for `<slug>.collection.xml` manifests.

use std::path::Path;

use anyhow::Context as _;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::bookpart::{Binder, BookPart, Document};
use crate::container::Container;
use crate::dom::{self, Element, Node};
use crate::error::AssembleError;
use crate::metadata::{self, Metadata, MetadataKind};

/// Open binder on the parse stack.
struct OpenBinder {
    is_root: bool,
    binder: Binder,
}

#[derive(Default)]
struct ManifestParser {
    stack: Vec<OpenBinder>,
    root: Option<BookPart>,
    /// A `<module>` whose end tag has not been seen yet.
    open_module: Option<Document>,
    /// Collects the collection-level `<metadata>` element.
    capture: Vec<Element>,
    /// Nesting depth inside `<md:derived-from>`.
    suppressed: usize,
    /// Text of the `<md:title>` being read.
    title: Option<String>,
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|b| *b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

fn read_attrs(start: &BytesStart<'_>) -> anyhow::Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.context("read manifest attribute")?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(&attr.value).into_owned();
        let value = dom::unescape(&raw).unwrap_or(raw);
        attrs.push((key, value));
    }
    Ok(attrs)
}

/// `data-type`, `cnx-extra:data-type`, ... by local name.
fn attr_local<'a>(attrs: &'a [(String, String)], local: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| key.rsplit(':').next() == Some(local))
        .map(|(_, value)| value.as_str())
}

/// Parses the manifest at `path` into a `BookPart` tree. Module references are
/// resolved against `container`; one that does not resolve to a local CNXML file
/// fails the parse.
pub fn parse_collection(xml: &str, path: &Path, container: &Container) -> anyhow::Result<BookPart> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    let mut parser = ManifestParser::default();

    loop {
        let position = reader.buffer_position();
        let event = reader
            .read_event()
            .with_context(|| format!("parse {} at byte {position}", path.display()))?;
        match event {
            Event::Start(start) => parser.start(&start, false, path, container)?,
            Event::Empty(start) => parser.start(&start, true, path, container)?,
            Event::End(end) => parser.end(local_name(end.name().as_ref()), path)?,
            Event::Text(text) => {
                let raw = String::from_utf8_lossy(&text).into_owned();
                let value = dom::unescape(&raw).unwrap_or(raw);
                parser.text(&value);
            }
            Event::CData(data) => {
                parser.text(&String::from_utf8_lossy(&data.into_inner()));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    parser.root.with_context(|| {
        format!("manifest has no <collection> root: {}", path.display())
    })
}

impl ManifestParser {
    fn start(
        &mut self,
        start: &BytesStart<'_>,
        empty: bool,
        path: &Path,
        container: &Container,
    ) -> anyhow::Result<()> {
        let qname = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let local = String::from_utf8_lossy(local_name(start.name().as_ref())).into_owned();

        if self.suppressed > 0 {
            if local == "derived-from" && !empty {
                self.suppressed += 1;
            }
            return Ok(());
        }

        if !self.capture.is_empty() {
            let mut el = Element::new(qname);
            el.attrs = read_attrs(start)?;
            if empty {
                self.attach_captured(el);
            } else {
                self.capture.push(el);
            }
            return Ok(());
        }

        match local.as_str() {
            "derived-from" => {
                if !empty {
                    self.suppressed = 1;
                }
            }
            "metadata" if self.open_module.is_none() && self.stack.len() == 1 => {
                let mut el = Element::new(qname);
                el.attrs = read_attrs(start)?;
                if empty {
                    self.finish_metadata(el, path)?;
                } else {
                    self.capture.push(el);
                }
            }
            "collection" if self.stack.is_empty() => {
                let attrs = read_attrs(start)?;
                self.stack.push(OpenBinder {
                    is_root: true,
                    binder: binder_from(&attrs),
                });
                if empty {
                    self.close_binder(path)?;
                }
            }
            "subcollection" => {
                let attrs = read_attrs(start)?;
                self.stack.push(OpenBinder {
                    is_root: false,
                    binder: binder_from(&attrs),
                });
                if empty {
                    self.close_binder(path)?;
                }
            }
            "module" => {
                let attrs = read_attrs(start)?;
                let document = attr_local(&attrs, "document").unwrap_or_default().to_owned();
                let Some(info) = container.resolve_document(&document) else {
                    return Err(AssembleError::UnresolvedReference {
                        path: path.to_path_buf(),
                        reference: document,
                    }
                    .into());
                };
                let doc = Document {
                    metadata: Metadata {
                        uuid: info.uuid.clone(),
                        version: info.version.clone(),
                        legacy_id: info.legacy_id.clone(),
                        ..Metadata::default()
                    },
                    composite: attr_local(&attrs, "data-type") == Some("composite-page"),
                    uuid_key: attr_local(&attrs, "data-uuid-key").map(str::to_owned),
                    class: attr_local(&attrs, "class").map(str::to_owned),
                    document_ref: document,
                    source: info.path.clone(),
                    ..Document::default()
                };
                if empty {
                    self.attach(BookPart::Document(doc), path)?;
                } else {
                    self.open_module = Some(doc);
                }
            }
            "title" if is_md_prefixed(&qname) => {
                if !empty {
                    self.title = Some(String::new());
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, local: &[u8], path: &Path) -> anyhow::Result<()> {
        if self.suppressed > 0 {
            if local == b"derived-from" {
                self.suppressed -= 1;
            }
            return Ok(());
        }

        if let Some(el) = self.capture.pop() {
            if self.capture.is_empty() {
                return self.finish_metadata(el, path);
            }
            self.attach_captured(el);
            return Ok(());
        }

        match local {
            b"title" => {
                if let Some(title) = self.title.take() {
                    let title = metadata::normalize_space(&title);
                    if let Some(module) = self.open_module.as_mut() {
                        module.manifest_title = Some(title.clone());
                        module.metadata.title = Some(title);
                    } else if let Some(open) = self.stack.last_mut() {
                        open.binder.metadata.title = Some(title);
                    }
                }
            }
            b"module" => {
                if let Some(doc) = self.open_module.take() {
                    self.attach(BookPart::Document(doc), path)?;
                }
            }
            b"subcollection" | b"collection" => self.close_binder(path)?,
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, value: &str) {
        if self.suppressed > 0 {
            return;
        }
        if let Some(el) = self.capture.last_mut() {
            el.children.push(Node::Text(value.to_owned()));
            return;
        }
        if let Some(title) = self.title.as_mut() {
            title.push_str(value);
        }
    }

    fn attach_captured(&mut self, el: Element) {
        if let Some(parent) = self.capture.last_mut() {
            parent.push(el);
        }
    }

    fn finish_metadata(&mut self, el: Element, path: &Path) -> anyhow::Result<()> {
        let md = metadata::parse_cnxml_metadata(&el, path, MetadataKind::Collection)
            .with_context(|| format!("collection metadata: {}", path.display()))?;
        if let Some(open) = self.stack.last_mut() {
            open.binder.metadata = md;
        }
        Ok(())
    }

    fn close_binder(&mut self, path: &Path) -> anyhow::Result<()> {
        let Some(open) = self.stack.pop() else {
            anyhow::bail!("unbalanced binder end tag in {}", path.display());
        };
        if open.is_root {
            if open.binder.metadata.uuid.is_none() {
                return Err(AssembleError::MissingMetadata {
                    path: path.to_path_buf(),
                    key: "uuid",
                }
                .into());
            }
            self.root = Some(BookPart::Collection(open.binder));
            return Ok(());
        }
        if open.binder.metadata.title.is_none() {
            return Err(AssembleError::MissingMetadata {
                path: path.to_path_buf(),
                key: "title",
            }
            .into());
        }
        self.attach(BookPart::Subcollection(open.binder), path)
    }

    fn attach(&mut self, part: BookPart, path: &Path) -> anyhow::Result<()> {
        let Some(parent) = self.stack.last_mut() else {
            anyhow::bail!("manifest part outside <collection> in {}", path.display());
        };
        parent.binder.children.push(part);
        Ok(())
    }
}

fn is_md_prefixed(qname: &str) -> bool {
    qname.starts_with("md:")
}

fn binder_from(attrs: &[(String, String)]) -> Binder {
    Binder {
        composite: attr_local(attrs, "data-type") == Some("composite-chapter"),
        uuid_key: attr_local(attrs, "data-uuid-key").map(str::to_owned),
        class: attr_local(attrs, "class").map(str::to_owned),
        ..Binder::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> anyhow::Result<(tempfile::TempDir, Container)> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("META-INF"))?;
        std::fs::write(root.join("META-INF/books.xml"), "<container/>")?;
        for (legacy, uuid) in [
            ("m00001", "11111111-1111-1111-1111-111111111111"),
            ("m00002", "22222222-2222-2222-2222-222222222222"),
        ] {
            let dir = root.join("modules").join(legacy);
            std::fs::create_dir_all(&dir)?;
            std::fs::write(
                dir.join("index.cnxml"),
                format!(
                    r#"<document xmlns="http://cnx.rice.edu/cnxml" xmlns:md="http://cnx.rice.edu/mdml"><title>Module {legacy}</title><metadata><md:uuid>{uuid}</md:uuid></metadata><content/></document>"#
                ),
            )?;
        }
        let container = Container::load(root)?;
        Ok((dir, container))
    }

    const MANIFEST: &str = r#"<col:collection xmlns:col="http://cnx.rice.edu/collxml" xmlns:md="http://cnx.rice.edu/mdml">
  <col:metadata>
    <md:title>Physics</md:title>
    <md:uuid>aaaaaaaa-0000-0000-0000-000000000000</md:uuid>
    <md:version>1.0</md:version>
    <md:derived-from url="http://example.org/old"><md:title>Old Physics</md:title></md:derived-from>
    <md:slug>physics</md:slug>
  </col:metadata>
  <col:content>
    <col:module document="m00001"><md:title>Preface</md:title></col:module>
    <col:subcollection data-uuid-key=".unit1">
      <md:title>Unit   One</md:title>
      <col:content>
        <col:module document="m00002" cnx-extra:data-type="composite-page" xmlns:cnx-extra="http://example.org"/>
      </col:content>
    </col:subcollection>
  </col:content>
</col:collection>"#;

    #[test]
    fn builds_binder_tree_with_titles() -> anyhow::Result<()> {
        let (_dir, container) = fixture()?;
        let tree = parse_collection(MANIFEST, Path::new("physics.collection.xml"), &container)?;

        assert_eq!(tree.title(), "Physics");
        assert_eq!(tree.metadata().slug.as_deref(), Some("physics"));
        assert_eq!(
            tree.metadata().derived_from_uri.as_deref(),
            Some("http://example.org/old")
        );

        let children = tree.children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].title(), "Preface");
        assert_eq!(children[1].title(), "Unit One");
        let BookPart::Subcollection(unit) = &children[1] else {
            anyhow::bail!("expected a subcollection");
        };
        assert_eq!(unit.uuid_key.as_deref(), Some(".unit1"));

        let docs = tree.documents();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].uuid(), "11111111-1111-1111-1111-111111111111");
        assert!(docs[1].composite);
        assert_eq!(docs[1].manifest_title, None);
        Ok(())
    }

    #[test]
    fn derived_from_title_does_not_rename_the_book() -> anyhow::Result<()> {
        let (_dir, container) = fixture()?;
        let manifest = MANIFEST.replace(
            "<md:title>Physics</md:title>",
            "<md:derived-from url=\"x\"><md:title>Nope</md:title></md:derived-from><md:title>Physics</md:title>",
        );
        let tree = parse_collection(&manifest, Path::new("p.collection.xml"), &container)?;
        assert_eq!(tree.title(), "Physics");
        Ok(())
    }

    #[test]
    fn unknown_module_is_unresolved() -> anyhow::Result<()> {
        let (_dir, container) = fixture()?;
        let manifest = MANIFEST.replace("m00002", "m99999");
        let err = parse_collection(&manifest, Path::new("p.collection.xml"), &container)
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        assert!(matches!(
            crate::error::find_assemble_error(&err),
            Some(AssembleError::UnresolvedReference { reference, .. }) if reference == "m99999"
        ));
        Ok(())
    }
}
