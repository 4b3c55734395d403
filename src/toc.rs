use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use anyhow::Context as _;

use crate::bookpart::BookPart;
use crate::dom::Element;
use crate::formats::TocNode;
use crate::slug::node_id;

/// `<nav id="toc">` mirroring the manifest below the book root.
pub fn nav(root: &BookPart) -> Element {
    let mut list = Element::new("ol");
    for child in root.children() {
        list.push(nav_item(child));
    }
    Element::new("nav").with_attr("id", "toc").with_child(list)
}

fn nav_item(part: &BookPart) -> Element {
    let mut li = Element::new("li").with_attr("data-toc-type", part.toc_type(false));
    if let Some(slug) = &part.metadata().slug {
        li.set_attr("data-slug", slug.clone());
    }
    match part {
        BookPart::Document(doc) => {
            li.push(
                Element::new("a")
                    .with_attr("href", format!("#{}", doc.page_id()))
                    .with_text(part.title()),
            );
        }
        BookPart::Collection(_) | BookPart::Subcollection(_) => {
            li.push(Element::new("span").with_text(part.title()));
            let mut list = Element::new("ol");
            for child in part.children() {
                list.push(nav_item(child));
            }
            li.push(list);
        }
    }
    li
}

/// Tree written to `<slug>.toc-metadata.json`.
pub fn toc_metadata(root: &BookPart) -> TocNode {
    toc_node(root, true)
}

fn toc_node(part: &BookPart, is_root: bool) -> TocNode {
    let md = part.metadata();
    let contents = part
        .is_binder()
        .then(|| part.children().iter().map(|child| toc_node(child, false)).collect());
    let toc_target_type = match part {
        BookPart::Document(doc) => doc.class.clone().unwrap_or_default(),
        _ => String::new(),
    };
    TocNode {
        id: node_id(part),
        title: part.title().to_owned(),
        slug: md.slug.clone().unwrap_or_else(|| node_id(part)),
        short_id: md.cnx_archive_shortid.clone(),
        contents,
        toc_type: part.toc_type(is_root).to_owned(),
        toc_target_type,
    }
}

/// Writes `node` as pretty JSON to a new file at `path`.
pub fn write_toc_metadata(path: &Path, node: &TocNode) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(node).context("serialize toc metadata")?;
    let mut out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("open toc metadata output: {}", path.display()))?;
    out.write_all(json.as_bytes())
        .with_context(|| format!("write toc metadata: {}", path.display()))?;
    out.flush().context("flush toc metadata")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookpart::{Binder, Document};
    use crate::metadata::Metadata;

    fn md(title: &str, uuid: &str, slug: &str) -> Metadata {
        Metadata {
            title: Some(title.to_owned()),
            uuid: Some(uuid.to_owned()),
            slug: Some(slug.to_owned()),
            ..Metadata::default()
        }
    }

    fn book() -> BookPart {
        BookPart::Collection(Binder {
            metadata: md("Physics", "b1", "physics"),
            children: vec![
                BookPart::Document(Document {
                    metadata: md("Preface", "p0", "physics-preface"),
                    ..Document::default()
                }),
                BookPart::Subcollection(Binder {
                    metadata: md("Kinematics", "c1", "physics-kinematics"),
                    children: vec![BookPart::Document(Document {
                        metadata: md("Speed", "p1", "physics-kinematics-speed"),
                        class: Some("introduction".to_owned()),
                        ..Document::default()
                    })],
                    ..Binder::default()
                }),
            ],
            ..Binder::default()
        })
    }

    #[test]
    fn nav_links_pages_and_nests_binders() {
        let xml = nav(&book()).to_xml();
        assert!(xml.starts_with(r##"<nav id="toc"><ol><li data-toc-type="page" data-slug="physics-preface"><a href="#page_p0">Preface</a></li>"##), "{xml}");
        assert!(xml.contains(r#"<span>Kinematics</span><ol><li data-toc-type="page""#), "{xml}");
    }

    #[test]
    fn toc_metadata_tree_and_file() -> anyhow::Result<()> {
        let node = toc_metadata(&book());
        assert_eq!(node.toc_type, "book");
        let contents = node.contents.as_deref().unwrap_or_default();
        assert_eq!(contents[0].toc_type, "page");
        assert!(contents[0].contents.is_none());
        assert_eq!(contents[1].toc_type, "chapter");
        let speed = &contents[1].contents.as_deref().unwrap_or_default()[0];
        assert_eq!(speed.toc_target_type, "introduction");

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("physics.toc-metadata.json");
        write_toc_metadata(&path, &node)?;
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(value["contents"][1]["contents"][0]["slug"], "physics-kinematics-speed");
        assert!(write_toc_metadata(&path, &node).is_err());
        Ok(())
    }
}
