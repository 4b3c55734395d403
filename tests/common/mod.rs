#![allow(dead_code)]

use std::path::{Path, PathBuf};

use cnxbook::config::AssembleConfig;

pub static PIXEL_PNG: &[u8] = &[
    137, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82, 0, 0, 0, 1, 0, 0, 0, 1, 8, 4, 0,
    0, 0, 181, 28, 12, 2, 0, 0, 0, 11, 73, 68, 65, 84, 120, 218, 99, 252, 255, 23, 0, 2, 3, 1, 128,
    110, 220, 25, 0, 0, 0, 0, 73, 69, 78, 68, 174, 66, 96, 130,
];

/// A book container on disk plus an output path that does not exist yet.
pub struct Fixture {
    temp: tempfile::TempDir,
    books: Vec<String>,
}

impl Fixture {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            temp: tempfile::TempDir::new()?,
            books: Vec::new(),
        })
    }

    pub fn root(&self) -> PathBuf {
        self.temp.path().join("container")
    }

    pub fn out(&self) -> PathBuf {
        self.temp.path().join("out")
    }

    pub fn write(&self, relative: &str, contents: impl AsRef<[u8]>) -> anyhow::Result<PathBuf> {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// `modules/<legacy>/index.cnxml` with the given CNXML `<content>` children.
    pub fn module(&self, legacy: &str, uuid: &str, title: &str, content: &str) -> anyhow::Result<PathBuf> {
        self.module_with_class(legacy, uuid, title, "", content)
    }

    /// Like [`Fixture::module`] with a `class` on the `<document>` element.
    pub fn module_with_class(
        &self,
        legacy: &str,
        uuid: &str,
        title: &str,
        class: &str,
        content: &str,
    ) -> anyhow::Result<PathBuf> {
        let class = if class.is_empty() {
            String::new()
        } else {
            format!(r#" class="{class}""#)
        };
        self.write(
            &format!("modules/{legacy}/index.cnxml"),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<document xmlns="http://cnx.rice.edu/cnxml" xmlns:md="http://cnx.rice.edu/mdml" cnxml-version="0.7" module-id="{legacy}"{class}>
  <title>{title}</title>
  <metadata>
    <md:title>{title}</md:title>
    <md:uuid>{uuid}</md:uuid>
    <md:version>1</md:version>
    <md:language>en</md:language>
  </metadata>
  <content>{content}</content>
</document>"#
            ),
        )
    }

    /// `collections/<slug>.collection.xml` listing `modules` in order, and an entry in
    /// `META-INF/books.xml`.
    pub fn book(&mut self, slug: &str, uuid: &str, title: &str, modules: &[&str]) -> anyhow::Result<()> {
        let entries: String = modules
            .iter()
            .map(|legacy| format!(r#"<col:module document="{legacy}"/>"#))
            .collect();
        self.write(
            &format!("collections/{slug}.collection.xml"),
            format!(
                r#"<col:collection xmlns:col="http://cnx.rice.edu/collxml" xmlns:md="http://cnx.rice.edu/mdml">
  <col:metadata>
    <md:title>{title}</md:title>
    <md:uuid>{uuid}</md:uuid>
    <md:version>1.0</md:version>
    <md:revised>2024-01-02T00:00:00Z</md:revised>
    <md:language>en</md:language>
  </col:metadata>
  <col:content>{entries}</col:content>
</col:collection>"#
            ),
        )?;
        self.books.push(slug.to_owned());
        let listed: String = self
            .books
            .iter()
            .map(|slug| format!(r#"<book slug="{slug}" style="default"/>"#))
            .collect();
        self.write(
            "META-INF/books.xml",
            format!(
                r#"<container xmlns="https://openstax.org/namespaces/book-container" version="1">{listed}</container>"#
            ),
        )?;
        Ok(())
    }

    pub fn config(&self) -> AssembleConfig {
        AssembleConfig {
            container: self.root(),
            out: self.out(),
            ..AssembleConfig::default()
        }
    }

    pub fn assembled(&self, slug: &str) -> anyhow::Result<String> {
        Ok(std::fs::read_to_string(
            self.out().join(format!("{slug}.assembled.xhtml")),
        )?)
    }
}

pub fn parse_output(xml: &str) -> anyhow::Result<cnxbook::dom::Element> {
    Ok(cnxbook::dom::parse(xml)?)
}

pub fn files_in(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
