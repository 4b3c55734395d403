//! CNXML → XHTML.
//!
//! A [`Transformer`] supplies three steps: MathML lowering on the CNXML tree, the
//! content body, and the metadata block. [`transform_document`] runs them in that
//! order and wraps the result in an XHTML page skeleton.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context as _;

use crate::config::XsltConfig;
use crate::dom::{self, Element, Node};
use crate::error::AssembleError;
use crate::metadata::{self, BlockKind, Metadata};
use crate::namespaces;

pub trait Transformer: Send + Sync {
    /// Rewrites MathML content markup as presentation markup.
    fn lower_mathml(&self, module: Element, path: &Path) -> anyhow::Result<Element>;

    /// The `<body>` element for a module.
    fn content_body(&self, module: &Element, path: &Path) -> anyhow::Result<Element>;

    /// The `data-type="metadata"` block for a module.
    fn metadata_block(
        &self,
        module: &Element,
        md: &Metadata,
        path: &Path,
    ) -> anyhow::Result<Element>;
}

/// Transforms one module into a full XHTML page. Any step failing is fatal for the
/// document and reported with its path.
pub fn transform_document(
    transformer: &dyn Transformer,
    module: Element,
    md: &Metadata,
    path: &Path,
) -> anyhow::Result<Element> {
    let failed = |stage: &'static str, err: anyhow::Error| AssembleError::Transform {
        stage,
        path: path.to_path_buf(),
        detail: format!("{err:#}"),
    };

    let module = transformer
        .lower_mathml(module, path)
        .map_err(|err| failed("lower-mathml", err))?;
    let mut body = transformer
        .content_body(&module, path)
        .map_err(|err| failed("cnxml-to-html5", err))?;
    let block = transformer
        .metadata_block(&module, md, path)
        .map_err(|err| failed("cnxml-to-html5-metadata", err))?;

    body.children.insert(0, Node::Element(block));

    let mut html = namespaces::html_root(md.language.as_deref().unwrap_or_default());
    let title = md.title.clone().unwrap_or_default();
    html.push(Element::new("head").with_child(Element::new("title").with_text(title)));
    html.push(body);
    Ok(html)
}

/// Built-in structural mapping of the CNXML vocabulary.
#[derive(Debug, Clone, Default)]
pub struct NativeTransformer;

impl Transformer for NativeTransformer {
    fn lower_mathml(&self, module: Element, path: &Path) -> anyhow::Result<Element> {
        let has_content_markup = module.find(|el| {
            el.is_ns(namespaces::MATHML, "apply") || el.is_ns(namespaces::MATHML, "csymbol")
        });
        if has_content_markup.is_some() {
            tracing::debug!(
                path = %path.display(),
                "content MathML left as-is by the native transformer"
            );
        }
        Ok(module)
    }

    fn content_body(&self, module: &Element, _path: &Path) -> anyhow::Result<Element> {
        let mut body = Element::new("body");
        if let Some(class) = module.attr("class") {
            body.set_attr("class", class);
        }
        if let Some(lang) = module.attr("xml:lang") {
            body.set_attr("lang", lang);
        }
        body.set_attr("itemscope", "itemscope");
        body.set_attr("itemtype", "http://schema.org/Book");

        let content = module
            .child_elements()
            .find(|el| el.is("content"))
            .context("module has no <content>")?;
        let mut converter = Converter::default();
        body.children = converter.children(content);
        for extra in module
            .child_elements()
            .filter(|el| el.is("glossary") || el.is("bib-file"))
        {
            body.children.extend(converter.node(extra));
        }
        Ok(body)
    }

    fn metadata_block(
        &self,
        _module: &Element,
        md: &Metadata,
        _path: &Path,
    ) -> anyhow::Result<Element> {
        Ok(metadata::metadata_block(md, BlockKind::Page))
    }
}

/// Converts the CNXML children of `el` (used for abstracts and other inline
/// metadata markup).
pub fn convert_children(el: &Element) -> Vec<Node> {
    Converter::default().children(el)
}

#[derive(Default)]
struct Converter {
    section_depth: usize,
    in_table_head: bool,
}

impl Converter {
    fn children(&mut self, el: &Element) -> Vec<Node> {
        el.children.iter().flat_map(|child| self.node_of(child)).collect()
    }

    fn node_of(&mut self, node: &Node) -> Vec<Node> {
        match node {
            Node::Element(el) => self.node(el),
            Node::Text(text) => vec![Node::Text(text.clone())],
            Node::Comment(_) => Vec::new(),
        }
    }

    fn node(&mut self, el: &Element) -> Vec<Node> {
        if el.namespace.as_deref() == Some(namespaces::MATHML) || el.prefix() == Some("m") {
            return vec![Node::Element(el.clone())];
        }
        if el.namespace.as_deref().is_some_and(|ns| ns != namespaces::CNXML) {
            return vec![Node::Element(el.clone())];
        }

        let converted = match el.local_name() {
            "content" => return self.children(el),
            "newline" => {
                let count: usize = el.attr("count").and_then(|c| c.parse().ok()).unwrap_or(1);
                return (0..count.max(1))
                    .map(|_| Node::Element(Element::new("br")))
                    .collect();
            }
            "space" => return vec![Node::text(" ")],
            "tgroup" => return self.children(el),
            "colspec" | "spanspec" => return Vec::new(),
            "section" => {
                self.section_depth += 1;
                let mut section = self.element("section", el);
                section.set_attr("data-depth", self.section_depth.to_string());
                section.children = self.children(el);
                self.section_depth -= 1;
                section
            }
            "title" => self.title(el),
            "para" => self.with_children("p", el),
            "list" => self.list(el),
            "item" => self.with_children("li", el),
            "emphasis" => {
                let tag = match el.attr("effect").unwrap_or("bold") {
                    "italics" => "em",
                    "bold" => "strong",
                    _ => "span",
                };
                let mut out = self.with_children(tag, el);
                if tag == "span"
                    && let Some(effect) = el.attr("effect")
                {
                    out.set_attr("data-effect", effect);
                }
                out
            }
            "term" => self.typed("span", "term", el),
            "foreign" => self.typed("span", "foreign", el),
            "cite-title" => self.typed("span", "cite-title", el),
            "label" => self.typed("span", "label", el),
            "cite" => self.with_children("cite", el),
            "sub" => self.with_children("sub", el),
            "sup" => self.with_children("sup", el),
            "code" | "preformat" => {
                let block = el.local_name() == "preformat" || el.attr("display") == Some("block");
                self.with_children(if block { "pre" } else { "code" }, el)
            }
            "quote" => {
                let tag = if el.attr("display") == Some("inline") {
                    "q"
                } else {
                    "blockquote"
                };
                self.with_children(tag, el)
            }
            "link" => self.link(el),
            "figure" | "subfigure" => self.with_children("figure", el),
            "caption" => self.with_children("figcaption", el),
            "media" => {
                let mut media = self.typed("div", "media", el);
                if let Some(alt) = el.attr("alt") {
                    media.set_attr("data-alt", alt);
                }
                let alt = el.attr("alt").unwrap_or_default().to_owned();
                for child in media.child_elements_mut() {
                    if child.is("img") && child.attr("alt").is_none() {
                        child.set_attr("alt", alt.clone());
                    }
                }
                media
            }
            "image" => self.media_element("img", "src", el),
            "iframe" => self.media_element("iframe", "src", el),
            "object" => self.media_element("object", "data", el),
            "flash" => {
                let mut object = self.media_element("object", "data", el);
                object.set_attr("type", "application/x-shockwave-flash");
                object
            }
            "audio" => {
                let mut audio = self.media_element("audio", "src", el);
                audio.set_attr("controls", "controls");
                audio
            }
            "video" => {
                let mut video = self.media_element("video", "src", el);
                video.set_attr("controls", "controls");
                video
            }
            "download" => {
                let mut a = self.element("a", el);
                if let Some(src) = el.attr("src") {
                    a.set_attr("href", src);
                }
                a.push_text(el.attr("src").unwrap_or_default());
                a
            }
            "table" => {
                let mut table = self.with_children("table", el);
                if let Some(summary) = el.attr("summary") {
                    table.set_attr("summary", summary);
                }
                table
            }
            "thead" => {
                self.in_table_head = true;
                let head = self.with_children("thead", el);
                self.in_table_head = false;
                head
            }
            "tbody" => self.with_children("tbody", el),
            "tfoot" => self.with_children("tfoot", el),
            "row" => self.with_children("tr", el),
            "entry" => {
                let tag = if self.in_table_head { "th" } else { "td" };
                let mut cell = self.with_children(tag, el);
                if let Some(span) = el.attr("morerows").and_then(|v| v.parse::<u32>().ok()) {
                    cell.set_attr("rowspan", (span + 1).to_string());
                }
                cell
            }
            other => self.typed("div", other, el),
        };
        vec![Node::Element(converted)]
    }

    /// Copies `id` and `class`; other CNXML attributes survive as `data-*`.
    fn element(&self, tag: &str, source: &Element) -> Element {
        let mut out = Element::new(tag);
        for (key, value) in &source.attrs {
            if key == "xmlns" || key.starts_with("xmlns:") {
                continue;
            }
            match key.as_str() {
                "id" | "class" => out.set_attr(key.clone(), value.clone()),
                "xml:lang" => out.set_attr("lang", value.clone()),
                "type" => out.set_attr("data-element-type", value.clone()),
                "effect" | "display" | "list-type" | "number-style" | "src" | "url"
                | "target-id" | "document" | "version" | "resource" | "alt" | "mime-type"
                | "width" | "height" | "summary" | "morerows" | "count" | "window" => {}
                _ => {
                    let name = key.rsplit(':').next().unwrap_or(key);
                    out.set_attr(format!("data-{name}"), value.clone());
                }
            }
        }
        out
    }

    fn with_children(&mut self, tag: &str, source: &Element) -> Element {
        let mut out = self.element(tag, source);
        out.children = self.children(source);
        out
    }

    fn typed(&mut self, tag: &str, data_type: &str, source: &Element) -> Element {
        let mut out = self.with_children(tag, source);
        out.set_attr("data-type", data_type);
        out
    }

    fn title(&mut self, el: &Element) -> Element {
        let tag = if self.section_depth > 0 {
            match self.section_depth + 2 {
                depth @ 3..=6 => format!("h{depth}"),
                _ => "h6".to_owned(),
            }
        } else {
            "div".to_owned()
        };
        self.typed(&tag, "title", el)
    }

    fn list(&mut self, el: &Element) -> Element {
        let tag = match el.attr("list-type") {
            Some("enumerated") => "ol",
            _ => "ul",
        };
        let mut list = self.with_children(tag, el);
        if let Some(style) = el.attr("number-style") {
            list.set_attr("data-number-style", style);
        }
        if el.attr("list-type") == Some("labeled-item") {
            list.set_attr("data-labeled-item", "true");
        }
        // List titles render as a leading title div, outside the items.
        let (titles, rest): (Vec<Node>, Vec<Node>) = std::mem::take(&mut list.children)
            .into_iter()
            .partition(|n| matches!(n, Node::Element(e) if e.data_type() == Some("title")));
        if titles.is_empty() {
            list.children = rest;
            return list;
        }
        list.children = rest;
        let mut wrapper = Element::new("div").with_attr("data-type", "list");
        wrapper.children = titles;
        wrapper.push(list);
        wrapper
    }

    fn link(&mut self, el: &Element) -> Element {
        let mut a = self.with_children("a", el);
        let href = if let Some(url) = el.attr("url") {
            Some(url.to_owned())
        } else if let Some(resource) = el.attr("resource") {
            Some(resource.to_owned())
        } else if let Some(document) = el.attr("document") {
            let mut href = format!("/{document}");
            if let Some(version) = el.attr("version") {
                href.push('@');
                href.push_str(version);
            }
            if let Some(target) = el.attr("target-id") {
                href.push('#');
                href.push_str(target);
            }
            Some(href)
        } else {
            el.attr("target-id").map(|target| format!("#{target}"))
        };
        if let Some(href) = href {
            a.set_attr("href", href);
        }
        if el.attr("window") == Some("new") {
            a.set_attr("target", "_window");
        }
        if a.children.is_empty()
            && el.attr("document").is_none()
            && el.attr("target-id").is_none()
            && let Some(href) = a.attr("href").map(str::to_owned)
        {
            a.push_text(href);
        }
        a
    }

    fn media_element(&mut self, tag: &str, src_attr: &str, el: &Element) -> Element {
        let mut out = self.with_children(tag, el);
        if let Some(src) = el.attr("src") {
            out.set_attr(src_attr, src);
        }
        for key in ["width", "height", "alt"] {
            if let Some(value) = el.attr(key) {
                out.set_attr(key, value);
            }
        }
        if let Some(mime) = el.attr("mime-type") {
            out.set_attr("data-media-type", mime);
        }
        out
    }
}

/// Runs the stylesheets through an external `xsltproc`.
#[derive(Debug, Clone)]
pub struct XsltprocTransformer {
    pub bin: String,
    pub xsl_dir: PathBuf,
}

impl XsltprocTransformer {
    pub fn from_config(config: &XsltConfig) -> anyhow::Result<Self> {
        let xsl_dir = config
            .xsl_dir
            .clone()
            .context("--xsl-dir is required for the xsltproc transformer")?;
        Ok(Self {
            bin: config.bin.clone(),
            xsl_dir,
        })
    }

    fn run(&self, sheet: &str, input: &Element) -> anyhow::Result<Element> {
        let sheet_path = self.xsl_dir.join(sheet);
        let mut tmp = tempfile::NamedTempFile::new().context("create xsltproc input file")?;
        std::io::Write::write_all(&mut tmp, input.to_xml().as_bytes())
            .context("write xsltproc input")?;

        tracing::debug!(bin = %self.bin, sheet = %sheet_path.display(), "xsltproc");
        let output = Command::new(&self.bin)
            .arg(&sheet_path)
            .arg(tmp.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawn xsltproc: {}", self.bin))?;
        if !output.status.success() {
            anyhow::bail!(
                "xsltproc {} failed ({}): {}",
                sheet,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8(output.stdout).context("xsltproc output is not UTF-8")?;
        dom::parse(&stdout).with_context(|| format!("parse xsltproc {sheet} output"))
    }
}

impl Transformer for XsltprocTransformer {
    fn lower_mathml(&self, module: Element, _path: &Path) -> anyhow::Result<Element> {
        if module.find(|el| el.is_ns(namespaces::MATHML, "math")).is_none() {
            return Ok(module);
        }
        self.run("c2p.xsl", &module)
    }

    fn content_body(&self, module: &Element, _path: &Path) -> anyhow::Result<Element> {
        let html = self.run("cnxml-to-html5.xsl", module)?;
        html.find(|el| el.is("body"))
            .cloned()
            .context("cnxml-to-html5 output has no <body>")
    }

    fn metadata_block(
        &self,
        module: &Element,
        _md: &Metadata,
        _path: &Path,
    ) -> anyhow::Result<Element> {
        let out = self.run("cnxml-to-html5-metadata.xsl", module)?;
        Ok(out
            .find(|el| el.data_type() == Some("metadata"))
            .cloned()
            .unwrap_or(out))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context as _;

    use super::*;

    fn module(content: &str) -> anyhow::Result<Element> {
        Ok(dom::parse(&format!(
            r#"<document xmlns="http://cnx.rice.edu/cnxml" xmlns:m="http://www.w3.org/1998/Math/MathML" class="introduction"><title>T</title><content>{content}</content></document>"#
        ))?)
    }

    #[test]
    fn native_maps_common_vocabulary() -> anyhow::Result<()> {
        let module = module(
            r#"<section id="s1"><title>Forces</title><para id="p1">A <term>force</term> is <emphasis effect="italics">push</emphasis>.<link document="m42092" target-id="eq-1">see</link></para>
<figure id="f1"><media id="m1" alt="A dot"><image mime-type="image/png" src="dot.png"/></media><caption>Dot</caption></figure>
<list id="l1" list-type="enumerated"><item>one</item></list></section>"#,
        )?;
        let body = NativeTransformer.content_body(&module, Path::new("x"))?;

        assert_eq!(body.attr("class"), Some("introduction"));
        let section = body.find(|el| el.is("section")).context("section")?;
        assert_eq!(section.attr("data-depth"), Some("1"));
        assert!(body.find(|el| el.is("h3") && el.text() == "Forces").is_some());
        let link = body.find(|el| el.is("a")).context("a")?;
        assert_eq!(link.attr("href"), Some("/m42092#eq-1"));
        let img = body.find(|el| el.is("img")).context("img")?;
        assert_eq!(img.attr("src"), Some("dot.png"));
        assert_eq!(img.attr("alt"), Some("A dot"));
        assert!(body.find(|el| el.is("ol")).is_some());
        assert!(body.find(|el| el.is("figcaption")).is_some());
        Ok(())
    }

    #[test]
    fn mathml_is_copied_through() -> anyhow::Result<()> {
        let module = module(r#"<para><m:math><m:mi>x</m:mi></m:math></para>"#)?;
        let body = NativeTransformer.content_body(&module, Path::new("x"))?;
        let math = body.find(|el| el.name == "m:math").context("math")?;
        assert_eq!(math.text(), "x");
        Ok(())
    }

    #[test]
    fn document_wraps_metadata_block_before_content() -> anyhow::Result<()> {
        let md = Metadata {
            title: Some("Intro".to_owned()),
            language: Some("en".to_owned()),
            ..Metadata::default()
        };
        let html = transform_document(
            &NativeTransformer,
            module("<para>Body</para>")?,
            &md,
            Path::new("x"),
        )?;
        assert_eq!(html.attr("lang"), Some("en"));
        let body = html.find(|el| el.is("body")).context("body")?;
        let first = body.child_elements().next().context("first child")?;
        assert_eq!(first.data_type(), Some("metadata"));
        Ok(())
    }

    #[test]
    fn missing_content_is_a_transform_error() -> anyhow::Result<()> {
        let module = dom::parse(r#"<document xmlns="http://cnx.rice.edu/cnxml"><title>T</title></document>"#)?;
        let err = transform_document(&NativeTransformer, module, &Metadata::default(), Path::new("m1/index.cnxml"))
            .err()
            .context("expected failure")?;
        assert!(matches!(
            crate::error::find_assemble_error(&err),
            Some(AssembleError::Transform { stage: "cnxml-to-html5", .. })
        ));
        Ok(())
    }
}
