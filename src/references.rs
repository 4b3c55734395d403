//! Link and resource rewriting for transformed pages.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::LinkForm;
use crate::container::Container;
use crate::dom::{Element, Node};
use crate::error::AssembleError;
use crate::resources::{DOM_PREFIX, ResourceStore};

pub const MOCK_INTER_BOOK_HREF: &str = "mock-inter-book-link";
pub const MOCK_INTER_BOOK_UUID: &str = "mock-inter-book-uuid";
const REX_BASE: &str = "http://openstax.org/books";

static MODULE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(m\d+)(?:@([^#]*))?(?:#(.*))?$").expect("module link pattern")
});

static UUID_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^/(?:contents/)?([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})(?:@([^#:]*))?(?:#(.*))?$",
    )
    .expect("uuid link pattern")
});

/// `./<book-uuid>@<version>:<page-uuid>.xhtml[#frag]`, the on-disk output form.
static DISK_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\./[0-9a-fA-F-]{36}(?:@[^:]*)?:[0-9a-fA-F-]{36}\.xhtml(?:#.*)?$")
        .expect("disk link pattern")
});

static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*:").expect("uri scheme pattern"));

/// Resource-bearing attributes by element local name.
const RESOURCE_ATTRS: &[(&str, &str)] = &[
    ("img", "src"),
    ("image", "src"),
    ("iframe", "src"),
    ("audio", "src"),
    ("video", "src"),
    ("source", "src"),
    ("embed", "src"),
    ("object", "data"),
    ("object", "src"),
    ("flash", "src"),
    ("link", "resource"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceKind {
    External,
    IntraPage,
    /// `/m<digits>` legacy module id.
    ModuleId {
        legacy_id: String,
        fragment: Option<String>,
    },
    /// `/contents/<uuid>` or `/<uuid>`.
    Uuid {
        uuid: String,
        fragment: Option<String>,
    },
    Resource,
    /// Output of an earlier resolution; left alone.
    Resolved,
}

/// Classifies an `href`-like value.
pub fn classify(uri: &str) -> ReferenceKind {
    let uri = uri.trim();
    if uri.is_empty() {
        return ReferenceKind::External;
    }
    if uri.starts_with('#') {
        return ReferenceKind::IntraPage;
    }
    if uri.starts_with(DOM_PREFIX) || uri == MOCK_INTER_BOOK_HREF || DISK_LINK_RE.is_match(uri) {
        return ReferenceKind::Resolved;
    }
    if let Some(caps) = MODULE_LINK_RE.captures(uri) {
        return ReferenceKind::ModuleId {
            legacy_id: caps[1].to_owned(),
            fragment: non_empty_capture(caps.get(3)),
        };
    }
    if let Some(caps) = UUID_LINK_RE.captures(uri) {
        return ReferenceKind::Uuid {
            uuid: caps[1].to_ascii_lowercase(),
            fragment: non_empty_capture(caps.get(3)),
        };
    }
    if SCHEME_RE.is_match(uri) || uri.starts_with("//") || uri.starts_with('/') {
        return ReferenceKind::External;
    }
    ReferenceKind::Resource
}

fn non_empty_capture(m: Option<regex::Match<'_>>) -> Option<String> {
    m.map(|m| m.as_str()).filter(|s| !s.is_empty()).map(str::to_owned)
}

/// What the rest of the system knows about one book in the container.
#[derive(Debug, Clone, Default)]
pub struct BookSummary {
    pub uuid: String,
    pub version: Option<String>,
    pub slug: String,
    /// Page uuid to page slug, in book order.
    pub page_slugs: Vec<(String, String)>,
}

impl BookSummary {
    pub fn page_slug(&self, page_uuid: &str) -> Option<&str> {
        self.page_slugs
            .iter()
            .find(|(uuid, _)| uuid == page_uuid)
            .map(|(_, slug)| slug.as_str())
    }
}

/// Books of the container keyed by uuid, and the books each module appears in.
#[derive(Debug, Clone, Default)]
pub struct LinkIndex {
    books: HashMap<String, BookSummary>,
    containing: HashMap<String, Vec<String>>,
}

impl LinkIndex {
    pub fn add_book(&mut self, book: BookSummary) {
        for (page_uuid, _) in &book.page_slugs {
            let books = self.containing.entry(page_uuid.clone()).or_default();
            if !books.contains(&book.uuid) {
                books.push(book.uuid.clone());
            }
        }
        self.books.insert(book.uuid.clone(), book);
    }

    pub fn book(&self, uuid: &str) -> Option<&BookSummary> {
        self.books.get(uuid)
    }

    pub fn containing_books(&self, module_uuid: &str) -> &[String] {
        self.containing
            .get(module_uuid)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Rewrites the links and resources of one book's pages.
pub struct Resolver<'a> {
    pub container: &'a Container,
    pub store: &'a ResourceStore,
    pub index: &'a LinkIndex,
    /// Uuids of the pages in the book being assembled.
    pub book_pages: &'a HashSet<String>,
    pub canonical_books: &'a [String],
    pub link_form: LinkForm,
    pub mock_inter_book: bool,
    pub loose: bool,
}

enum Outcome {
    Done,
    Unresolved(String),
    MissingResource(String),
}

impl Resolver<'_> {
    /// Resolves every reference in `page`. `source` is the page's CNXML file;
    /// relative resource paths are taken from its directory.
    pub fn resolve_page(&self, page: &mut Element, source: &Path) -> anyhow::Result<()> {
        page.splice(&mut |el: &mut Element| -> anyhow::Result<Option<Vec<Node>>> {
            let outcome = self.resolve_element(el, source)?;
            self.settle(el, source, outcome)
        })
    }

    fn settle(
        &self,
        el: &Element,
        source: &Path,
        outcome: Outcome,
    ) -> anyhow::Result<Option<Vec<Node>>> {
        match outcome {
            Outcome::Done => Ok(None),
            Outcome::Unresolved(reference) if self.loose => {
                tracing::warn!(path = %source.display(), %reference, "unresolved reference replaced");
                Ok(Some(substitute(el, format!("[unresolved_reference: {reference}]"))))
            }
            Outcome::Unresolved(reference) => Err(AssembleError::UnresolvedReference {
                path: source.to_path_buf(),
                reference,
            }
            .into()),
            Outcome::MissingResource(uri) if self.loose => {
                tracing::warn!(path = %source.display(), %uri, "missing resource replaced");
                Ok(Some(substitute(el, format!("[missing_resource: {uri}]"))))
            }
            Outcome::MissingResource(uri) => Err(AssembleError::ResourceIo {
                path: resource_dir(source).join(uri),
            }
            .into()),
        }
    }

    fn resolve_element(&self, el: &mut Element, source: &Path) -> anyhow::Result<Outcome> {
        if el.is("a")
            && let Some(href) = el.attr("href").map(str::to_owned)
        {
            let outcome = match classify(&href) {
                ReferenceKind::ModuleId {
                    legacy_id,
                    fragment,
                } => match self.container.legacy_to_uuid(&legacy_id) {
                    Some(uuid) => {
                        let uuid = uuid.to_owned();
                        self.rewrite_page_link(el, &href, &uuid, fragment.as_deref())?
                    }
                    None => Outcome::Unresolved(href.clone()),
                },
                ReferenceKind::Uuid { uuid, fragment } => {
                    self.rewrite_page_link(el, &href, &uuid, fragment.as_deref())?
                }
                ReferenceKind::Resource => self.rewrite_resource(el, "href", &href, source)?,
                _ => Outcome::Done,
            };
            if !matches!(outcome, Outcome::Done) {
                return Ok(outcome);
            }
        }

        let local = el.local_name().to_owned();
        for (element, attr) in RESOURCE_ATTRS {
            if local != *element {
                continue;
            }
            let Some(value) = el.attr(attr).map(str::to_owned) else {
                continue;
            };
            if classify(&value) != ReferenceKind::Resource {
                continue;
            }
            let outcome = self.rewrite_resource(el, attr, &value, source)?;
            if !matches!(outcome, Outcome::Done) {
                return Ok(outcome);
            }
        }
        Ok(Outcome::Done)
    }

    fn rewrite_page_link(
        &self,
        el: &mut Element,
        href: &str,
        uuid: &str,
        fragment: Option<&str>,
    ) -> anyhow::Result<Outcome> {
        if self.book_pages.contains(uuid) {
            let target = match fragment {
                Some(frag) if frag.starts_with("auto_") => format!("#{frag}"),
                Some(frag) => format!("#auto_{uuid}_{frag}"),
                None => format!("#page_{uuid}"),
            };
            el.set_attr("href", target);
            return Ok(Outcome::Done);
        }

        if self.mock_inter_book {
            el.set_attr("href", MOCK_INTER_BOOK_HREF);
            el.set_attr("data-book-uuid", MOCK_INTER_BOOK_UUID);
            return Ok(Outcome::Done);
        }

        let Some(book) = self.canonical_book(el, uuid)? else {
            return Ok(Outcome::Unresolved(href.to_owned()));
        };
        let target = match self.link_form {
            LinkForm::Disk => {
                let mut target = match &book.version {
                    Some(version) => format!("./{}@{version}:{uuid}.xhtml", book.uuid),
                    None => format!("./{}:{uuid}.xhtml", book.uuid),
                };
                if let Some(frag) = fragment {
                    target.push('#');
                    target.push_str(frag);
                }
                target
            }
            LinkForm::Web => {
                let page_slug = book.page_slug(uuid).unwrap_or(uuid);
                let mut target = format!("{REX_BASE}/{}/pages/{page_slug}", book.slug);
                if let Some(frag) = fragment {
                    target.push('#');
                    target.push_str(frag);
                }
                target
            }
        };
        tracing::debug!(from = %href, to = %target, book = %book.uuid, "inter-book link");
        el.set_attr("href", target);
        el.set_attr("data-book-uuid", book.uuid.clone());
        Ok(Outcome::Done)
    }

    /// Picks the book a link to `module_uuid` points into. `None` when no book in
    /// the container holds the module.
    fn canonical_book(
        &self,
        el: &Element,
        module_uuid: &str,
    ) -> Result<Option<&BookSummary>, AssembleError> {
        if let Some(explicit) = el.attr("data-book-uuid").filter(|v| !v.is_empty()) {
            return Ok(self.index.book(explicit));
        }

        let containing = self.index.containing_books(module_uuid);
        let chosen = match containing {
            [] => return Ok(None),
            [only] => Some(only),
            _ => {
                let canonical: Vec<&String> = containing
                    .iter()
                    .filter(|book| self.canonical_books.contains(book))
                    .collect();
                match canonical.as_slice() {
                    [only] => Some(*only),
                    _ => self
                        .container
                        .module_by_uuid(module_uuid)
                        .and_then(|info| info.canonical_book_uuid.as_ref())
                        .filter(|declared| containing.contains(declared)),
                }
            }
        };
        match chosen {
            Some(uuid) => Ok(self.index.book(uuid)),
            None => Err(AssembleError::AmbiguousContainingBook {
                module_uuid: module_uuid.to_owned(),
                containing: containing.to_vec(),
                canonical: self.canonical_books.to_vec(),
            }),
        }
    }

    fn rewrite_resource(
        &self,
        el: &mut Element,
        attr: &str,
        value: &str,
        source: &Path,
    ) -> anyhow::Result<Outcome> {
        let Some(path) = self.locate(value, source) else {
            return Ok(Outcome::MissingResource(value.to_owned()));
        };
        let key = path.to_string_lossy().into_owned();
        let target = self.store.store(&key, &path, el.is("img"))?;
        el.set_attr(attr, target);
        Ok(Outcome::Done)
    }

    /// Next to the module first, then by file name under the media root.
    fn locate(&self, value: &str, source: &Path) -> Option<PathBuf> {
        let relative = value.split(['#', '?']).next().unwrap_or(value);
        let beside = resource_dir(source).join(relative);
        if beside.is_file() {
            return Some(beside);
        }
        let name = Path::new(relative).file_name()?;
        let shared = self.container.media_root.join(name);
        shared.is_file().then_some(shared)
    }
}

fn resource_dir(source: &Path) -> PathBuf {
    source.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Comment holding the original markup, followed by a visible marker.
fn substitute(el: &Element, marker: String) -> Vec<Node> {
    vec![Node::Comment(el.to_xml()), Node::Text(marker)]
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_A: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";
    const PAGE_B: &str = "bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb";
    const OTHER_PAGE: &str = "cccccccc-cccc-cccc-cccc-cccccccccccc";
    const BOOK_1: &str = "00000000-0000-0000-0000-000000000001";
    const BOOK_2: &str = "00000000-0000-0000-0000-000000000002";

    struct Fixture {
        _dir: tempfile::TempDir,
        container: Container,
        store: ResourceStore,
        index: LinkIndex,
        pages: HashSet<String>,
        source: PathBuf,
    }

    fn module(uuid: &str, canonical: Option<&str>) -> String {
        let canonical = canonical
            .map(|c| format!("<md:canonical-book-uuid>{c}</md:canonical-book-uuid>"))
            .unwrap_or_default();
        format!(
            r#"<document xmlns="http://cnx.rice.edu/cnxml" xmlns:md="http://cnx.rice.edu/mdml"><title>T</title><metadata><md:uuid>{uuid}</md:uuid>{canonical}</metadata><content/></document>"#
        )
    }

    fn fixture(books_for_other: &[&str], canonical: Option<&str>) -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("META-INF"))?;
        std::fs::write(root.join("META-INF/books.xml"), "<container/>")?;
        for (legacy, uuid, canonical) in [
            ("m00001", PAGE_A, None),
            ("m00002", PAGE_B, None),
            ("m00003", OTHER_PAGE, canonical),
        ] {
            let module_dir = root.join("modules").join(legacy);
            std::fs::create_dir_all(&module_dir)?;
            std::fs::write(module_dir.join("index.cnxml"), module(uuid, canonical))?;
        }
        std::fs::write(root.join("modules/m00001/a.png"), b"same bytes")?;
        std::fs::create_dir_all(root.join("media"))?;
        std::fs::write(root.join("media/shared.pdf"), b"%PDF-1.4 shared")?;

        let container = Container::load(root)?;
        let store = ResourceStore::new(root.join("out/resources"))?;
        let mut index = LinkIndex::default();
        for (uuid, slug) in [(BOOK_1, "book1"), (BOOK_2, "book2")] {
            let page_slugs = if books_for_other.contains(&uuid) {
                vec![(OTHER_PAGE.to_owned(), "1-1-other-page".to_owned())]
            } else {
                Vec::new()
            };
            index.add_book(BookSummary {
                uuid: uuid.to_owned(),
                version: Some("7.1".to_owned()),
                slug: slug.to_owned(),
                page_slugs,
            });
        }
        let pages = [PAGE_A, PAGE_B].into_iter().map(str::to_owned).collect();
        let source = root.join("modules/m00001/index.cnxml");
        Ok(Fixture {
            _dir: dir,
            container,
            store,
            index,
            pages,
            source,
        })
    }

    impl Fixture {
        fn resolver<'a>(&'a self, canonical: &'a [String]) -> Resolver<'a> {
            Resolver {
                container: &self.container,
                store: &self.store,
                index: &self.index,
                book_pages: &self.pages,
                canonical_books: canonical,
                link_form: LinkForm::Disk,
                mock_inter_book: false,
                loose: false,
            }
        }
    }

    fn page(body: &str) -> anyhow::Result<Element> {
        Ok(crate::dom::parse(&format!("<body>{body}</body>"))?)
    }

    fn hrefs(page: &Element) -> Vec<String> {
        page.find_all(|el| el.is("a"))
            .into_iter()
            .filter_map(|a| a.attr("href").map(str::to_owned))
            .collect()
    }

    #[test]
    fn classifies_link_forms() {
        assert_eq!(classify("https://openstax.org"), ReferenceKind::External);
        assert_eq!(classify("mailto:x@example.org"), ReferenceKind::External);
        assert_eq!(classify("#fig-1"), ReferenceKind::IntraPage);
        assert_eq!(
            classify("/m42092@1.5#eq-1"),
            ReferenceKind::ModuleId {
                legacy_id: "m42092".to_owned(),
                fragment: Some("eq-1".to_owned()),
            }
        );
        assert_eq!(
            classify(&format!("/contents/{PAGE_B}")),
            ReferenceKind::Uuid {
                uuid: PAGE_B.to_owned(),
                fragment: None,
            }
        );
        assert_eq!(classify("figures/a.png"), ReferenceKind::Resource);
        assert_eq!(classify("../resources/abc"), ReferenceKind::Resolved);
        assert_eq!(
            classify(&format!("./{BOOK_1}@7.1:{OTHER_PAGE}.xhtml#x")),
            ReferenceKind::Resolved
        );
    }

    #[test]
    fn intra_book_links_point_at_page_wrappers_and_prefixed_ids() -> anyhow::Result<()> {
        let fx = fixture(&[BOOK_1], None)?;
        let mut body = page(&format!(
            r#"<a href="/m00002#eq-1">eq</a><a href="/m00002">page</a><a href="/contents/{PAGE_B}#auto_{PAGE_B}_eq-1">done</a><a href="https://example.org">web</a>"#
        ))?;
        fx.resolver(&[]).resolve_page(&mut body, &fx.source)?;
        assert_eq!(
            hrefs(&body),
            vec![
                format!("#auto_{PAGE_B}_eq-1"),
                format!("#page_{PAGE_B}"),
                format!("#auto_{PAGE_B}_eq-1"),
                "https://example.org".to_owned(),
            ]
        );
        Ok(())
    }

    #[test]
    fn inter_book_links_use_the_single_containing_book() -> anyhow::Result<()> {
        let fx = fixture(&[BOOK_1], None)?;
        let mut body = page(r#"<a href="/m00003#sec">x</a>"#)?;
        fx.resolver(&[]).resolve_page(&mut body, &fx.source)?;
        assert_eq!(hrefs(&body), vec![format!("./{BOOK_1}@7.1:{OTHER_PAGE}.xhtml#sec")]);

        let mut web = page(r#"<a href="/m00003">x</a>"#)?;
        let mut resolver = fx.resolver(&[]);
        resolver.link_form = LinkForm::Web;
        resolver.resolve_page(&mut web, &fx.source)?;
        assert_eq!(
            hrefs(&web),
            vec!["http://openstax.org/books/book1/pages/1-1-other-page".to_owned()]
        );
        Ok(())
    }

    #[test]
    fn canonical_list_and_declared_book_break_ties() -> anyhow::Result<()> {
        let fx = fixture(&[BOOK_1, BOOK_2], None)?;
        let canonical = vec![BOOK_2.to_owned()];
        let mut body = page(r#"<a href="/m00003">x</a>"#)?;
        fx.resolver(&canonical).resolve_page(&mut body, &fx.source)?;
        assert_eq!(hrefs(&body), vec![format!("./{BOOK_2}@7.1:{OTHER_PAGE}.xhtml")]);

        let declared = fixture(&[BOOK_1, BOOK_2], Some(BOOK_1))?;
        let mut body = page(r#"<a href="/m00003">x</a>"#)?;
        declared.resolver(&[]).resolve_page(&mut body, &declared.source)?;
        assert_eq!(hrefs(&body), vec![format!("./{BOOK_1}@7.1:{OTHER_PAGE}.xhtml")]);
        Ok(())
    }

    #[test]
    fn ambiguous_book_names_both_candidates() -> anyhow::Result<()> {
        let fx = fixture(&[BOOK_1, BOOK_2], None)?;
        let mut body = page(r#"<a href="/m00003">x</a>"#)?;
        let err = fx
            .resolver(&[])
            .resolve_page(&mut body, &fx.source)
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected ambiguity"))?;
        let message = err.to_string();
        assert!(message.contains(BOOK_1) && message.contains(BOOK_2), "{message}");
        Ok(())
    }

    #[test]
    fn mock_mode_skips_lookup() -> anyhow::Result<()> {
        let fx = fixture(&[], None)?;
        let mut body = page(r#"<a href="/m00003">x</a>"#)?;
        let mut resolver = fx.resolver(&[]);
        resolver.mock_inter_book = true;
        resolver.resolve_page(&mut body, &fx.source)?;
        let a = body
            .find(|el| el.is("a"))
            .ok_or_else(|| anyhow::anyhow!("anchor missing"))?;
        assert_eq!(a.attr("href"), Some(MOCK_INTER_BOOK_HREF));
        assert_eq!(a.attr("data-book-uuid"), Some(MOCK_INTER_BOOK_UUID));
        Ok(())
    }

    #[test]
    fn resources_are_stored_and_resolution_is_idempotent() -> anyhow::Result<()> {
        let fx = fixture(&[BOOK_1], None)?;
        let mut body = page(r#"<img src="a.png"/><a href="shared.pdf">pdf</a>"#)?;
        let resolver = fx.resolver(&[]);
        resolver.resolve_page(&mut body, &fx.source)?;
        let once = body.to_xml();
        resolver.resolve_page(&mut body, &fx.source)?;
        assert_eq!(body.to_xml(), once);

        let img = body
            .find(|el| el.is("img"))
            .ok_or_else(|| anyhow::anyhow!("img missing"))?;
        assert!(img.attr("src").is_some_and(|src| src.starts_with("../resources/")));
        assert!(hrefs(&body)[0].starts_with("../resources/"));
        Ok(())
    }

    #[test]
    fn loose_mode_comments_out_missing_targets() -> anyhow::Result<()> {
        let fx = fixture(&[BOOK_1], None)?;
        let mut body = page(r#"<img src="gone.png"/><a href="/m99999">x</a>"#)?;
        let mut resolver = fx.resolver(&[]);
        assert!(resolver.resolve_page(&mut body.clone(), &fx.source).is_err());

        resolver.loose = true;
        resolver.resolve_page(&mut body, &fx.source)?;
        let xml = body.to_xml();
        assert!(xml.contains("<!--<img src=\"gone.png\"/>-->[missing_resource: gone.png]"), "{xml}");
        assert!(xml.contains("[unresolved_reference: /m99999]"), "{xml}");
        Ok(())
    }
}
