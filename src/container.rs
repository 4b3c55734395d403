//! Book container layout: `META-INF/books.xml`, the configured roots, and an index
//! of every CNXML module under the pages root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;

use crate::dom;
use crate::error::AssembleError;
use crate::metadata::{self, MetadataKind};

pub const BOOKS_XML: &str = "META-INF/books.xml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEntry {
    pub slug: String,
    pub style: String,
    pub href: Option<String>,
    pub collection_id: Option<String>,
}

/// What the module scan learned about one CNXML file.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub path: PathBuf,
    pub legacy_id: Option<String>,
    pub uuid: Option<String>,
    pub title: Option<String>,
    pub version: Option<String>,
    pub canonical_book_uuid: Option<String>,
    /// `class` of the module's `<document>` element.
    pub class: Option<String>,
}

impl ModuleInfo {
    /// Modules whose `<document>` carries class `super` become super documents.
    pub fn is_super(&self) -> bool {
        self.class
            .as_deref()
            .is_some_and(|class| class.split_whitespace().any(|c| c == "super"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InteractivePaths {
    pub public: Option<PathBuf>,
    pub private: Option<PathBuf>,
}

impl InteractivePaths {
    pub fn is_empty(&self) -> bool {
        self.public.is_none() && self.private.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Container {
    pub root: PathBuf,
    pub books_root: PathBuf,
    pub pages_root: PathBuf,
    pub media_root: PathBuf,
    pub private_root: PathBuf,
    pub public_root: PathBuf,
    pub books: Vec<BookEntry>,
    modules: Vec<ModuleInfo>,
    by_legacy: HashMap<String, usize>,
    by_uuid: HashMap<String, usize>,
}

static LEGACY_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^m\d+$").expect("legacy module id pattern"));

impl Container {
    /// Reads `META-INF/books.xml` under `root` and indexes the pages root.
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let descriptor = root.join(BOOKS_XML);
        if !descriptor.is_file() {
            return Err(AssembleError::MissingContent {
                what: format!("container descriptor {}", descriptor.display()),
            }
            .into());
        }
        let xml = std::fs::read_to_string(&descriptor)
            .with_context(|| format!("read {}", descriptor.display()))?;
        let doc = dom::parse(&xml).with_context(|| format!("parse {}", descriptor.display()))?;

        let mut vars: HashMap<String, String> = HashMap::new();
        for var in doc.find_all(|el| el.is("var")) {
            if let (Some(name), Some(value)) = (var.attr("name"), var.attr("value")) {
                vars.insert(name.to_owned(), value.to_owned());
            }
        }
        let root_for = |name: &str, default: &str| {
            let value = vars.get(name).map(String::as_str).unwrap_or(default);
            resolve_in(root, root, value)
        };

        let books = doc
            .find_all(|el| el.is("book"))
            .into_iter()
            .filter_map(|el| {
                Some(BookEntry {
                    slug: el.attr("slug")?.to_owned(),
                    style: el.attr("style").unwrap_or("default").to_owned(),
                    href: el.attr("href").map(str::to_owned),
                    collection_id: el.attr("collection-id").map(str::to_owned),
                })
            })
            .collect();

        let mut container = Self {
            root: root.to_path_buf(),
            books_root: root_for("BOOKS_ROOT", "collections"),
            pages_root: root_for("PAGES_ROOT", "modules"),
            media_root: root_for("MEDIA_ROOT", "media"),
            private_root: root_for("PRIVATE_ROOT", "private"),
            public_root: root_for("PUBLIC_ROOT", "interactives"),
            books,
            modules: Vec::new(),
            by_legacy: HashMap::new(),
            by_uuid: HashMap::new(),
        };
        container.scan_modules()?;
        tracing::info!(
            root = %root.display(),
            books = container.books.len(),
            modules = container.modules.len(),
            "loaded book container"
        );
        Ok(container)
    }

    fn scan_modules(&mut self) -> anyhow::Result<()> {
        let mut files = Vec::new();
        if self.pages_root.is_dir() {
            collect_cnxml(&self.pages_root, &mut files)?;
        }
        files.sort();

        for path in files {
            let info = read_module_info(&path)?;
            let idx = self.modules.len();
            if let Some(legacy) = &info.legacy_id
                && let Some(previous) = self.by_legacy.insert(legacy.clone(), idx)
            {
                tracing::warn!(
                    legacy_id = %legacy,
                    first = %self.modules[previous].path.display(),
                    second = %info.path.display(),
                    "legacy id declared twice; keeping the later file"
                );
            }
            if let Some(uuid) = &info.uuid {
                self.by_uuid.insert(uuid.clone(), idx);
            }
            self.modules.push(info);
        }
        Ok(())
    }

    pub fn book(&self, slug: &str) -> Option<&BookEntry> {
        self.books.iter().find(|book| book.slug == slug)
    }

    /// The manifest for `slug`: the book's `href` if given, else
    /// `BOOKS_ROOT/<slug>.collection.xml`.
    pub fn collection_path_for(&self, slug: &str) -> Option<PathBuf> {
        let from_href = self
            .book(slug)
            .and_then(|book| book.href.as_deref())
            .map(|href| resolve_in(&self.root, &self.root.join("META-INF"), href));
        let candidates = from_href
            .into_iter()
            .chain(std::iter::once(self.books_root.join(format!("{slug}.collection.xml"))));
        candidates.into_iter().find(|path| path.is_file())
    }

    pub fn module_path_for(&self, legacy_id: &str) -> Option<&Path> {
        self.by_legacy
            .get(legacy_id)
            .map(|idx| self.modules[*idx].path.as_path())
    }

    pub fn module_path_for_uuid(&self, uuid: &str) -> Option<&Path> {
        self.by_uuid
            .get(uuid)
            .map(|idx| self.modules[*idx].path.as_path())
    }

    pub fn legacy_to_uuid(&self, legacy_id: &str) -> Option<&str> {
        self.module_by_legacy(legacy_id)?.uuid.as_deref()
    }

    pub fn module_by_legacy(&self, legacy_id: &str) -> Option<&ModuleInfo> {
        self.by_legacy.get(legacy_id).map(|idx| &self.modules[*idx])
    }

    pub fn module_by_uuid(&self, uuid: &str) -> Option<&ModuleInfo> {
        self.by_uuid.get(uuid).map(|idx| &self.modules[*idx])
    }

    /// Resolves a manifest `document` reference: a legacy id, a uuid, or a
    /// directory name under the pages root.
    pub fn resolve_document(&self, document: &str) -> Option<&ModuleInfo> {
        if let Some(info) = self.module_by_legacy(document) {
            return Some(info);
        }
        if let Some(info) = self.module_by_uuid(document) {
            return Some(info);
        }
        let by_dir = self.pages_root.join(document).join("index.cnxml");
        self.modules.iter().find(|info| info.path == by_dir)
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    pub fn interactive_paths_for(&self, nickname: &str) -> InteractivePaths {
        let existing = |root: &Path| {
            let dir = root.join(nickname);
            dir.is_dir().then_some(dir)
        };
        InteractivePaths {
            public: existing(&self.public_root),
            private: existing(&self.private_root),
        }
    }
}

/// `/x` is relative to the container root, anything else to `base`.
fn resolve_in(container_root: &Path, base: &Path, value: &str) -> PathBuf {
    match value.strip_prefix('/') {
        Some(rooted) => container_root.join(rooted),
        None => base.join(value),
    }
}

fn collect_cnxml(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("read dir: {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read dir entry: {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat: {}", path.display()))?;
        if file_type.is_dir() {
            collect_cnxml(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "cnxml") {
            out.push(path);
        }
    }
    Ok(())
}

fn read_module_info(path: &Path) -> anyhow::Result<ModuleInfo> {
    let xml =
        std::fs::read_to_string(path).with_context(|| format!("read module: {}", path.display()))?;
    let root = dom::parse(&xml).map_err(|source| AssembleError::Xml {
        path: path.to_path_buf(),
        source,
    })?;

    let md = match metadata::parse_cnxml_metadata(&root, path, MetadataKind::Document) {
        Ok(md) => md,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "module metadata incomplete during scan");
            metadata::Metadata::default()
        }
    };

    let dir_legacy = path
        .parent()
        .and_then(|dir| dir.file_name())
        .and_then(|name| name.to_str())
        .filter(|name| LEGACY_DIR_RE.is_match(name))
        .map(str::to_owned);

    Ok(ModuleInfo {
        path: path.to_path_buf(),
        legacy_id: root
            .attr("module-id")
            .map(str::to_owned)
            .or(md.legacy_id)
            .or(dir_legacy),
        uuid: md.uuid,
        title: md.title,
        version: md.version,
        canonical_book_uuid: md.canonical_book_uuid,
        class: root.attr("class").map(str::to_owned),
    })
}
