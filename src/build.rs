//! One `assemble` run: load the container, index every book, then assemble the
//! selected books one at a time.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;

use crate::bookpart::{Binder, BookPart, Document};
use crate::config::{AssembleConfig, TransformerKind};
use crate::container::{BookEntry, Container, ModuleInfo};
use crate::embed::Injector;
use crate::error::AssembleError;
use crate::exercises::{ExerciseSource, HttpExerciseSource};
use crate::metadata::{self, Metadata, MetadataKind};
use crate::references::{BookSummary, LinkIndex, Resolver};
use crate::resources::ResourceStore;
use crate::transform::{self, NativeTransformer, Transformer, XsltprocTransformer};

/// Paths written for one assembled book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookOutput {
    pub slug: String,
    pub assembled: PathBuf,
    pub toc_metadata: PathBuf,
}

pub async fn run(config: AssembleConfig) -> anyhow::Result<Vec<BookOutput>> {
    let source = HttpExerciseSource::new(config.exercises.clone())?;
    run_with_source(config, Arc::new(source)).await
}

/// Same as [`run`] with the exercise lookups answered by `source`.
pub async fn run_with_source(
    config: AssembleConfig,
    source: Arc<dyn ExerciseSource>,
) -> anyhow::Result<Vec<BookOutput>> {
    if config.out.exists() {
        return Err(AssembleError::OutputExists {
            path: config.out.clone(),
        }
        .into());
    }
    std::fs::create_dir_all(&config.out)
        .with_context(|| format!("create output dir: {}", config.out.display()))?;

    let container = Container::load(&config.container).context("load container")?;
    let selected = select_books(&container, &config.books)?;

    let mut trees: HashMap<String, BookPart> = HashMap::new();
    let mut index = LinkIndex::default();
    for entry in &container.books {
        let tree = read_tree(&container, entry)?;
        index.add_book(summarize(&tree, &entry.slug));
        trees.insert(entry.slug.clone(), tree);
    }

    let transformer: Box<dyn Transformer> = match config.transformer {
        TransformerKind::Native => Box::new(NativeTransformer),
        TransformerKind::Xsltproc => Box::new(XsltprocTransformer::from_config(&config.xslt)?),
    };
    let store = ResourceStore::new(config.out.join("resources"))?;

    let mut outputs = Vec::with_capacity(selected.len());
    for entry in selected {
        let tree = trees
            .remove(&entry.slug)
            .with_context(|| format!("book `{}` was not indexed", entry.slug))?;
        tracing::info!(book = %entry.slug, "assembling");
        let book = BookRun {
            config: &config,
            container: &container,
            index: &index,
            store: &store,
            transformer: transformer.as_ref(),
            source: Arc::clone(&source),
        };
        let output = book
            .assemble(entry, tree)
            .await
            .with_context(|| format!("assemble book `{}`", entry.slug))?;
        tracing::info!(book = %entry.slug, path = %output.assembled.display(), "wrote assembled book");
        outputs.push(output);
    }
    Ok(outputs)
}

fn select_books<'a>(container: &'a Container, wanted: &[String]) -> anyhow::Result<Vec<&'a BookEntry>> {
    if wanted.is_empty() {
        if container.books.is_empty() {
            return Err(AssembleError::MissingContent {
                what: format!("books in {}", container.root.display()),
            }
            .into());
        }
        return Ok(container.books.iter().collect());
    }
    wanted
        .iter()
        .map(|slug| {
            container.book(slug).ok_or_else(|| {
                anyhow::Error::from(AssembleError::MissingContent {
                    what: format!("book `{slug}`"),
                })
            })
        })
        .collect()
}

/// Manifest tree of one book with uuids and slugs filled in. Pages without a
/// manifest title take the title found by the module scan.
fn read_tree(container: &Container, entry: &BookEntry) -> anyhow::Result<BookPart> {
    let path = container
        .collection_path_for(&entry.slug)
        .filter(|path| path.is_file())
        .ok_or_else(|| AssembleError::MissingContent {
            what: format!("collection for book `{}`", entry.slug),
        })?;
    let xml = std::fs::read_to_string(&path)
        .with_context(|| format!("read collection: {}", path.display()))?;
    let mut tree = crate::collection::parse_collection(&xml, &path, container)?;

    for doc in tree.documents_mut() {
        if doc.metadata.title.is_none() {
            doc.metadata.title = container
                .resolve_document(&doc.document_ref)
                .and_then(|info| info.title.clone());
        }
    }
    if tree.metadata().slug.is_none() {
        tree.metadata_mut().slug = Some(entry.slug.clone());
    }
    tree.derive_uuids();
    lift_super_documents(&mut tree, container);
    tree.derive_uuids();
    crate::slug::annotate_slugs(&mut tree);
    Ok(tree)
}

fn summarize(tree: &BookPart, slug: &str) -> BookSummary {
    let md = tree.metadata();
    BookSummary {
        uuid: md.uuid.clone().unwrap_or_default(),
        version: md.version.clone(),
        slug: slug.to_owned(),
        page_slugs: tree
            .documents()
            .into_iter()
            .map(|doc| {
                (
                    doc.uuid().to_owned(),
                    doc.metadata.slug.clone().unwrap_or_default(),
                )
            })
            .collect(),
    }
}

struct BookRun<'a> {
    config: &'a AssembleConfig,
    container: &'a Container,
    index: &'a LinkIndex,
    store: &'a ResourceStore,
    transformer: &'a dyn Transformer,
    source: Arc<dyn ExerciseSource>,
}

impl BookRun<'_> {
    async fn assemble(&self, entry: &BookEntry, mut tree: BookPart) -> anyhow::Result<BookOutput> {
        for doc in tree.documents_mut() {
            self.transform(doc)?;
        }
        fill_super_binders(&mut tree)?;

        let book_pages: HashSet<String> = tree
            .documents()
            .into_iter()
            .map(|doc| doc.uuid().to_owned())
            .collect();
        let resolver = Resolver {
            container: self.container,
            store: self.store,
            index: self.index,
            book_pages: &book_pages,
            canonical_books: &self.config.canonical_books,
            link_form: self.config.link_form,
            mock_inter_book: self.config.mock_inter_book,
            loose: self.config.loose,
        };
        for doc in tree.documents_mut() {
            if let Some(content) = doc.content.as_mut() {
                resolver
                    .resolve_page(content, &doc.source)
                    .with_context(|| format!("resolve references: {}", doc.source.display()))?;
            }
        }

        let injector = Injector {
            container: self.container,
            store: self.store,
            source: Arc::clone(&self.source),
            h5p_prefix: &self.config.h5p_prefix,
            concurrency: self.config.concurrency,
        };
        {
            let mut pages = tree.documents_mut();
            injector.inject(&mut pages).await?;
            let ids = crate::ids::uniquify_ids(&mut pages);
            crate::ids::rewrite_fragment_links(&mut pages, &ids);
        }

        crate::slug::stamp_page_slugs(&mut tree);
        let html = crate::assemble::assemble(&tree);

        let assembled = self.config.out.join(format!("{}.assembled.xhtml", entry.slug));
        write_new(&assembled, &crate::dom::to_document(&html))?;
        let toc_metadata = self.config.out.join(format!("{}.toc-metadata.json", entry.slug));
        crate::toc::write_toc_metadata(&toc_metadata, &crate::toc::toc_metadata(&tree))?;

        Ok(BookOutput {
            slug: entry.slug.clone(),
            assembled,
            toc_metadata,
        })
    }

    /// Parses the module behind `doc`, reads its metadata and stores the XHTML page.
    fn transform(&self, doc: &mut Document) -> anyhow::Result<()> {
        let path = doc.source.clone();
        let xml = std::fs::read_to_string(&path)
            .with_context(|| format!("read module: {}", path.display()))?;
        let module = crate::dom::parse(&xml).map_err(|source| AssembleError::Xml {
            path: path.clone(),
            source,
        })?;

        let mut md = metadata::parse_cnxml_metadata(&module, &path, MetadataKind::Document)?;
        if let Some(title) = &doc.manifest_title {
            md.title = Some(title.clone());
        }
        if md.uuid.is_none() {
            md.uuid = doc.metadata.uuid.clone();
        }
        if md.legacy_id.is_none() {
            md.legacy_id = doc.metadata.legacy_id.clone();
        }
        md.slug = doc.metadata.slug.clone().or(md.slug);

        let html = transform::transform_document(self.transformer, module, &md, &path)?;
        tracing::debug!(path = %path.display(), page = %md.uuid.as_deref().unwrap_or_default(), "transformed module");
        doc.metadata = md;
        doc.content = Some(html);
        Ok(())
    }
}

/// Wraps every super document in a binder of its own, titled like the page.
fn lift_super_documents(part: &mut BookPart, container: &Container) {
    let Some(children) = part.children_mut() else {
        return;
    };
    for child in children.iter_mut() {
        if let BookPart::Document(doc) = child
            && container
                .resolve_document(&doc.document_ref)
                .is_some_and(ModuleInfo::is_super)
        {
            tracing::debug!(page = %doc.uuid(), "lifting super document into a binder");
            let doc = std::mem::take(doc);
            *child = BookPart::Collection(Binder {
                metadata: Metadata {
                    title: doc.metadata.title.clone(),
                    ..Metadata::default()
                },
                uuid_key: Some(doc.uuid().to_owned()),
                class: Some("super".to_owned()),
                children: vec![BookPart::Document(doc)],
                ..Binder::default()
            });
        } else {
            lift_super_documents(child, container);
        }
    }
}

/// Gives each lifted binder the metadata its transformed page declares. The
/// binder keeps the uuid, slug and title it was indexed under.
fn fill_super_binders(part: &mut BookPart) -> anyhow::Result<()> {
    let Some(children) = part.children_mut() else {
        return Ok(());
    };
    for child in children.iter_mut() {
        if let BookPart::Collection(binder) = child
            && binder.class.as_deref() == Some("super")
            && let [BookPart::Document(doc)] = binder.children.as_slice()
        {
            let content = doc.content.as_ref().context("super document without content")?;
            let mut md = metadata::parse_xhtml_metadata(content, &doc.source, MetadataKind::Document)?;
            md.uuid = binder.metadata.uuid.take();
            md.slug = binder.metadata.slug.take();
            md.title = binder.metadata.title.take().or(md.title);
            binder.metadata = md;
        } else {
            fill_super_binders(child)?;
        }
    }
    Ok(())
}

fn write_new(path: &Path, contents: &str) -> anyhow::Result<()> {
    let mut out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("open output: {}", path.display()))?;
    out.write_all(contents.as_bytes())
        .with_context(|| format!("write output: {}", path.display()))?;
    out.flush().with_context(|| format!("flush output: {}", path.display()))?;
    Ok(())
}
