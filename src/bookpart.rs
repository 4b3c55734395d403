use std::path::PathBuf;

use crate::dom::Element;
use crate::metadata::Metadata;

/// A node of the book tree built from the collection manifest.
#[derive(Debug, Clone)]
pub enum BookPart {
    /// The root of a book, or a synthetic binder lifted from a super document.
    Collection(Binder),
    Subcollection(Binder),
    Document(Document),
}

#[derive(Debug, Clone, Default)]
pub struct Binder {
    pub metadata: Metadata,
    pub children: Vec<BookPart>,
    /// `data-type="composite-chapter"` in the manifest.
    pub composite: bool,
    pub uuid_key: Option<String>,
    pub class: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    pub metadata: Metadata,
    /// Transformed XHTML page (`<html>` root), filled in after the manifest parse.
    pub content: Option<Element>,
    /// `data-type="composite-page"` in the manifest.
    pub composite: bool,
    pub uuid_key: Option<String>,
    pub class: Option<String>,
    /// The manifest `document` attribute.
    pub document_ref: String,
    pub source: PathBuf,
    /// Title given by the manifest, which wins over the module's own.
    pub manifest_title: Option<String>,
}

impl Document {
    pub fn uuid(&self) -> &str {
        self.metadata.uuid.as_deref().unwrap_or_default()
    }

    /// Element id of the page wrapper in the assembled book.
    pub fn page_id(&self) -> String {
        format!("page_{}", self.uuid())
    }
}

impl BookPart {
    pub fn metadata(&self) -> &Metadata {
        match self {
            BookPart::Collection(binder) | BookPart::Subcollection(binder) => &binder.metadata,
            BookPart::Document(doc) => &doc.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            BookPart::Collection(binder) | BookPart::Subcollection(binder) => {
                &mut binder.metadata
            }
            BookPart::Document(doc) => &mut doc.metadata,
        }
    }

    pub fn title(&self) -> &str {
        self.metadata().title.as_deref().unwrap_or_default()
    }

    pub fn children(&self) -> &[BookPart] {
        match self {
            BookPart::Collection(binder) | BookPart::Subcollection(binder) => &binder.children,
            BookPart::Document(_) => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<BookPart>> {
        match self {
            BookPart::Collection(binder) | BookPart::Subcollection(binder) => {
                Some(&mut binder.children)
            }
            BookPart::Document(_) => None,
        }
    }

    pub fn is_binder(&self) -> bool {
        !matches!(self, BookPart::Document(_))
    }

    /// `book` for the root; binders holding binders are units; the rest chapters.
    pub fn toc_type(&self, is_root: bool) -> &'static str {
        match self {
            _ if is_root => "book",
            BookPart::Collection(binder) | BookPart::Subcollection(binder) => {
                if binder.composite {
                    "composite-chapter"
                } else if binder.children.iter().any(BookPart::is_binder) {
                    "unit"
                } else {
                    "chapter"
                }
            }
            BookPart::Document(doc) if doc.composite => "composite-page",
            BookPart::Document(_) => "page",
        }
    }

    fn uuid_seed(&self) -> String {
        let (uuid_key, class) = match self {
            BookPart::Collection(binder) | BookPart::Subcollection(binder) => {
                (&binder.uuid_key, &binder.class)
            }
            BookPart::Document(doc) => (&doc.uuid_key, &doc.class),
        };
        uuid_key
            .clone()
            .or_else(|| class.clone())
            .unwrap_or_else(|| self.title().to_owned())
    }

    /// Pages in book order.
    pub fn documents(&self) -> Vec<&Document> {
        let mut out = Vec::new();
        collect_documents(self, &mut out);
        out
    }

    pub fn documents_mut(&mut self) -> Vec<&mut Document> {
        let mut out = Vec::new();
        collect_documents_mut(self, &mut out);
        out
    }

    /// Fills in missing uuids below this node: `uuid5(parent, data-uuid-key |
    /// class | title)`.
    pub fn derive_uuids(&mut self) {
        let Some(parent_uuid) = self
            .metadata()
            .uuid
            .as_deref()
            .and_then(|uuid| uuid::Uuid::parse_str(uuid).ok())
        else {
            return;
        };
        let Some(children) = self.children_mut() else {
            return;
        };
        for child in children.iter_mut() {
            if child.metadata().uuid.is_none() {
                let seed = child.uuid_seed();
                let derived = uuid::Uuid::new_v5(&parent_uuid, seed.as_bytes()).to_string();
                tracing::debug!(title = %child.title(), uuid = %derived, "derived uuid");
                child.metadata_mut().uuid = Some(derived);
            }
            child.derive_uuids();
        }
    }
}

fn collect_documents<'a>(part: &'a BookPart, out: &mut Vec<&'a Document>) {
    match part {
        BookPart::Document(doc) => out.push(doc),
        BookPart::Collection(binder) | BookPart::Subcollection(binder) => {
            for child in &binder.children {
                collect_documents(child, out);
            }
        }
    }
}

fn collect_documents_mut<'a>(part: &'a mut BookPart, out: &mut Vec<&'a mut Document>) {
    match part {
        BookPart::Document(doc) => out.push(doc),
        BookPart::Collection(binder) | BookPart::Subcollection(binder) => {
            for child in binder.children.iter_mut() {
                collect_documents_mut(child, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, uuid: Option<&str>) -> BookPart {
        BookPart::Document(Document {
            metadata: Metadata {
                title: Some(title.to_owned()),
                uuid: uuid.map(str::to_owned),
                ..Metadata::default()
            },
            ..Document::default()
        })
    }

    #[test]
    fn derived_uuids_are_stable_and_keyed() {
        let root_uuid = "00000000-0000-0000-0000-000000000001";
        let build = || {
            BookPart::Collection(Binder {
                metadata: Metadata {
                    title: Some("Book".to_owned()),
                    uuid: Some(root_uuid.to_owned()),
                    ..Metadata::default()
                },
                children: vec![
                    BookPart::Subcollection(Binder {
                        metadata: Metadata {
                            title: Some("Unit".to_owned()),
                            ..Metadata::default()
                        },
                        children: vec![doc("Page", None)],
                        ..Binder::default()
                    }),
                    doc("Kept", Some("11111111-1111-1111-1111-111111111111")),
                ],
                ..Binder::default()
            })
        };

        let mut first = build();
        first.derive_uuids();
        let mut second = build();
        second.derive_uuids();

        let unit = &first.children()[0];
        let parent = uuid::Uuid::parse_str(root_uuid).unwrap_or_default();
        let expected = uuid::Uuid::new_v5(&parent, b"Unit").to_string();
        assert_eq!(unit.metadata().uuid.as_deref(), Some(expected.as_str()));

        let uuids = |part: &BookPart| -> Vec<String> {
            part.documents().iter().map(|d| d.uuid().to_owned()).collect()
        };
        assert_eq!(uuids(&first), uuids(&second));
        assert_eq!(uuids(&first)[1], "11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn binder_typing() {
        let chapter = BookPart::Subcollection(Binder {
            children: vec![doc("A", None)],
            ..Binder::default()
        });
        let unit = BookPart::Subcollection(Binder {
            children: vec![chapter.clone()],
            ..Binder::default()
        });
        assert_eq!(chapter.toc_type(false), "chapter");
        assert_eq!(unit.toc_type(false), "unit");
        assert_eq!(unit.toc_type(true), "book");
        let composite = BookPart::Document(Document {
            composite: true,
            ..Document::default()
        });
        assert_eq!(composite.toc_type(false), "composite-page");
    }

    #[test]
    fn documents_come_back_in_book_order() {
        let tree = BookPart::Collection(Binder {
            children: vec![
                doc("A", Some("a")),
                BookPart::Subcollection(Binder {
                    children: vec![doc("B", Some("b")), doc("C", Some("c"))],
                    ..Binder::default()
                }),
                doc("D", Some("d")),
            ],
            ..Binder::default()
        });
        let order: Vec<&str> = tree.documents().iter().map(|d| d.uuid()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }
}
