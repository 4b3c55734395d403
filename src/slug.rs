use crate::bookpart::BookPart;
use crate::dom::{Element, Node};

/// Slug of a title path: the titles joined by spaces, lowercased, transliterated
/// to ASCII, every run of other characters collapsed to one `-`.
pub fn generate_slug<'a>(titles: impl IntoIterator<Item = &'a str>) -> String {
    let joined = titles
        .into_iter()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    ::slug::slugify(joined)
}

/// Id of a nav node; the slug fallback.
pub fn node_id(part: &BookPart) -> String {
    part.metadata().uuid.clone().unwrap_or_default()
}

/// Writes `slug(ancestor titles…, own title)` into every node below `root`. The
/// root keeps a slug it already has (the book slug).
pub fn annotate_slugs(root: &mut BookPart) {
    let own = slug_or_id(&[root.title()], root);
    if root.metadata().slug.is_none() {
        root.metadata_mut().slug = Some(own);
    }
    let titles = vec![root.title().to_owned()];
    if let Some(children) = root.children_mut() {
        for child in children {
            annotate(child, &titles);
        }
    }
}

fn slug_or_id(titles: &[&str], part: &BookPart) -> String {
    let slug = generate_slug(titles.iter().copied());
    if slug.is_empty() { node_id(part) } else { slug }
}

fn annotate(part: &mut BookPart, ancestors: &[String]) {
    let mut titles: Vec<String> = ancestors.to_vec();
    titles.push(part.title().to_owned());
    let refs: Vec<&str> = titles.iter().map(String::as_str).collect();
    let slug = slug_or_id(&refs, part);
    part.metadata_mut().slug = Some(slug.clone());

    if let BookPart::Document(doc) = part
        && let Some(content) = doc.content.as_mut()
    {
        set_block_slug(content, &slug);
    }
    if let Some(children) = part.children_mut() {
        for child in children {
            annotate(child, &titles);
        }
    }
}

/// Copies each page's already assigned slug into its inline metadata block.
pub fn stamp_page_slugs(root: &mut BookPart) {
    for doc in root.documents_mut() {
        if let Some(slug) = doc.metadata.slug.clone()
            && let Some(content) = doc.content.as_mut()
        {
            set_block_slug(content, &slug);
        }
    }
}

/// Records `slug` in the page's inline metadata block.
fn set_block_slug(html: &mut Element, slug: &str) {
    let Some(body) = html.child_elements_mut().find(|el| el.is("body")) else {
        return;
    };
    let Some(block) = body
        .child_elements_mut()
        .find(|el| el.data_type() == Some("metadata"))
    else {
        return;
    };
    if let Some(span) = block
        .child_elements_mut()
        .find(|el| el.data_type() == Some("slug"))
    {
        span.set_attr("data-value", slug);
        return;
    }
    block.children.push(Node::Element(
        Element::new("span")
            .with_attr("data-type", "slug")
            .with_attr("data-value", slug),
    ));
}
