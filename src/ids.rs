//! Book-wide element id uniquification.
//!
//! Pass A prefixes every id on a page with `auto_<page-uuid>_` and records where
//! each original id went. Pass B then rewrites `#fragment` links through that map.
//! Pass B needs the map of every page, so it only runs once Pass A has seen the
//! whole book.

use std::collections::{HashMap, HashSet};

use crate::bookpart::Document;
use crate::dom::Element;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdTarget {
    /// Index of the owning page in book order.
    pub page: usize,
    pub page_uuid: String,
    /// Rewritten id, empty for links to the page itself.
    pub id: String,
}

#[derive(Debug, Default)]
pub struct IdMap {
    entries: HashMap<String, Vec<IdTarget>>,
    final_ids: HashSet<String>,
}

impl IdMap {
    fn record(&mut self, key: String, target: IdTarget) {
        let targets = self.entries.entry(key).or_default();
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    /// Target of `#fragment` as seen from `page`; entries on the same page win.
    pub fn lookup(&self, fragment: &str, page: usize) -> Option<&IdTarget> {
        let targets = self.entries.get(&format!("#{fragment}"))?;
        targets
            .iter()
            .find(|target| target.page == page)
            .or_else(|| targets.first())
    }

    pub fn is_final(&self, id: &str) -> bool {
        self.final_ids.contains(id)
    }
}

fn looks_like_uuid(segment: &str) -> bool {
    uuid::Uuid::parse_str(segment).is_ok()
}

/// Undoes earlier prefixing: `auto_`, then up to two of `page` or a page uuid.
pub fn bare_id(id: &str) -> &str {
    let Some(mut rest) = id.strip_prefix("auto_") else {
        return id;
    };
    for _ in 0..2 {
        match rest.split_once('_') {
            Some((segment, tail))
                if !tail.is_empty() && (segment == "page" || looks_like_uuid(segment)) =>
            {
                rest = tail;
            }
            _ => break,
        }
    }
    rest
}

/// Pass A over `pages` in book order.
pub fn uniquify_ids(pages: &mut [&mut Document]) -> IdMap {
    let mut map = IdMap::default();
    for (idx, doc) in pages.iter_mut().enumerate() {
        let page_uuid = doc.uuid().to_owned();
        map.final_ids.insert(doc.page_id());

        for key in page_keys(doc) {
            map.record(
                key,
                IdTarget {
                    page: idx,
                    page_uuid: page_uuid.clone(),
                    id: String::new(),
                },
            );
        }

        let Some(content) = doc.content.as_mut() else {
            continue;
        };
        let mut taken: HashSet<String> = HashSet::new();
        let mut renamed = 0usize;
        content.walk_mut(&mut |el: &mut Element| {
            let Some(old) = el.id().map(str::to_owned) else {
                return;
            };
            let bare = bare_id(&old).to_owned();
            let mut unique = bare.clone();
            let mut suffix = 1;
            while taken.contains(&unique) {
                unique = format!("{bare}_{suffix}");
                suffix += 1;
            }
            taken.insert(unique.clone());
            let new_id = format!("auto_{page_uuid}_{unique}");
            el.set_attr("id", new_id.clone());
            map.final_ids.insert(new_id.clone());
            map.record(
                format!("#{old}"),
                IdTarget {
                    page: idx,
                    page_uuid: page_uuid.clone(),
                    id: new_id,
                },
            );
            renamed += 1;
        });
        tracing::debug!(page = %page_uuid, ids = renamed, "uniquified ids");
    }
    map
}

/// `#<legacy-id>`, `#<uuid>@<version>` and `#<uuid>` all name the page itself.
fn page_keys(doc: &Document) -> Vec<String> {
    let md = &doc.metadata;
    let mut keys = Vec::new();
    if let Some(legacy) = &md.legacy_id {
        keys.push(format!("#{legacy}"));
    }
    if let Some(uuid) = &md.uuid {
        if let Some(version) = &md.version {
            keys.push(format!("#{uuid}@{version}"));
        }
        keys.push(format!("#{uuid}"));
    }
    keys
}

/// Pass B: rewrites `<a href="#x">` on every page through `map`.
pub fn rewrite_fragment_links(pages: &mut [&mut Document], map: &IdMap) {
    for (idx, doc) in pages.iter_mut().enumerate() {
        let page_uuid = doc.uuid().to_owned();
        let Some(content) = doc.content.as_mut() else {
            continue;
        };
        content.walk_mut(&mut |el: &mut Element| {
            if !el.is("a") {
                return;
            }
            let Some(fragment) = el
                .attr("href")
                .and_then(|href| href.strip_prefix('#'))
                .filter(|fragment| !fragment.is_empty())
                .map(str::to_owned)
            else {
                return;
            };
            if map.is_final(&fragment) {
                return;
            }
            let Some(target) = map.lookup(&fragment, idx) else {
                tracing::error!(page = %page_uuid, fragment = %fragment, "link target not found in book");
                return;
            };
            let href = match (target.page == idx, target.id.is_empty()) {
                (true, false) => format!("#{}", target.id),
                (true, true) => format!("#page_{}", target.page_uuid),
                (false, false) => format!("/contents/{}#{}", target.page_uuid, target.id),
                (false, true) => format!("/contents/{}", target.page_uuid),
            };
            el.set_attr("href", href);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    const A: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";
    const B: &str = "bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb";

    fn doc(uuid: &str, legacy: &str, body: &str) -> anyhow::Result<Document> {
        Ok(Document {
            metadata: Metadata {
                uuid: Some(uuid.to_owned()),
                version: Some("3".to_owned()),
                legacy_id: Some(legacy.to_owned()),
                ..Metadata::default()
            },
            content: Some(crate::dom::parse(&format!("<html><body>{body}</body></html>"))?),
            ..Document::default()
        })
    }

    fn ids(doc: &Document) -> Vec<String> {
        doc.content
            .iter()
            .flat_map(|html| html.descendants())
            .filter_map(|el| el.id().map(str::to_owned))
            .collect()
    }

    fn hrefs(doc: &Document) -> Vec<String> {
        doc.content
            .iter()
            .flat_map(|html| html.descendants())
            .filter_map(|el| el.attr("href").map(str::to_owned))
            .collect()
    }

    #[test]
    fn strips_earlier_prefixes() {
        assert_eq!(bare_id("fig-1"), "fig-1");
        assert_eq!(bare_id("auto_fig-1"), "fig-1");
        assert_eq!(bare_id(&format!("auto_{A}_fig-1")), "fig-1");
        assert_eq!(bare_id(&format!("auto_page_{A}_fig-1")), "fig-1");
        assert_eq!(bare_id("auto_my_id"), "my_id");
    }

    #[test]
    fn ids_are_unique_per_page_and_stable_across_runs() -> anyhow::Result<()> {
        let mut a = doc(A, "m1", r#"<p id="x"/><p id="x"/><p id="y"/>"#)?;
        let mut pages = vec![&mut a];
        uniquify_ids(&mut pages);
        let first = ids(&a);
        assert_eq!(
            first,
            vec![format!("auto_{A}_x"), format!("auto_{A}_x_1"), format!("auto_{A}_y")]
        );

        let mut pages = vec![&mut a];
        uniquify_ids(&mut pages);
        assert_eq!(ids(&a)[0], first[0]);
        assert_eq!(ids(&a)[2], first[2]);
        Ok(())
    }

    #[test]
    fn fragment_links_follow_their_targets() -> anyhow::Result<()> {
        let mut a = doc(
            A,
            "m1",
            &format!(
                r##"<p id="eq"/><a href="#eq">same</a><a href="#fig">other</a><a href="#m2">page</a><a href="#auto_{B}_fig">done</a><a href="#nowhere">x</a>"##
            ),
        )?;
        let mut b = doc(B, "m2", r##"<figure id="fig"/><a href="#eq">back</a>"##)?;
        let mut pages = vec![&mut a, &mut b];
        let map = uniquify_ids(&mut pages);
        rewrite_fragment_links(&mut pages, &map);

        assert_eq!(
            hrefs(&a),
            vec![
                format!("#auto_{A}_eq"),
                format!("/contents/{B}#auto_{B}_fig"),
                format!("/contents/{B}"),
                format!("#auto_{B}_fig"),
                "#nowhere".to_owned(),
            ]
        );
        assert_eq!(hrefs(&b), vec![format!("/contents/{A}#auto_{A}_eq")]);
        Ok(())
    }

    #[test]
    fn same_page_entry_wins_over_earlier_page() -> anyhow::Result<()> {
        let mut a = doc(A, "m1", r#"<p id="shared"/>"#)?;
        let mut b = doc(B, "m2", r##"<p id="shared"/><a href="#shared">x</a><a href="#m2">self</a>"##)?;
        let mut pages = vec![&mut a, &mut b];
        let map = uniquify_ids(&mut pages);
        rewrite_fragment_links(&mut pages, &map);
        assert_eq!(
            hrefs(&b),
            vec![format!("#auto_{B}_shared"), format!("#page_{B}")]
        );
        Ok(())
    }
}
