//! Replaces `<a class="os-embed">` placeholders with rendered exercises.
//!
//! All lookups for a book run first, concurrently, through [`crate::pool`]. Context
//! checks and DOM splicing then happen page by page on the calling task.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bookpart::Document;
use crate::container::{Container, InteractivePaths};
use crate::dom::{self, Element, Node};
use crate::error::AssembleError;
use crate::exercises::{self, ExerciseSource};
use crate::formats::{Exercise, Question, RequiredContext};
use crate::h5p::{self, Interactive};
use crate::resources::ResourceStore;
use crate::tags::ExerciseContext;

pub const EMBED_CLASS: &str = "os-embed";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EmbedKind {
    /// Item code `tag:<code>` or `nickname:<nick>`.
    Remote { item_code: String },
    H5p { nickname: String },
}

/// `#ost/api/ex/<tag>`, `#exercise/<nickname>` or `#<h5p-prefix>/<nickname>`.
pub fn parse_sigil(href: &str, h5p_prefix: &str) -> Option<EmbedKind> {
    let rest = href.strip_prefix('#')?;
    if let Some(tag) = rest.strip_prefix("ost/api/ex/").filter(|t| !t.is_empty()) {
        return Some(EmbedKind::Remote {
            item_code: format!("tag:{tag}"),
        });
    }
    if let Some(nickname) = rest.strip_prefix("exercise/").filter(|n| !n.is_empty()) {
        return Some(EmbedKind::Remote {
            item_code: format!("nickname:{nickname}"),
        });
    }
    let nickname = rest
        .strip_prefix(h5p_prefix)
        .and_then(|r| r.strip_prefix('/'))
        .filter(|n| !n.is_empty())?;
    Some(EmbedKind::H5p {
        nickname: nickname.to_owned(),
    })
}

enum Fetched {
    Remote(Option<Exercise>),
    H5p(Option<Interactive>),
}

enum FetchJob {
    Remote {
        item_code: String,
        source: Arc<dyn ExerciseSource>,
    },
    H5p {
        nickname: String,
        paths: InteractivePaths,
    },
}

async fn fetch(job: FetchJob) -> anyhow::Result<Fetched> {
    match job {
        FetchJob::Remote { item_code, source } => {
            let search = source.search(&item_code).await?;
            Ok(Fetched::Remote(exercises::single_item(search, &item_code)?))
        }
        FetchJob::H5p { nickname, paths } => {
            if paths.is_empty() {
                tracing::error!(nickname = %nickname, "interactive not found in container");
                return Ok(Fetched::H5p(None));
            }
            Ok(Fetched::H5p(h5p::load(&nickname, &paths)?))
        }
    }
}

struct EmbedSite {
    page: usize,
    href: String,
    kind: EmbedKind,
}

pub struct Injector<'a> {
    pub container: &'a Container,
    pub store: &'a ResourceStore,
    pub source: Arc<dyn ExerciseSource>,
    pub h5p_prefix: &'a str,
    pub concurrency: usize,
}

impl Injector<'_> {
    /// Resolves every embed on `pages` (one book, in book order).
    pub async fn inject(&self, pages: &mut [&mut Document]) -> anyhow::Result<()> {
        let sites = self.collect_sites(pages);
        if sites.is_empty() {
            return Ok(());
        }

        let mut kinds: Vec<EmbedKind> = Vec::new();
        for site in &sites {
            if !kinds.contains(&site.kind) {
                kinds.push(site.kind.clone());
            }
        }
        tracing::info!(embeds = sites.len(), lookups = kinds.len(), "resolving embedded exercises");

        let jobs = kinds
            .iter()
            .map(|kind| match kind {
                EmbedKind::Remote { item_code } => FetchJob::Remote {
                    item_code: item_code.clone(),
                    source: Arc::clone(&self.source),
                },
                EmbedKind::H5p { nickname } => FetchJob::H5p {
                    nickname: nickname.clone(),
                    paths: self.container.interactive_paths_for(nickname),
                },
            })
            .collect();
        let fetched: HashMap<EmbedKind, Fetched> = kinds
            .into_iter()
            .zip(crate::pool::run_bounded(self.concurrency, jobs, fetch).await?)
            .collect();

        let page_uuids: Vec<String> = pages.iter().map(|doc| doc.uuid().to_owned()).collect();
        let docs: Vec<&Document> = pages.iter().map(|doc| &**doc).collect();
        let mut contexts: HashMap<(usize, String), Option<RequiredContext>> = HashMap::new();
        for site in &sites {
            let tags = match fetched.get(&site.kind) {
                Some(Fetched::Remote(Some(exercise))) => exercise.tags.clone(),
                Some(Fetched::H5p(Some(interactive))) => {
                    interactive.to_exercise(&site.href, None)?.tags
                }
                _ => continue,
            };
            let context = ExerciseContext::from_tags(tags.iter().map(String::as_str));
            let required = choose_context(&context, site.page, &page_uuids, |idx, feature| {
                has_feature(docs[idx], &page_uuids[idx], feature)
            })?;
            contexts.insert((site.page, site.href.clone()), required);
        }

        for (idx, doc) in pages.iter_mut().enumerate() {
            let Some(content) = doc.content.as_mut() else {
                continue;
            };
            content.splice(&mut |el: &mut Element| -> anyhow::Result<Option<Vec<Node>>> {
                let Some((href, kind)) = self.embed_of(el) else {
                    return Ok(None);
                };
                let class = exercise_class(el);
                let required = contexts.get(&(idx, href.clone())).cloned().flatten();
                let nodes = match (fetched.get(&kind), &kind) {
                    (Some(Fetched::Remote(Some(exercise))), _) => {
                        let mut exercise = exercise.clone();
                        if exercise.class.is_none() {
                            exercise.class = class;
                        }
                        exercise.required_context = required;
                        to_nodes(&render(&exercise))
                    }
                    (Some(Fetched::H5p(Some(interactive))), _) => {
                        let mut exercise = interactive.to_exercise(&href, class)?;
                        exercise.required_context = required;
                        let mut nodes = to_nodes(&render(&exercise));
                        for node in &mut nodes {
                            if let Some(el) = node.as_element_mut() {
                                interactive.materialize_attachments(el, self.store)?;
                            }
                        }
                        nodes
                    }
                    (_, EmbedKind::Remote { item_code }) => {
                        let missing = AssembleError::MissingExercise {
                            code: item_code.clone(),
                        };
                        tracing::warn!(page = %page_uuids[idx], %missing, "placeholder inserted");
                        placeholder(&format!("MISSING EXERCISE: {item_code}"))
                    }
                    (_, EmbedKind::H5p { nickname }) => {
                        placeholder(&format!("MISSING INTERACTIVE: {nickname}"))
                    }
                };
                Ok(Some(nodes))
            })?;
        }
        Ok(())
    }

    fn embed_of(&self, el: &Element) -> Option<(String, EmbedKind)> {
        if !el.is("a") || !el.has_class(EMBED_CLASS) {
            return None;
        }
        let href = el.attr("href")?;
        let kind = parse_sigil(href, self.h5p_prefix)?;
        Some((href.to_owned(), kind))
    }

    fn collect_sites(&self, pages: &[&mut Document]) -> Vec<EmbedSite> {
        let mut sites = Vec::new();
        for (page, doc) in pages.iter().enumerate() {
            let Some(content) = doc.content.as_ref() else {
                continue;
            };
            for el in content.descendants() {
                if let Some((href, kind)) = self.embed_of(el) {
                    sites.push(EmbedSite { page, href, kind });
                } else if el.is("a") && el.has_class(EMBED_CLASS) {
                    tracing::debug!(href = ?el.attr("href"), "embed link with unknown sigil left alone");
                }
            }
        }
        sites
    }
}

/// The feature element may already carry the page prefix or still be bare.
fn has_feature(doc: &Document, page_uuid: &str, feature: &str) -> bool {
    let prefixed = format!("auto_{page_uuid}_{feature}");
    doc.content.as_ref().is_some_and(|content| {
        content
            .descendants()
            .any(|el| el.id().is_some_and(|id| id == prefixed || id == feature))
    })
}

/// Picks the page an exercise belongs to. `page` is where the embed sits; the
/// candidates are the tagged pages of this book, plus `page` when it holds the
/// feature. Without a feature tag there is nothing to check.
pub fn choose_context(
    context: &ExerciseContext,
    page: usize,
    page_uuids: &[String],
    has_feature: impl Fn(usize, &str) -> bool,
) -> Result<Option<RequiredContext>, AssembleError> {
    let Some(feature) = context.feature.as_deref() else {
        return Ok(None);
    };

    let mut candidates: Vec<usize> = page_uuids
        .iter()
        .enumerate()
        .filter(|(_, uuid)| context.modules.contains(uuid))
        .map(|(idx, _)| idx)
        .collect();
    if has_feature(page, feature) {
        if !candidates.contains(&page) {
            candidates.push(page);
        }
    } else {
        candidates.retain(|idx| *idx != page);
    }

    let chosen = if candidates.contains(&page) {
        page
    } else {
        let first = *candidates.first().ok_or_else(|| AssembleError::FeatureNotOnTargetPage {
            page: page_uuids[page].clone(),
            feature: feature.to_owned(),
        })?;
        candidates
            .iter()
            .copied()
            .find(|idx| has_feature(*idx, feature))
            .unwrap_or(first)
    };
    if !has_feature(chosen, feature) {
        return Err(AssembleError::FeatureNotOnTargetPage {
            page: page_uuids[chosen].clone(),
            feature: feature.to_owned(),
        });
    }

    let module = page_uuids[chosen].clone();
    Ok(Some(RequiredContext {
        reference: format!("auto_{module}_{feature}"),
        module,
        feature: feature.to_owned(),
    }))
}

fn exercise_class(anchor: &Element) -> Option<String> {
    let classes: Vec<&str> = anchor.classes().filter(|c| *c != EMBED_CLASS).collect();
    (!classes.is_empty()).then(|| classes.join(" "))
}

fn placeholder(text: &str) -> Vec<Node> {
    vec![Node::Element(
        Element::new("div")
            .with_attr("data-type", "missing-exercise")
            .with_text(text),
    )]
}

/// Well-formed XML first; otherwise the lenient HTML reading.
fn to_nodes(markup: &str) -> Vec<Node> {
    match dom::parse_fragment(markup) {
        Ok(nodes) => nodes,
        Err(err) => {
            tracing::debug!(%err, "rendered exercise is not well-formed XML; parsing as HTML");
            crate::html::parse_fragment(markup)
        }
    }
}

fn attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&dom::escape_attr(value));
    out.push('"');
}

/// Renders the exercise through the fixed injected-exercise markup.
pub fn render(exercise: &Exercise) -> String {
    let mut out = String::from("<div");
    attr(&mut out, "data-type", "injected-exercise");
    if let Some(class) = &exercise.class {
        attr(&mut out, "class", class);
    }
    if let Some(uid) = &exercise.uid {
        attr(&mut out, "data-injected-from-uid", uid);
    }
    if let Some(nickname) = &exercise.nickname {
        attr(&mut out, "data-injected-from-nickname", nickname);
    }
    if let Some(url) = &exercise.url {
        attr(&mut out, "data-injected-from-url", url);
    }
    if !exercise.tags.is_empty() {
        attr(&mut out, "data-tags", &exercise.tags.join(" "));
    }
    attr(&mut out, "data-is-vocab", if exercise.is_vocab { "true" } else { "false" });
    if let Some(context) = &exercise.required_context {
        attr(&mut out, "data-required-context-module", &context.module);
        attr(&mut out, "data-required-context-feature", &context.feature);
        attr(&mut out, "data-required-context-ref", &context.reference);
    }
    out.push('>');

    if let Some(context) = &exercise.required_context {
        out.push_str("<div data-type=\"exercise-context\">");
        out.push_str("<a class=\"autogenerated-content\"");
        attr(&mut out, "href", &format!("#{}", context.reference));
        out.push_str(">[link]</a></div>");
    }
    if let Some(stimulus) = &exercise.stimulus_html {
        out.push_str("<div data-type=\"exercise-stimulus\">");
        out.push_str(stimulus);
        out.push_str("</div>");
    }
    for question in &exercise.questions {
        render_question(&mut out, question);
    }
    out.push_str("</div>");
    out
}

fn render_question(out: &mut String, question: &Question) {
    out.push_str("<div");
    attr(out, "data-type", "exercise-question");
    let id = match &question.id {
        serde_json::Value::String(id) => id.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    if !id.is_empty() {
        attr(out, "data-id", &id);
    }
    attr(
        out,
        "data-is-answer-order-important",
        if question.is_answer_order_important { "true" } else { "false" },
    );
    if !question.formats.is_empty() {
        attr(out, "data-formats", &question.formats.join(" "));
    }
    out.push('>');

    if let Some(stimulus) = &question.stimulus_html {
        out.push_str("<div data-type=\"question-stimulus\">");
        out.push_str(stimulus);
        out.push_str("</div>");
    }
    out.push_str("<div data-type=\"question-stem\">");
    out.push_str(&question.stem_html);
    out.push_str("</div>");

    if !question.answers.is_empty() {
        out.push_str("<ol data-type=\"question-answers\" type=\"a\">");
        for answer in &question.answers {
            out.push_str("<li");
            attr(out, "data-type", "question-answer");
            if let Some(correctness) = &answer.correctness {
                attr(out, "data-correctness", correctness);
            }
            out.push_str("><div data-type=\"answer-content\">");
            out.push_str(&answer.content_html);
            out.push_str("</div>");
            if let Some(feedback) = &answer.feedback_html {
                out.push_str("<div data-type=\"answer-feedback\">");
                out.push_str(feedback);
                out.push_str("</div>");
            }
            out.push_str("</li>");
        }
        out.push_str("</ol>");
    }

    for solution in &question.collaborator_solutions {
        out.push_str("<div");
        attr(out, "data-type", "question-solution");
        attr(out, "data-solution-source", "collaborator");
        if let Some(kind) = &solution.solution_type {
            attr(out, "data-solution-type", kind);
        }
        out.push('>');
        out.push_str(&solution.content_html);
        out.push_str("</div>");
    }
    out.push_str("</div>");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::Answer;

    fn uuids() -> Vec<String> {
        ["p0", "p1", "p2"].into_iter().map(str::to_owned).collect()
    }

    fn context(modules: &[&str], feature: Option<&str>) -> ExerciseContext {
        ExerciseContext {
            modules: modules.iter().map(|m| (*m).to_owned()).collect(),
            feature: feature.map(str::to_owned),
        }
    }

    #[test]
    fn sigils() {
        assert_eq!(
            parse_sigil("#ost/api/ex/FOO", "H5P"),
            Some(EmbedKind::Remote {
                item_code: "tag:FOO".to_owned()
            })
        );
        assert_eq!(
            parse_sigil("#exercise/quiz", "H5P"),
            Some(EmbedKind::Remote {
                item_code: "nickname:quiz".to_owned()
            })
        );
        assert_eq!(
            parse_sigil("#H5P/quiz", "H5P"),
            Some(EmbedKind::H5p {
                nickname: "quiz".to_owned()
            })
        );
        assert_eq!(parse_sigil("#fig-1", "H5P"), None);
    }

    #[test]
    fn context_prefers_the_embedding_page() -> anyhow::Result<()> {
        let chosen = choose_context(&context(&["p2"], Some("bar")), 1, &uuids(), |idx, _| {
            idx == 1 || idx == 2
        })?;
        assert_eq!(
            chosen,
            Some(RequiredContext {
                module: "p1".to_owned(),
                feature: "bar".to_owned(),
                reference: "auto_p1_bar".to_owned(),
            })
        );
        Ok(())
    }

    #[test]
    fn context_falls_back_to_tagged_page_and_checks_it() -> anyhow::Result<()> {
        let chosen = choose_context(&context(&["p1", "p2"], Some("bar")), 0, &uuids(), |idx, _| {
            idx == 2
        })?;
        assert_eq!(chosen.map(|c| c.module), Some("p2".to_owned()));

        let err = choose_context(&context(&["p1"], Some("bar")), 0, &uuids(), |_, _| false);
        assert!(matches!(
            err,
            Err(AssembleError::FeatureNotOnTargetPage { page, .. }) if page == "p1"
        ));

        let err = choose_context(&context(&["elsewhere"], Some("bar")), 0, &uuids(), |_, _| false);
        assert!(matches!(err, Err(AssembleError::FeatureNotOnTargetPage { .. })));
        Ok(())
    }

    #[test]
    fn no_feature_means_no_context() -> anyhow::Result<()> {
        assert_eq!(
            choose_context(&context(&["p2"], None), 0, &uuids(), |_, _| false)?,
            None
        );
        Ok(())
    }

    #[test]
    fn rendered_markup_parses_and_falls_back_to_html() -> anyhow::Result<()> {
        let exercise = Exercise {
            uid: Some("9@2".to_owned()),
            questions: vec![Question {
                stem_html: "Pick<br>one".to_owned(),
                answers: vec![Answer {
                    content_html: "A".to_owned(),
                    correctness: Some("1.0".to_owned()),
                    ..Answer::default()
                }],
                ..Question::default()
            }],
            ..Exercise::default()
        };
        let nodes = to_nodes(&render(&exercise));
        let root = nodes
            .iter()
            .find_map(Node::as_element)
            .ok_or_else(|| anyhow::anyhow!("no element rendered"))?;
        assert_eq!(root.data_type(), Some("injected-exercise"));
        let answer = root
            .find(|el| el.data_type() == Some("question-answer"))
            .ok_or_else(|| anyhow::anyhow!("answer missing"))?;
        assert_eq!(answer.attr("data-correctness"), Some("1.0"));
        assert!(root.find(|el| el.is("br")).is_some());
        Ok(())
    }
}
