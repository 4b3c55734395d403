//! On-disk H5P interactives.
//!
//! An interactive lives in `<PUBLIC_ROOT>/<nickname>/` with an optional private
//! layer of the same shape under `<PRIVATE_ROOT>/<nickname>/`. Both layers are
//! deep-merged before the content is normalized into the exercise shape the
//! remote service returns.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde_json::Value;

use crate::container::InteractivePaths;
use crate::dom::Element;
use crate::error::AssembleError;
use crate::formats::{Answer, CollaboratorSolution, Exercise, Question};
use crate::resources::ResourceStore;

const REQUIRED_FILES: [&str; 3] = ["h5p.json", "content.json", "metadata.json"];

#[derive(Debug, Clone)]
pub struct Interactive {
    pub nickname: String,
    pub h5p: Value,
    pub content: Value,
    pub metadata: Value,
    /// Layers that exist, private first.
    pub dirs: Vec<PathBuf>,
}

/// Maps merge by key, lists concatenate (public first), scalars prefer `private`.
pub fn deep_merge(public: Value, private: Value) -> Value {
    match (public, private) {
        (Value::Object(mut public), Value::Object(private)) => {
            for (key, value) in private {
                let merged = match public.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                public.insert(key, merged);
            }
            Value::Object(public)
        }
        (Value::Array(mut public), Value::Array(private)) => {
            public.extend(private);
            Value::Array(public)
        }
        (public, Value::Null) => public,
        (_, private) => private,
    }
}

fn layer_file(dir: &Path, name: &str) -> Option<PathBuf> {
    [dir.join(name), dir.join("content").join(name)]
        .into_iter()
        .find(|path| path.is_file())
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Loads and merges both layers of `nickname`. `None` when a required file is
/// missing from both layers.
pub fn load(nickname: &str, paths: &InteractivePaths) -> anyhow::Result<Option<Interactive>> {
    let layers: Vec<&PathBuf> = [paths.public.as_ref(), paths.private.as_ref()]
        .into_iter()
        .flatten()
        .collect();

    let mut merged: Vec<Value> = Vec::with_capacity(REQUIRED_FILES.len());
    for name in REQUIRED_FILES {
        let mut value: Option<Value> = None;
        for dir in &layers {
            let Some(path) = layer_file(dir, name) else {
                continue;
            };
            let layer = read_json(&path)?;
            value = Some(match value {
                Some(public) => deep_merge(public, layer),
                None => layer,
            });
        }
        let Some(value) = value else {
            tracing::error!(nickname = %nickname, file = name, "interactive is missing a required file");
            return Ok(None);
        };
        merged.push(value);
    }

    let mut merged = merged.into_iter();
    let (Some(h5p), Some(content), Some(metadata)) = (merged.next(), merged.next(), merged.next())
    else {
        return Ok(None);
    };
    Ok(Some(Interactive {
        nickname: nickname.to_owned(),
        h5p,
        content,
        metadata,
        dirs: layers.into_iter().rev().cloned().collect(),
    }))
}

fn content_error(nickname: &str, detail: impl Into<String>) -> AssembleError {
    AssembleError::H5pContent {
        nickname: nickname.to_owned(),
        detail: detail.into(),
    }
}

fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn required_str(value: &Value, key: &str, nickname: &str) -> Result<String, AssembleError> {
    str_at(value, key)
        .map(str::to_owned)
        .ok_or_else(|| content_error(nickname, format!("missing key `{key}`")))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// `H5P.MultiChoice 1.16` → `H5P.MultiChoice`
fn library_name(raw: &str) -> &str {
    raw.split_whitespace().next().unwrap_or(raw)
}

fn truthy(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => Some(text.eq_ignore_ascii_case("true")),
        _ => None,
    }
}

fn correctness(correct: bool) -> Option<String> {
    Some(if correct { "1.0" } else { "0.0" }.to_owned())
}

fn multi_choice(
    params: &Value,
    id: Value,
    nickname: &str,
) -> Result<Question, AssembleError> {
    let stem_html = required_str(params, "question", nickname)?;
    let answers = params
        .get("answers")
        .and_then(Value::as_array)
        .ok_or_else(|| content_error(nickname, "missing key `answers`"))?;
    let answers = answers
        .iter()
        .enumerate()
        .map(|(idx, answer)| {
            Ok(Answer {
                id: Value::from(idx as u64 + 1),
                content_html: required_str(answer, "text", nickname)?,
                correctness: correctness(truthy(answer.get("correct")).unwrap_or(false)),
                feedback_html: non_empty(
                    answer
                        .get("tipsAndFeedback")
                        .and_then(|tips| str_at(tips, "chosenFeedback")),
                ),
            })
        })
        .collect::<Result<Vec<_>, AssembleError>>()?;
    let random = params
        .get("behaviour")
        .and_then(|behaviour| truthy(behaviour.get("randomAnswers")))
        .unwrap_or(true);
    Ok(Question {
        id,
        stem_html,
        answers,
        formats: vec!["multiple-choice".to_owned()],
        is_answer_order_important: !random,
        ..Question::default()
    })
}

fn true_false(params: &Value, id: Value, nickname: &str) -> Result<Question, AssembleError> {
    let stem_html = required_str(params, "question", nickname)?;
    let correct = truthy(params.get("correct"))
        .ok_or_else(|| content_error(nickname, "missing key `correct`"))?;
    let behaviour = params.get("behaviour");
    let feedback = |key: &str| non_empty(behaviour.and_then(|b| str_at(b, key)));
    let answers = [(true, "True"), (false, "False")]
        .into_iter()
        .enumerate()
        .map(|(idx, (value, label))| Answer {
            id: Value::from(idx as u64 + 1),
            content_html: label.to_owned(),
            correctness: correctness(value == correct),
            feedback_html: if value == correct {
                feedback("feedbackOnCorrect")
            } else {
                feedback("feedbackOnWrong")
            },
        })
        .collect();
    Ok(Question {
        id,
        stem_html,
        answers,
        formats: vec!["true-false".to_owned()],
        is_answer_order_important: true,
        ..Question::default()
    })
}

/// Questions of one library payload. `nested` is set while inside a QuestionSet.
fn questions_for(
    library: &str,
    params: &Value,
    nickname: &str,
    nested: bool,
    first_id: usize,
) -> Result<Vec<Question>, AssembleError> {
    let id = Value::from(first_id as u64);
    match library_name(library) {
        "H5P.MultiChoice" => Ok(vec![multi_choice(params, id, nickname)?]),
        "H5P.TrueFalse" => Ok(vec![true_false(params, id, nickname)?]),
        "H5P.QuestionSet" if nested => Err(content_error(
            nickname,
            "H5P.QuestionSet may not contain another H5P.QuestionSet",
        )),
        "H5P.QuestionSet" => {
            let entries = params
                .get("questions")
                .and_then(Value::as_array)
                .ok_or_else(|| content_error(nickname, "missing key `questions`"))?;
            let mut questions = Vec::with_capacity(entries.len());
            for (idx, entry) in entries.iter().enumerate() {
                let library = required_str(entry, "library", nickname)?;
                let params = entry
                    .get("params")
                    .ok_or_else(|| content_error(nickname, format!("missing key `questions[{idx}].params`")))?;
                questions.extend(questions_for(&library, params, nickname, true, idx + 1)?);
            }
            Ok(questions)
        }
        other => Err(AssembleError::UnsupportedLibrary {
            name: other.to_owned(),
        }),
    }
}

fn solutions(metadata: &Value) -> Vec<CollaboratorSolution> {
    metadata
        .get("collaborator_solutions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|solution| {
            let content_html = str_at(solution, "content")
                .or_else(|| str_at(solution, "content_html"))?
                .to_owned();
            Some(CollaboratorSolution {
                content_html,
                solution_type: str_at(solution, "solution_type").map(str::to_owned),
            })
        })
        .collect()
}

fn tags(metadata: &Value) -> Vec<String> {
    let mut tags: Vec<String> = metadata
        .get("tags")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect();
    if let Some(page) = str_at(metadata, "feature_page") {
        tags.push(format!("context-cnxmod:{page}"));
    }
    if let Some(feature) = str_at(metadata, "feature_id") {
        tags.push(format!("context-cnxfeature:{feature}"));
    }
    tags
}

impl Interactive {
    pub fn solutions_public(&self) -> bool {
        let flag = |value: &Value| truthy(value.get("isSolutionPublic"));
        flag(&self.metadata)
            .or_else(|| flag(&self.content))
            .unwrap_or(false)
    }

    /// Normalized exercise for this interactive. Solutions are stripped unless
    /// marked public.
    pub fn to_exercise(&self, url: &str, class: Option<String>) -> Result<Exercise, AssembleError> {
        let library = str_at(&self.h5p, "mainLibrary")
            .ok_or_else(|| content_error(&self.nickname, "missing key `mainLibrary`"))?;
        let mut questions = questions_for(library, &self.content, &self.nickname, false, 1)?;

        let public = self.solutions_public();
        let solutions = if public { solutions(&self.metadata) } else { Vec::new() };
        for question in &mut questions {
            question.collaborator_solutions = solutions.clone();
            if !public {
                for answer in &mut question.answers {
                    answer.correctness = None;
                    answer.feedback_html = None;
                }
            }
        }

        Ok(Exercise {
            nickname: Some(self.nickname.clone()),
            tags: tags(&self.metadata),
            url: Some(url.to_owned()),
            class,
            questions,
            is_vocab: false,
            ..Exercise::default()
        })
    }

    fn attachment(&self, relative: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .flat_map(|dir| [dir.join(relative), dir.join("content").join(relative)])
            .find(|path| path.is_file())
    }

    /// Copies media the rendered exercise points at into the resource store and
    /// rewrites the attributes.
    pub fn materialize_attachments(
        &self,
        rendered: &mut Element,
        store: &ResourceStore,
    ) -> anyhow::Result<()> {
        rendered.try_walk_mut(&mut |el: &mut Element| -> anyhow::Result<()> {
            let attr = match el.local_name() {
                "img" | "audio" | "video" | "source" | "iframe" | "embed" => "src",
                "object" => "data",
                _ => return Ok(()),
            };
            let Some(value) = el.attr(attr).map(str::to_owned) else {
                return Ok(());
            };
            if crate::references::classify(&value) != crate::references::ReferenceKind::Resource {
                return Ok(());
            }
            let Some(path) = self.attachment(&value) else {
                return Err(AssembleError::ResourceIo {
                    path: PathBuf::from(&self.nickname).join(&value),
                }
                .into());
            };
            let key = format!("h5p:{}:{value}", self.nickname);
            let target = store.store(&key, &path, el.is("img"))?;
            el.set_attr(attr, target);
            Ok(())
        })
    }
}
