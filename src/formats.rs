use serde::{Deserialize, Serialize};

/// `resources/<sha1>.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSidecar {
    pub sha1: String,
    pub s3_md5: String,
    pub mime_type: String,
    pub width: i64,
    pub height: i64,
    pub original_name: String,
}

/// One node of `<slug>.toc-metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocNode {
    pub id: String,
    pub title: String,
    pub slug: String,
    #[serde(rename = "shortId", skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<Vec<TocNode>>,
    pub toc_type: String,
    pub toc_target_type: String,
}

/// Response body of the exercise search endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExerciseSearch {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub items: Vec<Exercise>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Exercise {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimulus_html: Option<String>,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub is_vocab: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_context: Option<RequiredContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub stem_html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimulus_html: Option<String>,
    #[serde(default)]
    pub answers: Vec<Answer>,
    #[serde(default)]
    pub collaborator_solutions: Vec<CollaboratorSolution>,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub is_answer_order_important: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Answer {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub content_html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correctness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_html: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorSolution {
    #[serde(default)]
    pub content_html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredContext {
    pub module: String,
    pub feature: String,
    #[serde(rename = "ref")]
    pub reference: String,
}
