/// One exercise tag. Tags are `name:value` strings; the two context kinds drive
/// where an embedded exercise may be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExerciseTag {
    /// `context-cnxmod:<page-uuid>`
    ContextModule(String),
    /// `context-cnxfeature:<element-id>`
    ContextFeature(String),
    Other { name: String, value: String },
    Bare(String),
}

impl ExerciseTag {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.split_once(':') {
            Some(("context-cnxmod", value)) => ExerciseTag::ContextModule(value.trim().to_owned()),
            Some(("context-cnxfeature", value)) => {
                ExerciseTag::ContextFeature(value.trim().to_owned())
            }
            Some((name, value)) => ExerciseTag::Other {
                name: name.to_owned(),
                value: value.to_owned(),
            },
            None => ExerciseTag::Bare(raw.to_owned()),
        }
    }
}

impl std::fmt::Display for ExerciseTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExerciseTag::ContextModule(uuid) => write!(f, "context-cnxmod:{uuid}"),
            ExerciseTag::ContextFeature(id) => write!(f, "context-cnxfeature:{id}"),
            ExerciseTag::Other { name, value } => write!(f, "{name}:{value}"),
            ExerciseTag::Bare(tag) => f.write_str(tag),
        }
    }
}

/// Context tags of an exercise: candidate pages and at most one feature id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExerciseContext {
    pub modules: Vec<String>,
    pub feature: Option<String>,
}

impl ExerciseContext {
    pub fn from_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> Self {
        let mut context = Self::default();
        for tag in tags.into_iter().map(ExerciseTag::parse) {
            match tag {
                ExerciseTag::ContextModule(uuid) => {
                    if !context.modules.contains(&uuid) {
                        context.modules.push(uuid);
                    }
                }
                ExerciseTag::ContextFeature(id) => {
                    if context.feature.is_none() {
                        context.feature = Some(id);
                    } else {
                        tracing::warn!(feature = %id, "extra context feature tag ignored");
                    }
                }
                _ => {}
            }
        }
        context
    }
}
