use std::path::PathBuf;

/// Failures the assembly core reports by kind. Plumbing errors travel as
/// `anyhow::Error` with context attached; these are recovered with `downcast_ref`
/// where the kind matters (exit codes, loose-mode downgrades, tests).
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("missing required metadata `{key}` in {}", .path.display())]
    MissingMetadata { path: PathBuf, key: &'static str },

    #[error("unresolved reference `{reference}` in {}", .path.display())]
    UnresolvedReference { path: PathBuf, reference: String },

    #[error(
        "cannot choose a canonical book for module {module_uuid}: contained in [{}], canonical books [{}]",
        .containing.join(", "),
        .canonical.join(", ")
    )]
    AmbiguousContainingBook {
        module_uuid: String,
        containing: Vec<String>,
        canonical: Vec<String>,
    },

    #[error("invalid license: {url}")]
    InvalidLicense { url: String },

    #[error("missing exercise: {code}")]
    MissingExercise { code: String },

    #[error("unsupported H5P library: {name}")]
    UnsupportedLibrary { name: String },

    #[error("H5P content error in `{nickname}`: {detail}")]
    H5pContent { nickname: String, detail: String },

    #[error("resource not readable: {}", .path.display())]
    ResourceIo { path: PathBuf },

    #[error("transient HTTP failure for {url}: {detail}")]
    TransientHttp { url: String, detail: String },

    #[error("feature `{feature}` not found on target page {page}")]
    FeatureNotOnTargetPage { page: String, feature: String },

    #[error("output already exists: {}", .path.display())]
    OutputExists { path: PathBuf },

    #[error("missing content: {what}")]
    MissingContent { what: String },

    #[error("transform `{stage}` failed for {}: {detail}", .path.display())]
    Transform {
        stage: &'static str,
        path: PathBuf,
        detail: String,
    },

    #[error("malformed XML in {}", .path.display())]
    Xml {
        path: PathBuf,
        #[source]
        source: crate::dom::DomError,
    },
}

impl AssembleError {
    /// Process exit code for the CLI wrapper.
    pub fn exit_code(&self) -> u8 {
        match self {
            AssembleError::OutputExists { .. } => 3,
            AssembleError::MissingContent { .. } => 4,
            _ => 1,
        }
    }
}

/// Finds the first typed error in an `anyhow` chain.
pub fn find_assemble_error(err: &anyhow::Error) -> Option<&AssembleError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<AssembleError>())
}
