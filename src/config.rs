use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_EXERCISES_URL: &str = "https://exercises.openstax.org/api/exercises?q={itemCode}";
pub const DEFAULT_H5P_PREFIX: &str = "H5P";
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Output form for links into other books.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LinkForm {
    /// `./<book-uuid>@<version>:<page-uuid>.xhtml`
    #[default]
    Disk,
    /// `http://openstax.org/books/<book-slug>/pages/<page-slug>`
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TransformerKind {
    #[default]
    Native,
    Xsltproc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExerciseServiceConfig {
    /// URL with an `{itemCode}` placeholder.
    pub url_template: String,
    pub token: Option<String>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl Default for ExerciseServiceConfig {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_EXERCISES_URL.to_owned(),
            token: None,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct XsltConfig {
    pub bin: String,
    pub xsl_dir: Option<PathBuf>,
}

impl Default for XsltConfig {
    fn default() -> Self {
        Self {
            bin: "xsltproc".to_owned(),
            xsl_dir: None,
        }
    }
}

/// Everything one `assemble` run needs. Flags fill most of it; secrets and binary
/// paths come from the environment.
#[derive(Debug, Clone)]
pub struct AssembleConfig {
    pub container: PathBuf,
    pub out: PathBuf,
    /// Book slugs to assemble; empty means every book in the container.
    pub books: Vec<String>,
    pub canonical_books: Vec<String>,
    pub link_form: LinkForm,
    pub mock_inter_book: bool,
    /// Downgrade unresolved references and missing resources to comments.
    pub loose: bool,
    pub transformer: TransformerKind,
    pub xslt: XsltConfig,
    pub exercises: ExerciseServiceConfig,
    pub h5p_prefix: String,
    pub concurrency: usize,
}

impl Default for AssembleConfig {
    fn default() -> Self {
        Self {
            container: PathBuf::new(),
            out: PathBuf::new(),
            books: Vec::new(),
            canonical_books: Vec::new(),
            link_form: LinkForm::default(),
            mock_inter_book: false,
            loose: false,
            transformer: TransformerKind::default(),
            xslt: XsltConfig::default(),
            exercises: ExerciseServiceConfig::default(),
            h5p_prefix: DEFAULT_H5P_PREFIX.to_owned(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl AssembleConfig {
    /// Applies `CNXBOOK_EXERCISES_TOKEN` and `CNXBOOK_XSLTPROC_BIN`.
    pub fn with_env(mut self) -> Self {
        if let Ok(token) = std::env::var("CNXBOOK_EXERCISES_TOKEN")
            && !token.trim().is_empty()
        {
            self.exercises.token = Some(token);
        }
        if let Ok(bin) = std::env::var("CNXBOOK_XSLTPROC_BIN")
            && !bin.trim().is_empty()
        {
            self.xslt.bin = bin;
        }
        self
    }
}
