use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    AssembleConfig, DEFAULT_CONCURRENCY, DEFAULT_EXERCISES_URL, DEFAULT_H5P_PREFIX,
    ExerciseServiceConfig, LinkForm, TransformerKind, XsltConfig,
};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Assemble one or more books of a container into single XHTML documents.
    Assemble(AssembleArgs),
}

#[derive(Debug, Args)]
pub struct AssembleArgs {
    /// Book container root (the directory holding `META-INF/books.xml`).
    #[arg(long)]
    pub container: PathBuf,

    /// Output directory (must not exist yet).
    #[arg(long)]
    pub out: PathBuf,

    /// Book slug to assemble (repeatable; default: all books in the container).
    #[arg(long = "book")]
    pub books: Vec<String>,

    /// Canonical book UUIDs used to pick the home book of shared modules.
    #[arg(long, value_delimiter = ',')]
    pub canonical_books: Vec<String>,

    /// Output form of links into other books.
    #[arg(long, value_enum, default_value_t = LinkForm::Disk)]
    pub link_form: LinkForm,

    /// Replace every inter-book link with a mock target instead of resolving it.
    #[arg(long)]
    pub mock_inter_book: bool,

    /// Turn unresolved references and missing resources into comments.
    #[arg(long)]
    pub loose: bool,

    /// CNXML to XHTML transformer.
    #[arg(long, value_enum, default_value_t = TransformerKind::Native)]
    pub transformer: TransformerKind,

    /// Directory holding the XSLT sheets (required for `--transformer xsltproc`).
    #[arg(long)]
    pub xsl_dir: Option<PathBuf>,

    /// Exercise search URL template with an `{itemCode}` placeholder.
    #[arg(long, default_value = DEFAULT_EXERCISES_URL)]
    pub exercises_url: String,

    /// Sigil prefix marking H5P embeds (`#<prefix>/<nickname>`).
    #[arg(long, default_value = DEFAULT_H5P_PREFIX)]
    pub h5p_prefix: String,

    /// Maximum concurrent exercise fetches.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,
}

impl AssembleArgs {
    pub fn into_config(self) -> AssembleConfig {
        AssembleConfig {
            container: self.container,
            out: self.out,
            books: self.books,
            canonical_books: self
                .canonical_books
                .into_iter()
                .map(|uuid| uuid.trim().to_owned())
                .filter(|uuid| !uuid.is_empty())
                .collect(),
            link_form: self.link_form,
            mock_inter_book: self.mock_inter_book,
            loose: self.loose,
            transformer: self.transformer,
            xslt: XsltConfig {
                xsl_dir: self.xsl_dir,
                ..XsltConfig::default()
            },
            exercises: ExerciseServiceConfig {
                url_template: self.exercises_url,
                ..ExerciseServiceConfig::default()
            },
            h5p_prefix: self.h5p_prefix,
            concurrency: self.concurrency.max(1),
        }
        .with_env()
    }
}
