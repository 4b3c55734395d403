//! Creative Commons license URLs and their display names.

use crate::error::AssembleError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    pub url: String,
    pub text: String,
}

const VERSIONS: &[&str] = &["1.0", "2.0", "2.5", "3.0", "4.0"];

fn english_text(kind: &str) -> Option<&'static str> {
    let text = match kind {
        "by" => "Creative Commons Attribution License",
        "by-sa" => "Creative Commons Attribution-ShareAlike License",
        "by-nd" => "Creative Commons Attribution-NoDerivatives License",
        "by-nc" => "Creative Commons Attribution-NonCommercial License",
        "by-nc-sa" => "Creative Commons Attribution-NonCommercial-ShareAlike License",
        "by-nc-nd" => "Creative Commons Attribution-NonCommercial-NoDerivatives License",
        _ => return None,
    };
    Some(text)
}

const ZERO_TEXT: &str = "Creative Commons CC0 1.0 Universal";

/// Validates a Creative Commons license URL and picks its display text.
///
/// A `/deed.<lang>` URL in a language other than English must match the document
/// `language`, and its display text is the license element's own text.
pub fn resolve(
    url: &str,
    inner_text: Option<&str>,
    language: Option<&str>,
) -> Result<License, AssembleError> {
    let invalid = || AssembleError::InvalidLicense {
        url: url.to_owned(),
    };

    let trimmed = url.trim();
    let parsed = url::Url::parse(trimmed.trim_end_matches('/')).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https")
        || parsed.host_str() != Some("creativecommons.org")
    {
        return Err(invalid());
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let (english, deed) = match segments.as_slice() {
        ["licenses", kind, version, rest @ ..] if VERSIONS.contains(version) => {
            (english_text(kind).ok_or_else(invalid)?, rest)
        }
        ["publicdomain", "zero", "1.0", rest @ ..] => (ZERO_TEXT, rest),
        _ => return Err(invalid()),
    };

    let deed_lang = match deed {
        [] => None,
        [deed] => Some(deed.strip_prefix("deed.").ok_or_else(invalid)?),
        _ => return Err(invalid()),
    };

    let text = match deed_lang {
        None => english.to_owned(),
        Some(lang) if lang.eq_ignore_ascii_case("en") => english.to_owned(),
        Some(lang) => {
            let matches_document = language
                .is_some_and(|doc_lang| doc_lang.trim().eq_ignore_ascii_case(lang));
            if !matches_document {
                return Err(invalid());
            }
            let localized = inner_text.map(str::trim).unwrap_or_default();
            if localized.is_empty() {
                return Err(invalid());
            }
            localized.to_owned()
        }
    };

    Ok(License {
        url: trimmed.to_owned(),
        text,
    })
}
