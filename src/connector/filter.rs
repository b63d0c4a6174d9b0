//! Banned-pattern and media-type filtering shared by connectors.

use regex::Regex;

use super::ConnectorError;
use crate::output::extension_of;

/// Extensions accepted for attachments, with the MIME type recorded for them.
pub const ALLOWED_EXTENSION_TYPES: &[(&str, &str)] = &[
    ("pdf", "application/pdf"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    (
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
];

/// MIME type for an allowed extension.
#[must_use]
pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    let extension = extension.to_ascii_lowercase();
    ALLOWED_EXTENSION_TYPES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
}

/// Compiles user-supplied regular expressions.
///
/// # Errors
///
/// Returns [`ConnectorError::Pattern`] for the first pattern that fails to compile.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConnectorError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| ConnectorError::Pattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

/// Whether `text` matches any of `patterns`.
#[must_use]
pub fn matches_any(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

/// Why an attachment was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// File name matched a banned pattern.
    Banned,
    /// Extension is not in [`ALLOWED_EXTENSION_TYPES`].
    UnsupportedType,
}

impl Rejection {
    /// Short label for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::UnsupportedType => "unsupported type",
        }
    }
}

/// Decides which attachments are downloaded.
#[derive(Debug, Clone, Default)]
pub struct AttachmentFilter {
    banned: Vec<Regex>,
}

impl AttachmentFilter {
    /// Builds a filter from banned file name patterns.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Pattern`] when a pattern is not a valid regex.
    pub fn new(banned_patterns: &[String]) -> Result<Self, ConnectorError> {
        Ok(Self {
            banned: compile_patterns(banned_patterns)?,
        })
    }

    /// Returns the MIME type to record for `file_name`, or why it was rejected.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] reason; banned patterns are checked first.
    pub fn accept(&self, file_name: &str) -> Result<&'static str, Rejection> {
        if matches_any(&self.banned, file_name) {
            return Err(Rejection::Banned);
        }
        extension_of(file_name)
            .and_then(|ext| mime_for_extension(&ext))
            .ok_or(Rejection::UnsupportedType)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_for_extension_is_case_insensitive() {
        assert_eq!(mime_for_extension("PDF"), Some("application/pdf"));
        assert!(mime_for_extension("docx").unwrap().contains("wordprocessingml"));
        assert_eq!(mime_for_extension("png"), None);
    }

    #[test]
    fn test_filter_accepts_allowed_types() {
        let filter = AttachmentFilter::new(&[]).unwrap();
        assert_eq!(filter.accept("Design Review.pdf"), Ok("application/pdf"));
        assert!(filter.accept("deck.PPTX").unwrap().contains("presentationml"));
    }

    #[test]
    fn test_filter_rejects_unsupported_type() {
        let filter = AttachmentFilter::new(&[]).unwrap();
        assert_eq!(filter.accept("diagram.png"), Err(Rejection::UnsupportedType));
        assert_eq!(filter.accept("no-extension"), Err(Rejection::UnsupportedType));
    }

    #[test]
    fn test_filter_banned_pattern_wins_over_type() {
        let filter = AttachmentFilter::new(&["(?i)^draft".to_string()]).unwrap();
        assert_eq!(filter.accept("Draft plan.pdf"), Err(Rejection::Banned));
        assert_eq!(filter.accept("Final plan.pdf"), Ok("application/pdf"));
    }

    #[test]
    fn test_rejection_labels() {
        assert_eq!(Rejection::Banned.as_str(), "banned");
        assert_eq!(Rejection::UnsupportedType.as_str(), "unsupported type");
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let err = AttachmentFilter::new(&["(unclosed".to_string()]).unwrap_err();
        assert!(matches!(err, ConnectorError::Pattern { ref pattern, .. } if pattern == "(unclosed"));
    }
}
