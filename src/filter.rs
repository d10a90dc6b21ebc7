//! Admission filter deciding which captured URLs enter the notarization
//! pipeline.

use parking_lot::RwLock;
use regex::Regex;

use crate::error::Error;

/// A mutable, atomically replaceable set of URL regular expressions.
///
/// The empty set matches nothing, so with no patterns installed no browsing
/// traffic reaches the scheduler.
#[derive(Default)]
pub struct UrlPatternFilter {
    patterns: RwLock<Vec<Regex>>,
}

impl std::fmt::Debug for UrlPatternFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlPatternFilter")
            .field("patterns", &self.patterns.read().len())
            .finish()
    }
}

impl UrlPatternFilter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and installs a new pattern set, replacing the active one
    /// atomically.
    ///
    /// If any string fails to compile, the error reports its index and the
    /// previously active set stays installed; partial updates are never
    /// visible.
    pub fn set_patterns<S: AsRef<str>>(
        &self,
        sources: &[S],
    ) -> crate::Result<()> {
        let mut compiled = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let regex = Regex::new(source.as_ref())
                .map_err(|source| Error::InvalidUrlPattern { index, source })?;
            compiled.push(regex);
        }
        *self.patterns.write() = compiled;
        Ok(())
    }

    /// True iff any installed pattern matches the URL.
    pub fn matches(&self, url: &str) -> bool {
        self.patterns.read().iter().any(|re| re.is_match(url))
    }

    /// True when no patterns are installed.
    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_installed_pattern() {
        let filter = UrlPatternFilter::new();
        filter
            .set_patterns(&[
                "https://x.com/i/api/1.1/dm/user_updates.json",
            ])
            .unwrap();
        assert!(
            filter.matches("https://x.com/i/api/1.1/dm/user_updates.json")
        );
        assert!(!filter.matches("https://example.com"));
    }

    #[test]
    fn empty_set_matches_nothing() {
        let filter = UrlPatternFilter::new();
        assert!(!filter.matches("https://example.com"));
    }

    #[test]
    fn invalid_pattern_reports_index_and_keeps_old_set() {
        let filter = UrlPatternFilter::new();
        filter.set_patterns(&["https://old\\.example\\.com/.*"]).unwrap();
        let err = filter
            .set_patterns(&["https://new\\.example\\.com/.*", "[broken"])
            .unwrap_err();
        match err {
            Error::InvalidUrlPattern { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other}"),
        }
        // prior set remains active, the half-compiled one is not visible.
        assert!(filter.matches("https://old.example.com/a"));
        assert!(!filter.matches("https://new.example.com/a"));
    }
}
