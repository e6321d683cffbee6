//! URL patterns for routing and never-cache rules.

use regex::Regex;
use url::Url;

use crate::NetError;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact URL match.
    Exact,
    /// Prefix match.
    Prefix,
    /// Host equals the pattern or is a subdomain of it.
    Host,
    /// Path ends with one of the extensions (e.g. `css`).
    Extension,
    /// Regular expression over the full URL.
    Regex,
}

/// URL pattern for matching.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string as configured.
    pub pattern: String,
    regex: Option<Regex>,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(url: &str) -> Self {
        Self::plain(PatternType::Exact, url)
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::plain(PatternType::Prefix, prefix)
    }

    /// Create a host pattern (`googleapis.com` matches `fonts.googleapis.com`).
    pub fn host(host: &str) -> Self {
        Self::plain(PatternType::Host, &host.to_ascii_lowercase())
    }

    /// Create a file-extension pattern. The leading dot is optional.
    pub fn extension(ext: &str) -> Self {
        Self::plain(
            PatternType::Extension,
            &ext.trim_start_matches('.').to_ascii_lowercase(),
        )
    }

    /// Compile a regular expression pattern.
    pub fn regex(pattern: &str) -> Result<Self, NetError> {
        let regex = Regex::new(pattern)
            .map_err(|e| NetError::InvalidUrl(format!("bad pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            pattern_type: PatternType::Regex,
            pattern: pattern.to_string(),
            regex: Some(regex),
        })
    }

    fn plain(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
            regex: None,
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        match self.pattern_type {
            PatternType::Exact => url.as_str() == self.pattern,
            PatternType::Prefix => url.as_str().starts_with(&self.pattern),
            PatternType::Host => url
                .host_str()
                .map(|host| {
                    let host = host.to_ascii_lowercase();
                    host == self.pattern
                        || host
                            .strip_suffix(&self.pattern)
                            .is_some_and(|rest| rest.ends_with('.'))
                })
                .unwrap_or(false),
            PatternType::Extension => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(|last| last.rsplit_once('.'))
                .map(|(_, ext)| ext.eq_ignore_ascii_case(&self.pattern))
                .unwrap_or(false),
            PatternType::Regex => self
                .regex
                .as_ref()
                .map(|re| re.is_match(url.as_str()))
                .unwrap_or(false),
        }
    }
}

/// True if any pattern matches.
pub fn matches_any(patterns: &[UrlPattern], url: &Url) -> bool {
    patterns.iter().any(|p| p.matches(url))
}
