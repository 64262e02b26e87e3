//! Path normalization.
//!
//! Routes that embed a resource identifier (for example a course id) would
//! otherwise get one counter per identifier. The normalizer collapses the
//! segment that follows each configured anchor into the wildcard token so
//! that `/v1/courses/123/regenerate` and `/v1/courses/456/regenerate` both
//! become `/v1/courses/*/regenerate`.

use regex::Regex;

use crate::error::{Result, TurnstileError};

/// Token that stands in for one variable path segment.
pub const WILDCARD: &str = "*";

/// Collapses identifier segments into [`WILDCARD`].
#[derive(Debug, Clone, Default)]
pub struct PathNormalizer {
    /// One compiled substitution per anchor, in configuration order
    substitutions: Vec<Regex>,
}

impl PathNormalizer {
    /// Build a normalizer from literal anchors such as `/v1/courses/`.
    ///
    /// The segment directly after every occurrence of an anchor is
    /// replaced. Anchors must be non-empty and end in `/`.
    pub fn new<S: AsRef<str>>(anchors: &[S]) -> Result<Self> {
        let substitutions = anchors
            .iter()
            .map(|anchor| Self::compile_anchor(anchor.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { substitutions })
    }

    fn compile_anchor(anchor: &str) -> Result<Regex> {
        if anchor.is_empty() || !anchor.ends_with('/') {
            return Err(TurnstileError::Config(format!(
                "normalizer anchor '{}' must be non-empty and end with '/'",
                anchor
            )));
        }
        Ok(Regex::new(&format!("(?P<anchor>{})[^/]+", regex::escape(anchor)))?)
    }

    /// Normalize a raw request path. Unmatched paths come back unchanged.
    pub fn normalize(&self, raw_path: &str) -> String {
        let mut path = raw_path.to_string();
        for substitution in &self.substitutions {
            if substitution.is_match(&path) {
                path = substitution
                    .replace_all(&path, format!("${{anchor}}{}", WILDCARD).as_str())
                    .into_owned();
            }
        }
        path
    }

    /// Number of configured anchors.
    pub fn len(&self) -> usize {
        self.substitutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.substitutions.is_empty()
    }
}
