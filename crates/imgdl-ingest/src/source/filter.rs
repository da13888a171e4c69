//! Read-time record filter
//!
//! Evaluated inside the reader so rejected rows never become jobs.

use imgdl_common::{ImgdlError, Result};
use regex::Regex;

use crate::config::IngestConfig;

/// Whole-word, case-insensitive keyword match; every keyword must appear.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilter {
    patterns: Vec<Regex>,
}

impl KeywordFilter {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Result<Self> {
        let patterns = keywords
            .iter()
            .map(|k| k.as_ref().trim())
            .filter(|k| !k.is_empty())
            .map(|k| {
                // Explicit non-word boundaries so keywords like "c++" still work
                Regex::new(&format!(r"(?i)(?:^|\W){}(?:\W|$)", regex::escape(k)))
                    .map_err(|e| ImgdlError::config(format!("invalid keyword '{k}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, caption: &str) -> bool {
        self.patterns.iter().all(|p| p.is_match(caption))
    }
}

/// Predicate pushed down into the source reader
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    min_size: u32,
    keywords: KeywordFilter,
}

impl SourceFilter {
    pub fn new(min_size: u32, keywords: KeywordFilter) -> Self {
        Self { min_size, keywords }
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        Ok(Self::new(config.min_size, KeywordFilter::new(&config.keywords)?))
    }

    /// Whether the caption needs to be inspected at all
    pub fn uses_keywords(&self) -> bool {
        !self.keywords.is_empty()
    }

    /// Declared width and height both at least `min_size`, and the caption
    /// contains every keyword
    pub fn accepts(&self, width: u32, height: u32, caption: &str) -> bool {
        width >= self.min_size && height >= self.min_size && self.keywords.matches(caption)
    }
}
