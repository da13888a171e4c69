//! Common types used across imgdl

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::naming::ContentHash;

/// Characters left unescaped in stored source URLs: alphanumerics, `_.-~`
/// and the path separator. Everything else, including `:` and `%`, is
/// percent-encoded.
const URL_ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

/// One candidate row from an input dataset, after the read-time filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub url: String,
    pub caption: String,
    pub declared_width: u32,
    pub declared_height: u32,
}

impl SourceRecord {
    pub fn new(
        url: impl Into<String>,
        caption: impl Into<String>,
        declared_width: u32,
        declared_height: u32,
    ) -> Self {
        Self {
            url: url.into(),
            caption: caption.into(),
            declared_width,
            declared_height,
        }
    }

    /// File extension of the URL path, without the dot
    pub fn extension(&self) -> Option<String> {
        url_extension(&self.url)
    }
}

/// A square, re-encoded image.
///
/// `width` and `height` always equal the configured target size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedImage {
    pub encoded_bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
}

/// The persisted unit of the output dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_hash: ContentHash,
    pub byte_size: u32,
    pub width: u16,
    pub height: u16,
    pub original_width: u16,
    pub original_height: u16,
    /// Percent-escaped source URL
    pub source_url: String,
    /// Caption with every `"` removed
    pub caption: String,
    pub image_bytes: Bytes,
    pub license_tag: String,
}

impl Record {
    /// Build the persisted record for a transformed image.
    ///
    /// Dimensions that do not fit the output column type saturate.
    pub fn new(source: &SourceRecord, image: TransformedImage, license_tag: &str) -> Self {
        Self {
            content_hash: ContentHash::of(&image.encoded_bytes),
            byte_size: u32::try_from(image.encoded_bytes.len()).unwrap_or(u32::MAX),
            width: saturate_u16(image.width),
            height: saturate_u16(image.height),
            original_width: saturate_u16(image.original_width),
            original_height: saturate_u16(image.original_height),
            source_url: escape_url(&source.url),
            caption: sanitize_caption(&source.caption),
            image_bytes: image.encoded_bytes,
            license_tag: license_tag.to_string(),
        }
    }
}

fn saturate_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// Percent-escape a URL for storage
pub fn escape_url(url: &str) -> String {
    utf8_percent_encode(url, URL_ESCAPE_SET).to_string()
}

/// Strip embedded double quotes from a caption
pub fn sanitize_caption(caption: &str) -> String {
    caption.replace('"', "")
}

/// Extension of the last path segment of `url`, if any.
///
/// A leading dot does not start an extension (`/.hidden` has none).
pub fn url_extension(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_string())
}
