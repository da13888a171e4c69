//! Ingestion configuration
//!
//! Settings are layered: built-in defaults, an optional YAML file, then
//! environment variables and command-line flags (applied in `main.rs`).

use imgdl_common::{ImgdlError, Result};
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default output dataset path.
pub const DEFAULT_OUTPUT: &str = "images.parquet";

/// Default checkpoint log path.
pub const DEFAULT_CHECKPOINT_FILE: &str = "processed.txt";

/// Images narrower or shorter than this are skipped.
pub const DEFAULT_MIN_IMAGE_SIZE: u32 = 128;

/// JPEG quality of re-encoded images.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Concurrent fetches per available CPU; workers mostly wait on the network.
pub const WORKERS_PER_CPU: usize = 8;

/// Per-attempt HTTP timeout in seconds.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Largest accepted response body (32 MiB).
pub const DEFAULT_MAX_BODY_BYTES: u64 = 32 * 1024 * 1024;

/// Rows buffered before a row group is written.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 100;

/// Rows per record batch when reading input files.
pub const DEFAULT_READ_BATCH_SIZE: usize = 8192;

/// Value stored in the `license_tag` column.
pub const DEFAULT_LICENSE_TAG: &str = "?";

/// Identifying `User-Agent` sent with every request.
pub const DEFAULT_USER_AGENT: &str = concat!("imgdl/", env!("CARGO_PKG_VERSION"));

/// Largest accepted target edge; JPEG dimensions are 16-bit.
pub const MAX_TARGET_SIZE: u32 = u16::MAX as u32;

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Input Parquet files, processed in order
    pub inputs: Vec<PathBuf>,
    /// Output Parquet file
    pub output: PathBuf,
    /// Worker pool size, also the admission gate capacity
    pub workers: usize,
    /// Caption keywords; all must appear as whole words, in any order
    pub keywords: Vec<String>,
    /// Minimum width and height, both declared and decoded
    pub min_size: u32,
    /// Output edge length; defaults to `min_size`
    pub target_size: Option<u32>,
    pub jpeg_quality: u8,
    /// URL path extensions accepted by the sink (case-insensitive)
    pub allowed_extensions: Vec<String>,
    /// Encoded images smaller than this many bytes are dropped
    pub min_byte_size: u64,
    pub license_tag: String,
    pub checkpoint_path: PathBuf,
    /// Discard the checkpoint log and start from scratch
    pub no_continue: bool,
    /// Delete the checkpoint log after a run in which every file completed
    pub clear_checkpoint_on_success: bool,
    /// Count matching records without fetching or writing anything
    pub dry_run: bool,
    pub columns: ColumnNames,
    pub fetch: FetchConfig,
    pub writer: WriterConfig,
    pub read_batch_size: usize,
    /// Show the throughput spinner
    pub progress: bool,
}

/// Input column names, for datasets that do not use the LAION layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub url: String,
    pub caption: String,
    pub width: String,
    pub height: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            url: "URL".to_string(),
            caption: "TEXT".to_string(),
            width: "WIDTH".to_string(),
            height: "HEIGHT".to_string(),
        }
    }
}

impl ColumnNames {
    pub fn all(&self) -> [&str; 4] {
        [&self.url, &self.caption, &self.width, &self.height]
    }
}

/// HTTP fetch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Pause between attempts; zero retries immediately
    pub retry_delay_ms: u64,
    pub user_agent: String,
    /// Responses with a larger body are dropped
    pub max_body_bytes: u64,
    /// `X-Robots-Tag` directives that make a response unusable (e.g. `noai`)
    pub disallowed_directives: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_retries: 0,
            retry_delay_ms: 0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            disallowed_directives: Vec::new(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Output writer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub flush_threshold: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            output: PathBuf::from(DEFAULT_OUTPUT),
            workers: default_workers(),
            keywords: Vec::new(),
            min_size: DEFAULT_MIN_IMAGE_SIZE,
            target_size: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            allowed_extensions: vec!["jpg".to_string(), "png".to_string()],
            min_byte_size: 0,
            license_tag: DEFAULT_LICENSE_TAG.to_string(),
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_FILE),
            no_continue: false,
            clear_checkpoint_on_success: false,
            dry_run: false,
            columns: ColumnNames::default(),
            fetch: FetchConfig::default(),
            writer: WriterConfig::default(),
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            progress: true,
        }
    }
}

/// Default worker count: [`WORKERS_PER_CPU`] per available CPU
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * WORKERS_PER_CPU
}

/// Split a comma-separated keyword list, trimming blanks
pub fn parse_keyword_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

impl IngestConfig {
    /// Load configuration from a YAML file; missing keys keep their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ImgdlError::config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
            .map_err(|e| ImgdlError::config(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml_str(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Edge length of stored images
    pub fn target_size(&self) -> u32 {
        self.target_size.unwrap_or(self.min_size)
    }

    /// Reject settings that would fail later or deadlock the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(ImgdlError::config("at least one input file is required"));
        }
        if self.workers == 0 {
            return Err(ImgdlError::config("workers must be greater than 0"));
        }
        let target = self.target_size();
        if target == 0 || target > MAX_TARGET_SIZE {
            return Err(ImgdlError::config(format!(
                "target size must be between 1 and {MAX_TARGET_SIZE}, got {target}"
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ImgdlError::config(format!(
                "jpeg quality must be between 1 and 100, got {}",
                self.jpeg_quality
            )));
        }
        if self.writer.flush_threshold == 0 {
            return Err(ImgdlError::config("flush threshold must be greater than 0"));
        }
        if self.read_batch_size == 0 {
            return Err(ImgdlError::config("read batch size must be greater than 0"));
        }
        if HeaderValue::from_str(&self.fetch.user_agent).is_err() {
            return Err(ImgdlError::config(format!(
                "user agent {:?} is not a valid header value",
                self.fetch.user_agent
            )));
        }
        if self.fetch.max_body_bytes == 0 {
            return Err(ImgdlError::config("max body bytes must be greater than 0"));
        }
        if self.checkpoint_path.is_dir() {
            return Err(ImgdlError::config(format!(
                "checkpoint path {} is a directory",
                self.checkpoint_path.display()
            )));
        }
        if self.output.is_dir() {
            return Err(ImgdlError::config(format!(
                "output path {} is a directory",
                self.output.display()
            )));
        }
        Ok(())
    }
}
