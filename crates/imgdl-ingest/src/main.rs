//! imgdl - build image datasets from Parquet URL lists

use anyhow::{Context, Result};
use clap::Parser;
use imgdl_common::logging::{init_logging, LogConfig, LogLevel};
use imgdl_ingest::config::{parse_keyword_list, IngestConfig};
use imgdl_ingest::pipeline::{self, Pipeline};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "imgdl")]
#[command(author, version, about = "Download, crop and store images listed in Parquet files")]
struct Cli {
    /// Input Parquet files
    #[arg(value_name = "PARQUET")]
    inputs: Vec<PathBuf>,

    /// YAML configuration file; flags override its values
    #[arg(short, long, env = "IMGDL_CONFIG")]
    config: Option<PathBuf>,

    /// Output Parquet file
    #[arg(short = 'O', long, env = "IMGDL_OUTPUT")]
    output: Option<PathBuf>,

    /// Number of concurrent downloads
    #[arg(short = 'N', long = "num-workers", env = "IMGDL_WORKERS")]
    workers: Option<usize>,

    /// Comma-separated caption keywords, all required
    #[arg(short = 'K', long, env = "IMGDL_KEYWORDS")]
    keywords: Option<String>,

    /// Minimum image width and height
    #[arg(long = "min-img-size", env = "IMGDL_MIN_IMG_SIZE")]
    min_size: Option<u32>,

    /// Edge length of stored images (defaults to the minimum size)
    #[arg(long, env = "IMGDL_TARGET_SIZE")]
    target_size: Option<u32>,

    #[arg(long, env = "IMGDL_JPEG_QUALITY")]
    jpeg_quality: Option<u8>,

    /// Comma-separated URL extensions to keep
    #[arg(long = "allow-ext", env = "IMGDL_ALLOW_EXT")]
    allowed_extensions: Option<String>,

    /// Drop encoded images smaller than this many bytes
    #[arg(long = "min-bytes", env = "IMGDL_MIN_BYTES")]
    min_byte_size: Option<u64>,

    /// Checkpoint log of processed input files
    #[arg(long, env = "IMGDL_CHECKPOINT")]
    checkpoint: Option<PathBuf>,

    /// Ignore and clear the checkpoint log
    #[arg(long, env = "IMGDL_NO_CONTINUE")]
    no_continue: bool,

    /// Delete the checkpoint log once every input file is done
    #[arg(long)]
    clear_checkpoint_on_success: bool,

    /// Count matching records without downloading
    #[arg(long)]
    dry_run: bool,

    #[arg(long, env = "IMGDL_URL_COLUMN")]
    url_column: Option<String>,

    #[arg(long, env = "IMGDL_CAPTION_COLUMN")]
    caption_column: Option<String>,

    #[arg(long, env = "IMGDL_WIDTH_COLUMN")]
    width_column: Option<String>,

    #[arg(long, env = "IMGDL_HEIGHT_COLUMN")]
    height_column: Option<String>,

    /// HTTP timeout per attempt, in seconds
    #[arg(long, env = "IMGDL_TIMEOUT")]
    timeout: Option<u64>,

    /// Extra attempts after a failed download
    #[arg(long, env = "IMGDL_RETRIES")]
    retries: Option<u32>,

    #[arg(long, env = "IMGDL_RETRY_DELAY_MS")]
    retry_delay_ms: Option<u64>,

    /// Comma-separated X-Robots-Tag directives that reject an image (e.g. noai)
    #[arg(long, env = "IMGDL_DISALLOW")]
    disallow: Option<String>,

    #[arg(long, env = "IMGDL_USER_AGENT")]
    user_agent: Option<String>,

    /// Largest accepted response body in bytes
    #[arg(long, env = "IMGDL_MAX_BODY_BYTES")]
    max_body_bytes: Option<u64>,

    /// Rows per output row group
    #[arg(long, env = "IMGDL_FLUSH_THRESHOLD")]
    flush_threshold: Option<usize>,

    /// Hide the progress spinner
    #[arg(long)]
    no_progress: bool,

    /// Write the run summary as JSON
    #[arg(long, value_name = "PATH")]
    summary_json: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Layer the flags over `config`
    fn apply(self, mut config: IngestConfig) -> IngestConfig {
        if !self.inputs.is_empty() {
            config.inputs = self.inputs;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(keywords) = self.keywords {
            config.keywords = parse_keyword_list(&keywords);
        }
        if let Some(min_size) = self.min_size {
            config.min_size = min_size;
        }
        if let Some(target_size) = self.target_size {
            config.target_size = Some(target_size);
        }
        if let Some(quality) = self.jpeg_quality {
            config.jpeg_quality = quality;
        }
        if let Some(extensions) = self.allowed_extensions {
            config.allowed_extensions = parse_keyword_list(&extensions);
        }
        if let Some(min_bytes) = self.min_byte_size {
            config.min_byte_size = min_bytes;
        }
        if let Some(checkpoint) = self.checkpoint {
            config.checkpoint_path = checkpoint;
        }
        config.no_continue |= self.no_continue;
        config.clear_checkpoint_on_success |= self.clear_checkpoint_on_success;
        config.dry_run |= self.dry_run;
        if let Some(column) = self.url_column {
            config.columns.url = column;
        }
        if let Some(column) = self.caption_column {
            config.columns.caption = column;
        }
        if let Some(column) = self.width_column {
            config.columns.width = column;
        }
        if let Some(column) = self.height_column {
            config.columns.height = column;
        }
        if let Some(timeout) = self.timeout {
            config.fetch.timeout_secs = timeout;
        }
        if let Some(retries) = self.retries {
            config.fetch.max_retries = retries;
        }
        if let Some(delay) = self.retry_delay_ms {
            config.fetch.retry_delay_ms = delay;
        }
        if let Some(directives) = self.disallow {
            config.fetch.disallowed_directives = parse_keyword_list(&directives);
        }
        if let Some(user_agent) = self.user_agent {
            config.fetch.user_agent = user_agent;
        }
        if let Some(max_body_bytes) = self.max_body_bytes {
            config.fetch.max_body_bytes = max_body_bytes;
        }
        if let Some(threshold) = self.flush_threshold {
            config.writer.flush_threshold = threshold;
        }
        if self.no_progress {
            config.progress = false;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("imgdl")
        .build();
    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _log_guard = init_logging(&log_config)?;

    let base = match &cli.config {
        Some(path) => IngestConfig::from_yaml_file(path)?,
        None => IngestConfig::default(),
    };
    let summary_json = cli.summary_json.clone();
    let config = cli.apply(base);

    let pipeline = Pipeline::new(config)?;
    let summary = pipeline::run_until(pipeline, pipeline::shutdown_signal()).await?;
    summary.log();

    if let Some(path) = summary_json {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!(path = %path.display(), "Wrote run summary");
    }

    if summary.interrupted {
        warn!("Run interrupted; unfinished input files stay pending");
    }
    Ok(())
}
