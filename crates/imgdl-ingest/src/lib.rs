//! imgdl Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Builds image datasets from Parquet files of (URL, caption, width, height)
//! rows: fetches every matching image, crops and re-encodes it, and writes
//! the results to a new Parquet file. Runs are resumable per input file.
//!
//! # Components
//!
//! - **source**: streams filtered records out of input files
//! - **gate** / **job**: admission-controlled job dispatch
//! - **fetch** / **transform** / **worker**: the per-image work
//! - **sink** / **writer** / **checkpoint**: ordered, crash-safe output
//! - **pipeline**: wires one run together
//!
//! # Example
//!
//! ```no_run
//! use imgdl_ingest::config::IngestConfig;
//! use imgdl_ingest::pipeline::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig {
//!         inputs: vec!["part-00000.parquet".into()],
//!         keywords: vec!["cat".to_string()],
//!         ..IngestConfig::default()
//!     };
//!     let summary = Pipeline::new(config)?.run().await?;
//!     summary.log();
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod fetch;
pub mod gate;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod progress;
pub mod sink;
pub mod source;
pub mod transform;
pub mod worker;
pub mod writer;

pub use config::IngestConfig;
pub use metrics::RunSummary;
pub use pipeline::Pipeline;
