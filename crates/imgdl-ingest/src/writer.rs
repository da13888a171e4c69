//! Buffered columnar writer
//!
//! Rows accumulate in Arrow column builders and become one Parquet row
//! group every `flush_threshold` rows. The footer is written by
//! [`ParquetRecordWriter::close`], or by `Drop` on any other exit path.

use arrow::array::{ArrayRef, BinaryBuilder, StringBuilder, UInt16Builder, UInt32Builder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use imgdl_common::{ImgdlError, Record, Result};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::IngestConfig;

/// Value of `created_by` and `imgdl.generator`
pub const GENERATOR: &str = concat!("imgdl ", env!("CARGO_PKG_VERSION"));

/// File-level metadata key prefix
pub const METADATA_PREFIX: &str = "imgdl.";

/// Schema of the output dataset
pub fn output_schema() -> SchemaRef {
    let field = |name: &str, data_type: DataType, description: &str| {
        Field::new(name, data_type, false).with_metadata(HashMap::from([(
            "description".to_string(),
            description.to_string(),
        )]))
    };
    Arc::new(Schema::new(vec![
        field("content_hash", DataType::Utf8, "BLAKE2b-128 of image_bytes, lowercase hex"),
        field("byte_size", DataType::UInt32, "length of image_bytes"),
        field("width", DataType::UInt16, "stored image width in pixels"),
        field("height", DataType::UInt16, "stored image height in pixels"),
        field("original_width", DataType::UInt16, "decoded source width, saturated"),
        field("original_height", DataType::UInt16, "decoded source height, saturated"),
        field("source_url", DataType::Utf8, "percent-escaped source URL"),
        field("caption", DataType::Utf8, "source caption without double quotes"),
        field("image_bytes", DataType::Binary, "JPEG-encoded image"),
        field("license_tag", DataType::Utf8, "license of the source image"),
    ]))
}

/// How the writer lays out and labels the file
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub flush_threshold: usize,
    /// File key/value metadata, in insertion order
    pub metadata: Vec<(String, String)>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            flush_threshold: crate::config::DEFAULT_FLUSH_THRESHOLD,
            metadata: Vec::new(),
        }
    }
}

impl WriterOptions {
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            flush_threshold,
            ..Self::default()
        }
    }

    /// Add `imgdl.<key>` to the file metadata
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata
            .push((format!("{METADATA_PREFIX}{key}"), value.into()));
        self
    }

    /// Options for a run: threshold plus the run's provenance metadata
    pub fn for_run(config: &IngestConfig, run_id: Uuid) -> Result<Self> {
        Ok(Self::new(config.writer.flush_threshold)
            .with_metadata("keywords", serde_json::to_string(&config.keywords)?)
            .with_metadata("min_size", config.min_size.to_string())
            .with_metadata("target_size", config.target_size().to_string())
            .with_metadata("generator", GENERATOR)
            .with_metadata("run_id", run_id.to_string())
            .with_metadata("created_at", Utc::now().to_rfc3339()))
    }

    fn properties(&self) -> WriterProperties {
        let key_values = self
            .metadata
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect::<Vec<_>>();
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_created_by(GENERATOR.to_string())
            .set_key_value_metadata(Some(key_values))
            .build()
    }
}

/// Column builders for one pending row group
struct RowBuffer {
    content_hash: StringBuilder,
    byte_size: UInt32Builder,
    width: UInt16Builder,
    height: UInt16Builder,
    original_width: UInt16Builder,
    original_height: UInt16Builder,
    source_url: StringBuilder,
    caption: StringBuilder,
    image_bytes: BinaryBuilder,
    license_tag: StringBuilder,
    rows: usize,
}

impl RowBuffer {
    fn new() -> Self {
        Self {
            content_hash: StringBuilder::new(),
            byte_size: UInt32Builder::new(),
            width: UInt16Builder::new(),
            height: UInt16Builder::new(),
            original_width: UInt16Builder::new(),
            original_height: UInt16Builder::new(),
            source_url: StringBuilder::new(),
            caption: StringBuilder::new(),
            image_bytes: BinaryBuilder::new(),
            license_tag: StringBuilder::new(),
            rows: 0,
        }
    }

    fn push(&mut self, record: &Record) {
        self.content_hash.append_value(record.content_hash.as_str());
        self.byte_size.append_value(record.byte_size);
        self.width.append_value(record.width);
        self.height.append_value(record.height);
        self.original_width.append_value(record.original_width);
        self.original_height.append_value(record.original_height);
        self.source_url.append_value(&record.source_url);
        self.caption.append_value(&record.caption);
        self.image_bytes.append_value(&record.image_bytes);
        self.license_tag.append_value(&record.license_tag);
        self.rows += 1;
    }

    /// Drain the builders into a batch; the buffer is empty afterwards
    fn take_batch(&mut self, schema: &SchemaRef) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.content_hash.finish()),
            Arc::new(self.byte_size.finish()),
            Arc::new(self.width.finish()),
            Arc::new(self.height.finish()),
            Arc::new(self.original_width.finish()),
            Arc::new(self.original_height.finish()),
            Arc::new(self.source_url.finish()),
            Arc::new(self.caption.finish()),
            Arc::new(self.image_bytes.finish()),
            Arc::new(self.license_tag.finish()),
        ];
        self.rows = 0;
        RecordBatch::try_new(Arc::clone(schema), columns).map_err(ImgdlError::output_write)
    }
}

/// Writes [`Record`]s to a single Parquet file
pub struct ParquetRecordWriter {
    path: PathBuf,
    schema: SchemaRef,
    inner: Option<ArrowWriter<File>>,
    buffer: RowBuffer,
    flush_threshold: usize,
    rows_written: u64,
    row_groups: usize,
}

impl ParquetRecordWriter {
    /// Create (or truncate) `path` and prepare the writer
    pub fn create(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| {
            ImgdlError::output_write(format!("cannot create {}: {e}", path.display()))
        })?;
        let schema = output_schema();
        let inner = ArrowWriter::try_new(file, Arc::clone(&schema), Some(options.properties()))
            .map_err(ImgdlError::output_write)?;

        info!(path = %path.display(), flush_threshold = options.flush_threshold, "Opened output dataset");
        Ok(Self {
            path,
            schema,
            inner: Some(inner),
            buffer: RowBuffer::new(),
            flush_threshold: options.flush_threshold.max(1),
            rows_written: 0,
            row_groups: 0,
        })
    }

    /// Rows accepted by `write`, flushed or not
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn buffered_rows(&self) -> usize {
        self.buffer.rows
    }

    pub fn row_groups(&self) -> usize {
        self.row_groups
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Buffer one row, flushing when the threshold is reached
    pub fn write(&mut self, record: &Record) -> Result<()> {
        if self.inner.is_none() {
            return Err(ImgdlError::output_write("writer is closed"));
        }
        self.buffer.push(record);
        self.rows_written += 1;
        if self.buffer.rows >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Write buffered rows as one row group; no-op when empty
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.rows == 0 {
            return Ok(());
        }
        let Some(inner) = self.inner.as_mut() else {
            return Err(ImgdlError::output_write("writer is closed"));
        };
        let rows = self.buffer.rows;
        let batch = self.buffer.take_batch(&self.schema)?;
        inner.write(&batch).map_err(ImgdlError::output_write)?;
        inner.flush().map_err(ImgdlError::output_write)?;
        self.row_groups += 1;
        debug!(rows, row_groups = self.row_groups, "Flushed row group");
        Ok(())
    }

    /// Flush the remainder and write the footer. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.inner.is_none() {
            return Ok(());
        }
        let flushed = self.flush();
        // Take the writer even if the flush failed, so the footer is still attempted
        let Some(inner) = self.inner.take() else {
            return flushed;
        };
        let closed = inner.close().map_err(ImgdlError::output_write);
        flushed?;
        closed?;
        info!(
            path = %self.path.display(),
            rows = self.rows_written,
            row_groups = self.row_groups,
            "Closed output dataset"
        );
        Ok(())
    }
}

impl Drop for ParquetRecordWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(path = %self.path.display(), error = %e, "Failed to finalize output dataset");
        }
    }
}
