//! Parquet record reader
//!
//! Reads only the four configured columns and evaluates the
//! [`SourceFilter`] as a row filter, so rows that fail it are never
//! materialized as records.

use arrow::array::{Array, AsArray, BooleanArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, UInt32Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use imgdl_common::{ImgdlError, Result, SourceRecord};
use parquet::arrow::arrow_reader::{ArrowPredicateFn, RowFilter};
use parquet::arrow::{ParquetRecordBatchStreamBuilder, ProjectionMask};
use parquet::schema::types::SchemaDescriptor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{RecordReader, RecordStream, SourceFilter};
use crate::config::ColumnNames;

/// Streams [`SourceRecord`]s out of Parquet files
#[derive(Debug, Clone)]
pub struct ParquetReader {
    columns: ColumnNames,
    filter: Arc<SourceFilter>,
    batch_size: usize,
}

impl ParquetReader {
    pub fn new(columns: ColumnNames, filter: SourceFilter, batch_size: usize) -> Self {
        Self {
            columns,
            filter: Arc::new(filter),
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl RecordReader for ParquetReader {
    async fn open(&self, path: &Path) -> Result<RecordStream> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ImgdlError::input_open(path, e))?;
        let builder = ParquetRecordBatchStreamBuilder::new(file)
            .await
            .map_err(|e| ImgdlError::input_open(path, e))?;

        let schema = builder.parquet_schema();
        let leaves = self
            .columns
            .all()
            .into_iter()
            .map(|name| {
                leaf_index(schema, name)
                    .ok_or_else(|| ImgdlError::input_open(path, format!("missing column '{name}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        let projection = ProjectionMask::leaves(schema, leaves);

        let predicate = {
            let columns = self.columns.clone();
            let filter = Arc::clone(&self.filter);
            ArrowPredicateFn::new(projection.clone(), move |batch| {
                filter_mask(&batch, &columns, &filter)
            })
        };

        debug!(
            path = %path.display(),
            rows = builder.metadata().file_metadata().num_rows(),
            "Opened input file"
        );

        let batches = builder
            .with_projection(projection)
            .with_row_filter(RowFilter::new(vec![Box::new(predicate)]))
            .with_batch_size(self.batch_size)
            .build()
            .map_err(|e| ImgdlError::input_open(path, e))?;

        let columns = self.columns.clone();
        let path: PathBuf = path.to_path_buf();
        let records = batches
            .map(move |batch| {
                match batch
                    .map_err(|e| ImgdlError::input_open(&path, e))
                    .and_then(|b| {
                        batch_records(&b, &columns).map_err(|e| ImgdlError::input_open(&path, e))
                    }) {
                    Ok(rows) => rows.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                }
            })
            .flat_map(stream::iter)
            .boxed();

        Ok(records)
    }
}

fn leaf_index(schema: &SchemaDescriptor, name: &str) -> Option<usize> {
    schema.columns().iter().position(|c| c.name() == name)
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> std::result::Result<&'a Arc<dyn Array>, ArrowError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("missing column '{name}'")))
}

/// Width or height column as `UInt32`; values that do not fit become null
fn dimension(batch: &RecordBatch, name: &str) -> std::result::Result<Arc<dyn Array>, ArrowError> {
    cast(column(batch, name)?, &DataType::UInt32)
}

fn text(batch: &RecordBatch, name: &str) -> std::result::Result<Arc<dyn Array>, ArrowError> {
    cast(column(batch, name)?, &DataType::Utf8)
}

/// Rows with a null dimension never match; a null caption reads as empty
fn filter_mask(
    batch: &RecordBatch,
    columns: &ColumnNames,
    filter: &SourceFilter,
) -> std::result::Result<BooleanArray, ArrowError> {
    let widths = dimension(batch, &columns.width)?;
    let heights = dimension(batch, &columns.height)?;
    let widths = widths.as_primitive::<UInt32Type>();
    let heights = heights.as_primitive::<UInt32Type>();
    let captions = if filter.uses_keywords() {
        Some(text(batch, &columns.caption)?)
    } else {
        None
    };
    let captions = captions.as_ref().map(|c| c.as_string::<i32>());

    Ok((0..batch.num_rows())
        .map(|i| {
            if widths.is_null(i) || heights.is_null(i) {
                return Some(false);
            }
            let caption = match captions {
                Some(c) if !c.is_null(i) => c.value(i),
                _ => "",
            };
            Some(filter.accepts(widths.value(i), heights.value(i), caption))
        })
        .collect())
}

/// Convert an already-filtered batch into records; rows without a URL are dropped
fn batch_records(
    batch: &RecordBatch,
    columns: &ColumnNames,
) -> std::result::Result<Vec<SourceRecord>, ArrowError> {
    let urls = text(batch, &columns.url)?;
    let captions = text(batch, &columns.caption)?;
    let widths = dimension(batch, &columns.width)?;
    let heights = dimension(batch, &columns.height)?;

    let urls = urls.as_string::<i32>();
    let captions = captions.as_string::<i32>();
    let widths = widths.as_primitive::<UInt32Type>();
    let heights = heights.as_primitive::<UInt32Type>();

    Ok((0..batch.num_rows())
        .filter(|&i| !urls.is_null(i) && !urls.value(i).is_empty())
        .map(|i| {
            let caption = if captions.is_null(i) { "" } else { captions.value(i) };
            SourceRecord::new(urls.value(i), caption, widths.value(i), heights.value(i))
        })
        .collect())
}
