//! Input record sources
//!
//! A [`RecordReader`] turns one input file into a lazy stream of
//! [`SourceRecord`]s that already passed the [`SourceFilter`].

pub mod filter;
pub mod parquet;

pub use filter::{KeywordFilter, SourceFilter};
pub use self::parquet::ParquetReader;

use async_trait::async_trait;
use futures::stream::{BoxStream, TryStreamExt};
use imgdl_common::{Result, SourceRecord};
use std::path::Path;

/// Stream of filtered records from one input file
pub type RecordStream = BoxStream<'static, Result<SourceRecord>>;

#[async_trait]
pub trait RecordReader: Send + Sync {
    /// Open `path` and stream its matching records.
    ///
    /// Fails with `ImgdlError::InputOpen` when the file cannot be read; an
    /// error item mid-stream means the rest of the file is unreadable.
    async fn open(&self, path: &Path) -> Result<RecordStream>;

    /// Number of matching records in `path`
    async fn count(&self, path: &Path) -> Result<u64> {
        self.open(path)
            .await?
            .try_fold(0u64, |n, _| async move { Ok(n + 1) })
            .await
    }
}
