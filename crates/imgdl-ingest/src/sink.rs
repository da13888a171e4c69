//! Result sink
//!
//! The single consumer of job outcomes. It applies the post-filters, feeds
//! the writer, and checkpoints an input file once every one of its jobs has
//! been folded and the writer has been flushed. Runs on a blocking thread
//! and is the only code touching the writer and the checkpoint log.

use imgdl_common::{ImgdlError, Record, Result, SourceRecord};
use indicatif::ProgressBar;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointLog;
use crate::config::IngestConfig;
use crate::job::{FileId, JobOutcome, ResolvedJob, SkipReason};
use crate::metrics::RunMetrics;
use crate::writer::ParquetRecordWriter;

/// Messages on the result channel
#[derive(Debug)]
pub enum SinkMessage {
    /// One resolved job, from a worker
    Outcome(ResolvedJob),
    /// The producer handed out all `jobs` of `file`
    FileDrained { file: FileId, jobs: u64 },
}

/// Filters applied to completed records before they are written
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    /// Lowercase; empty allows every extension
    allowed_extensions: HashSet<String>,
    min_byte_size: u64,
}

impl PostFilter {
    pub fn new<S: AsRef<str>>(allowed_extensions: &[S], min_byte_size: u64) -> Self {
        Self {
            allowed_extensions: allowed_extensions
                .iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            min_byte_size,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(&config.allowed_extensions, config.min_byte_size)
    }

    pub fn check(&self, source: &SourceRecord, record: &Record) -> std::result::Result<(), SkipReason> {
        if !self.allowed_extensions.is_empty() {
            let allowed = source
                .extension()
                .is_some_and(|ext| self.allowed_extensions.contains(&ext.to_lowercase()));
            if !allowed {
                return Err(SkipReason::ExtensionNotAllowed);
            }
        }
        if u64::from(record.byte_size) < self.min_byte_size {
            return Err(SkipReason::BelowSizeFloor);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FileProgress {
    folded: u64,
    expected: Option<u64>,
}

/// What the sink did over a run
#[derive(Debug, Default)]
pub struct SinkReport {
    /// Files checkpointed during this run, in completion order
    pub completed_files: Vec<String>,
    pub rows_written: u64,
}

pub struct Sink {
    writer: ParquetRecordWriter,
    checkpoint: CheckpointLog,
    filter: PostFilter,
    metrics: Arc<RunMetrics>,
    progress: ProgressBar,
    cancel: CancellationToken,
    files: HashMap<FileId, FileProgress>,
    completed: Vec<String>,
}

impl Sink {
    pub fn new(
        writer: ParquetRecordWriter,
        checkpoint: CheckpointLog,
        filter: PostFilter,
        metrics: Arc<RunMetrics>,
        progress: ProgressBar,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            writer,
            checkpoint,
            filter,
            metrics,
            progress,
            cancel,
            files: HashMap::new(),
            completed: Vec::new(),
        }
    }

    /// Fold messages until every sender is gone, then close the writer.
    ///
    /// On a fatal error the run is cancelled and the writer is still
    /// closed before returning. Must run on a blocking thread.
    pub fn run(mut self, mut messages: mpsc::Receiver<SinkMessage>) -> Result<SinkReport> {
        while let Some(message) = messages.blocking_recv() {
            if let Err(e) = self.handle(message) {
                error!(error = %e, "Sink failed, cancelling run");
                self.cancel.cancel();
                // Release every permit still queued before closing
                messages.close();
                while messages.blocking_recv().is_some() {}
                if let Err(close_err) = self.writer.close() {
                    error!(error = %close_err, "Failed to close output after sink failure");
                }
                return Err(e);
            }
        }

        self.writer.close()?;
        Ok(SinkReport {
            completed_files: self.completed,
            rows_written: self.writer.rows_written(),
        })
    }

    fn handle(&mut self, message: SinkMessage) -> Result<()> {
        match message {
            SinkMessage::Outcome(resolved) => self.fold(resolved),
            SinkMessage::FileDrained { file, jobs } => {
                self.files.entry(file.clone()).or_default().expected = Some(jobs);
                self.complete_if_done(&file)
            },
        }
    }

    fn fold(&mut self, resolved: ResolvedJob) -> Result<()> {
        let (file, source, outcome) = resolved.release();
        self.progress.inc(1);

        let outcome = match outcome {
            JobOutcome::Completed(record) => match self.filter.check(&source, &record) {
                Ok(()) => JobOutcome::Completed(record),
                Err(reason) => JobOutcome::Skipped(reason),
            },
            skipped => skipped,
        };

        match outcome {
            JobOutcome::Completed(record) => {
                self.writer.write(&record)?;
                self.metrics.record_written(u64::from(record.byte_size));
            },
            JobOutcome::Skipped(reason) => {
                debug!(url = %source.url, %reason, "Skipped");
                self.metrics.skipped(reason);
            },
        }

        self.files.entry(file.clone()).or_default().folded += 1;
        self.complete_if_done(&file)
    }

    fn complete_if_done(&mut self, file: &FileId) -> Result<()> {
        let done = self
            .files
            .get(file)
            .is_some_and(|p| p.expected.is_some_and(|expected| p.folded >= expected));
        if !done {
            return Ok(());
        }

        // Writes the row group only; the rows become readable once close()
        // writes the footer
        self.writer.flush()?;
        self.checkpoint.mark_done(file)?;
        self.files.remove(file);
        self.metrics.file_completed();
        self.completed.push(file.to_string());
        info!(file = %file, records = self.metrics.records_written(), "Input file complete");
        Ok(())
    }
}

/// Turn a panicked or cancelled sink task into a fatal error
pub fn join_error(err: tokio::task::JoinError) -> ImgdlError {
    ImgdlError::output_write(format!("sink task failed: {err}"))
}
