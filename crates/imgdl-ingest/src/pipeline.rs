//! Ingestion pipeline
//!
//! Wires one run together:
//!
//! ```text
//! inputs -> RecordReader -> JobSource --(gate)--> job queue -> WorkerPool
//!                                                                  |
//!   checkpoint log <- Sink (post-filter, writer) <- result channel <-+
//! ```
//!
//! The producer loop runs here; workers are tokio tasks; the sink runs on a
//! blocking thread.

use imgdl_common::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointLog;
use crate::config::IngestConfig;
use crate::fetch::Fetcher;
use crate::gate::AdmissionGate;
use crate::job::{file_id, JobSource};
use crate::metrics::{RunMetrics, RunSummary};
use crate::progress::create_spinner;
use crate::sink::{self, PostFilter, Sink, SinkMessage};
use crate::source::{ParquetReader, RecordReader, SourceFilter};
use crate::transform::TransformOptions;
use crate::worker::{WorkerContext, WorkerPool};
use crate::writer::{ParquetRecordWriter, WriterOptions};

/// One configured ingestion run
pub struct Pipeline {
    config: IngestConfig,
    reader: Arc<dyn RecordReader>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Validate `config` and read inputs with a [`ParquetReader`]
    pub fn new(config: IngestConfig) -> Result<Self> {
        config.validate()?;
        let reader = ParquetReader::new(
            config.columns.clone(),
            SourceFilter::from_config(&config)?,
            config.read_batch_size,
        );
        Self::with_reader(config, Arc::new(reader))
    }

    /// Use a custom record reader
    pub fn with_reader(config: IngestConfig, reader: Arc<dyn RecordReader>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            reader,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops dispatch when cancelled (e.g. on Ctrl-C)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<RunSummary> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let config = &self.config;

        let inputs = unique_inputs(&config.inputs);
        let checkpoint = CheckpointLog::new(&config.checkpoint_path);
        // A dry run never touches the log, but still ignores it under no_continue
        let (resuming, remaining) = if config.no_continue {
            if !config.dry_run {
                checkpoint.reset()?;
            }
            (false, inputs.clone())
        } else {
            (!checkpoint.load()?.is_empty(), checkpoint.remaining(&inputs)?)
        };
        let files_skipped = inputs.len() - remaining.len();
        if files_skipped > 0 {
            info!(files_skipped, "Skipping input files already in the checkpoint log");
        }

        let mut summary = RunSummary::new(run_id, inputs.len(), files_skipped, config.workers);
        let metrics = Arc::new(RunMetrics::new());

        if config.dry_run {
            summary.dry_run = true;
            self.count_matches(&remaining, &metrics).await;
            summary.interrupted = self.cancel.is_cancelled();
            summary.absorb(&metrics, started.elapsed());
            return Ok(summary);
        }

        if remaining.is_empty() {
            info!("Nothing to do: every input file is already processed");
            summary.absorb(&metrics, started.elapsed());
            return Ok(summary);
        }

        // Anything that can reject the config runs before the output is truncated
        let ctx = Arc::new(WorkerContext::new(
            Fetcher::new(&config.fetch)?,
            TransformOptions::from_config(config),
            config.license_tag.clone(),
        ));
        let writer_options = WriterOptions::for_run(config, run_id)?;

        let output = resolve_output_path(&config.output, resuming);
        if output != config.output {
            info!(output = %output.display(), "Resuming: writing to a new output file");
        }
        let writer = ParquetRecordWriter::create(&output, writer_options)?;
        summary.output = Some(output);

        info!(
            run_id = %run_id,
            files = remaining.len(),
            workers = config.workers,
            min_size = config.min_size,
            target_size = config.target_size(),
            keywords = ?config.keywords,
            "Starting ingestion"
        );

        let gate = AdmissionGate::new(config.workers);
        let progress = create_spinner("Downloading", config.progress);

        let (job_tx, job_rx) = async_channel::bounded(config.workers);
        let (result_tx, result_rx) = mpsc::channel(config.workers.saturating_mul(2).max(16));

        let sink = Sink::new(
            writer,
            checkpoint.clone(),
            PostFilter::from_config(config),
            Arc::clone(&metrics),
            progress.clone(),
            self.cancel.clone(),
        );
        let sink_handle = tokio::task::spawn_blocking(move || sink.run(result_rx));
        let pool = WorkerPool::spawn(config.workers, job_rx, result_tx.clone(), ctx, self.cancel.clone());

        self.produce(&remaining, &gate, &metrics, &job_tx, &result_tx).await;
        summary.interrupted = self.cancel.is_cancelled();

        // Closing the queue lets workers drain and exit; their senders go with them
        drop(job_tx);
        drop(result_tx);
        pool.join().await;
        let sink_result = sink_handle.await.map_err(sink::join_error)?;
        progress.finish_and_clear();

        summary.admission = gate.stats();
        summary.absorb(&metrics, started.elapsed());
        let report = sink_result?;

        if summary.all_files_completed() && config.clear_checkpoint_on_success {
            checkpoint.reset()?;
        }
        info!(
            files_completed = report.completed_files.len(),
            rows = report.rows_written,
            "Ingestion finished"
        );
        Ok(summary)
    }

    /// Feed every remaining file's jobs into the queue
    async fn produce(
        &self,
        remaining: &[PathBuf],
        gate: &AdmissionGate,
        metrics: &RunMetrics,
        jobs: &async_channel::Sender<crate::job::Job>,
        results: &mpsc::Sender<SinkMessage>,
    ) {
        'files: for path in remaining {
            if self.cancel.is_cancelled() {
                break;
            }
            let file = file_id(path);
            let records = match self.reader.open(path).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(file = %file, error = %e, "Skipping input file");
                    metrics.file_failed();
                    continue;
                },
            };
            info!(file = %file, "Processing input file");

            let mut source = JobSource::new(file.clone(), records, gate.clone());
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'files,
                    next = source.next_job() => next,
                };
                let Some(job) = next else { break };
                metrics.item_seen();
                if jobs.send(job).await.is_err() {
                    break 'files;
                }
            }

            if source.take_error().is_some() {
                // Rows read before the error are kept, but the file stays pending
                metrics.file_failed();
                continue;
            }
            let drained = SinkMessage::FileDrained {
                file,
                jobs: source.yielded(),
            };
            if results.send(drained).await.is_err() {
                break;
            }
        }
    }

    /// Count matching records per file without fetching anything
    async fn count_matches(&self, remaining: &[PathBuf], metrics: &RunMetrics) {
        for path in remaining {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.reader.count(path).await {
                Ok(n) => {
                    info!(file = %path.display(), matching = n, "Counted input file");
                    metrics.items_seen_add(n);
                    metrics.file_completed();
                },
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping input file");
                    metrics.file_failed();
                },
            }
        }
    }
}

/// Inputs in order, without repeats
fn unique_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    inputs
        .iter()
        .filter(|p| seen.insert(file_id(p)))
        .cloned()
        .collect()
}

/// Output path for this run.
///
/// A fresh run writes `output`. A resumed run never clobbers an existing
/// file: it takes the first free `<stem>-<n>.<ext>` sibling.
pub fn resolve_output_path(output: &Path, resuming: bool) -> PathBuf {
    if !resuming || !output.exists() {
        return output.to_path_buf();
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "images".to_string());
    let ext = output.extension().map(|e| e.to_string_lossy().into_owned());
    (1u32..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{stem}-{n}.{ext}"),
                None => format!("{stem}-{n}"),
            };
            output.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| output.to_path_buf())
}

/// Run a pipeline, cancelling it when `shutdown` resolves
pub async fn run_until<F>(pipeline: Pipeline, shutdown: F) -> Result<RunSummary>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let cancel = pipeline.cancellation_token();
    let watcher = tokio::spawn(async move {
        shutdown.await;
        warn!("Shutdown requested, finishing in-flight jobs");
        cancel.cancel();
    });
    let result = pipeline.run().await;
    watcher.abort();
    result
}

/// Resolves on the first Ctrl-C or SIGTERM.
///
/// A signal whose handler cannot be installed never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
