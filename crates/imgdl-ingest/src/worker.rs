//! Worker pool
//!
//! A fixed number of tasks draw jobs from a shared queue and run
//! fetch -> transform -> name for each, emitting exactly one outcome per
//! job. Decoding and encoding run on the blocking pool.

use imgdl_common::Record;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fetch::{FetchOutcome, Fetcher};
use crate::job::{Job, JobOutcome, ResolvedJob, SkipReason};
use crate::sink::SinkMessage;
use crate::transform::{transform, TransformOptions};

/// Everything a worker needs, shared by the whole pool
#[derive(Debug)]
pub struct WorkerContext {
    pub fetcher: Fetcher,
    pub transform: TransformOptions,
    pub license_tag: String,
}

impl WorkerContext {
    pub fn new(fetcher: Fetcher, transform: TransformOptions, license_tag: impl Into<String>) -> Self {
        Self {
            fetcher,
            transform,
            license_tag: license_tag.into(),
        }
    }
}

/// Handles of the spawned worker tasks
pub struct WorkerPool {
    handles: Vec<JoinHandle<u64>>,
}

impl WorkerPool {
    /// Spawn `size` workers.
    ///
    /// Workers exit when the job queue is closed and empty, when the result
    /// channel is gone, or when `cancel` fires. A job already being processed
    /// is always finished.
    pub fn spawn(
        size: usize,
        jobs: async_channel::Receiver<Job>,
        results: mpsc::Sender<SinkMessage>,
        ctx: Arc<WorkerContext>,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..size.max(1))
            .map(|id| {
                let jobs = jobs.clone();
                let results = results.clone();
                let ctx = Arc::clone(&ctx);
                let cancel = cancel.clone();
                tokio::spawn(async move { run_worker(id, jobs, results, ctx, cancel).await })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker; returns the number of jobs processed
    pub async fn join(self) -> u64 {
        let mut processed = 0;
        for handle in self.handles {
            match handle.await {
                Ok(n) => processed += n,
                Err(e) => warn!(error = %e, "Worker task failed"),
            }
        }
        processed
    }
}

async fn run_worker(
    id: usize,
    jobs: async_channel::Receiver<Job>,
    results: mpsc::Sender<SinkMessage>,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
) -> u64 {
    let mut processed = 0;
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };

        let resolved = process(&ctx, job).await;
        processed += 1;
        if results.send(SinkMessage::Outcome(resolved)).await.is_err() {
            break;
        }
    }
    debug!(worker = id, processed, "Worker finished");
    processed
}

/// Run one job to its outcome
pub async fn process(ctx: &WorkerContext, job: Job) -> ResolvedJob {
    let bytes = match ctx.fetcher.fetch(&job.record.url).await {
        FetchOutcome::Success { bytes } => bytes,
        FetchOutcome::Failure(failure) => {
            debug!(url = %job.record.url, error = %failure, "Skipping: fetch failed");
            let reason = SkipReason::from(&failure);
            return job.resolve(JobOutcome::Skipped(reason));
        },
    };

    let options = ctx.transform;
    let transformed = tokio::task::spawn_blocking(move || transform(&bytes, &options)).await;

    let outcome = match transformed {
        Ok(Ok(image)) => JobOutcome::Completed(Record::new(&job.record, image, &ctx.license_tag)),
        Ok(Err(err)) => {
            debug!(url = %job.record.url, error = %err, "Skipping: transform failed");
            JobOutcome::Skipped(SkipReason::from(&err))
        },
        Err(join_err) => {
            // A panicking decoder is treated like undecodable input
            warn!(url = %job.record.url, error = %join_err, "Image transform panicked");
            JobOutcome::Skipped(SkipReason::Undecodable)
        },
    };
    job.resolve(outcome)
}
