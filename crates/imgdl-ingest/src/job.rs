//! Fetch jobs and their outcomes
//!
//! [`JobSource`] adapts one input file's record stream into [`Job`]s, taking
//! an admission permit for each. The permit moves into the [`ResolvedJob`]
//! and is released when the sink drops it after folding.

use futures::StreamExt;
use imgdl_common::{ImgdlError, Record, SourceRecord};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::fetch::FetchFailure;
use crate::gate::{AdmissionGate, AdmissionPermit};
use crate::source::RecordStream;
use crate::transform::TransformError;

/// Identifier of an input file, as given on the command line
pub type FileId = Arc<str>;

pub fn file_id(path: &Path) -> FileId {
    Arc::from(path.to_string_lossy().as_ref())
}

/// One record to fetch, holding its admission unit
#[derive(Debug)]
pub struct Job {
    pub file: FileId,
    pub record: SourceRecord,
    permit: AdmissionPermit,
}

impl Job {
    pub fn new(file: FileId, record: SourceRecord, permit: AdmissionPermit) -> Self {
        Self {
            file,
            record,
            permit,
        }
    }

    /// Attach the outcome; the permit moves along with it
    pub fn resolve(self, outcome: JobOutcome) -> ResolvedJob {
        ResolvedJob {
            file: self.file,
            source: self.record,
            outcome,
            permit: self.permit,
        }
    }
}

/// What happened to a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(Record),
    Skipped(SkipReason),
}

/// A finished job on its way to the sink
#[derive(Debug)]
pub struct ResolvedJob {
    pub file: FileId,
    pub source: SourceRecord,
    pub outcome: JobOutcome,
    permit: AdmissionPermit,
}

impl ResolvedJob {
    /// Release the admission unit now
    pub fn release(self) -> (FileId, SourceRecord, JobOutcome) {
        drop(self.permit);
        (self.file, self.source, self.outcome)
    }
}

/// Why a job produced no record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Fetch,
    Disallowed,
    TooSmall,
    Undecodable,
    Encode,
    ExtensionNotAllowed,
    BelowSizeFloor,
}

impl SkipReason {
    pub const COUNT: usize = 7;

    pub const ALL: [SkipReason; Self::COUNT] = [
        Self::Fetch,
        Self::Disallowed,
        Self::TooSmall,
        Self::Undecodable,
        Self::Encode,
        Self::ExtensionNotAllowed,
        Self::BelowSizeFloor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Disallowed => "disallowed",
            Self::TooSmall => "too_small",
            Self::Undecodable => "undecodable",
            Self::Encode => "encode",
            Self::ExtensionNotAllowed => "extension_not_allowed",
            Self::BelowSizeFloor => "below_size_floor",
        }
    }

    /// Position in [`SkipReason::ALL`]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&FetchFailure> for SkipReason {
    fn from(failure: &FetchFailure) -> Self {
        match failure {
            FetchFailure::Disallowed => Self::Disallowed,
            _ => Self::Fetch,
        }
    }
}

impl From<&TransformError> for SkipReason {
    fn from(err: &TransformError) -> Self {
        match err {
            TransformError::Undecodable(_) => Self::Undecodable,
            TransformError::TooSmall { .. } => Self::TooSmall,
            TransformError::Encode(_) => Self::Encode,
        }
    }
}

/// Turns one file's record stream into admitted jobs
pub struct JobSource {
    file: FileId,
    records: RecordStream,
    gate: AdmissionGate,
    yielded: u64,
    error: Option<ImgdlError>,
    exhausted: bool,
}

impl JobSource {
    pub fn new(file: FileId, records: RecordStream, gate: AdmissionGate) -> Self {
        Self {
            file,
            records,
            gate,
            yielded: 0,
            error: None,
            exhausted: false,
        }
    }

    /// Next job, waiting for admission first.
    ///
    /// `None` once the stream ends, fails, or the gate is closed. A failed
    /// stream keeps its error for [`JobSource::take_error`].
    pub async fn next_job(&mut self) -> Option<Job> {
        if self.exhausted {
            return None;
        }

        let record = match self.records.next().await {
            Some(Ok(record)) => record,
            Some(Err(err)) => {
                warn!(file = %self.file, error = %err, "Input read failed mid-file");
                self.error = Some(err);
                self.exhausted = true;
                return None;
            },
            None => {
                self.exhausted = true;
                return None;
            },
        };

        let Some(permit) = self.gate.acquire().await else {
            self.exhausted = true;
            return None;
        };
        self.yielded += 1;
        Some(Job::new(self.file.clone(), record, permit))
    }

    /// Jobs handed out so far
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    pub fn take_error(&mut self) -> Option<ImgdlError> {
        self.error.take()
    }
}
