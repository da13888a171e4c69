//! Checkpoint log of fully processed input files
//!
//! One input path per line, appended and synced after each completed file.
//! Files listed here are skipped by later runs.

use imgdl_common::{ImgdlError, Result};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::job::file_id;

#[derive(Debug, Clone)]
pub struct CheckpointLog {
    path: PathBuf,
}

impl CheckpointLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifiers already recorded; empty when the log does not exist
    pub fn load(&self) -> Result<BTreeSet<String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => {
                return Err(ImgdlError::Checkpoint(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )))
            },
        };
        let done: BTreeSet<String> = raw
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(path = %self.path.display(), entries = done.len(), "Loaded checkpoint log");
        Ok(done)
    }

    /// Durably record `id` as fully processed
    pub fn mark_done(&self, id: &str) -> Result<()> {
        if id.contains(['\n', '\r']) {
            return Err(ImgdlError::Checkpoint(format!(
                "input identifier contains a line break: {id:?}"
            )));
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.error("open", e))?;
        writeln!(file, "{id}").map_err(|e| self.error("append to", e))?;
        file.sync_all().map_err(|e| self.error("sync", e))?;
        info!(file = id, "Checkpointed input file");
        Ok(())
    }

    /// Delete the log.
    ///
    /// A missing log is fine; anything at the path other than a regular
    /// file is a configuration error.
    pub fn reset(&self) -> Result<()> {
        match fs::symlink_metadata(&self.path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error("inspect", e)),
            Ok(meta) if !meta.is_file() => Err(ImgdlError::config(format!(
                "checkpoint path {} is not a regular file",
                self.path.display()
            ))),
            Ok(_) => {
                fs::remove_file(&self.path).map_err(|e| self.error("remove", e))?;
                info!(path = %self.path.display(), "Cleared checkpoint log");
                Ok(())
            },
        }
    }

    /// `inputs` not yet recorded, in their original order
    pub fn remaining(&self, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let done = self.load()?;
        Ok(inputs
            .iter()
            .filter(|p| !done.contains(file_id(p).as_ref()))
            .cloned()
            .collect())
    }

    fn error(&self, action: &str, err: std::io::Error) -> ImgdlError {
        ImgdlError::Checkpoint(format!("cannot {action} {}: {err}", self.path.display()))
    }
}
