pub mod config;
pub mod constants;
pub mod error;
pub mod processor;
pub mod progress;
pub mod record;
pub mod chunk;
pub mod merger;
pub mod resources;
pub mod job;


pub use config::ExternalSortConfig;
pub use error::{SortError, SortResult};
pub use processor::ExternalSortProcessor;
pub use progress::{CancelFlag, ChannelProgress, NoProgress, ProgressSink};
pub use record::Line;
pub use job::DedupJob;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSortStats {
    pub total_lines: usize,
    pub unique_lines: usize,
    pub duplicates_removed: usize,
    pub runs_created: usize,
    pub merge_passes: usize,
    pub files_processed: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
    /// Largest amount of raw input held in memory as one chunk.
    pub peak_chunk_bytes: usize,
    pub split_time_ms: u64,
    pub merge_time_ms: u64,
    pub processing_time_ms: u64,
}

impl ExternalSortStats {
    /// Folds the stats of another job into these, as in-place runs over several files do.
    pub fn absorb(&mut self, other: &ExternalSortStats) {
        self.total_lines += other.total_lines;
        self.unique_lines += other.unique_lines;
        self.duplicates_removed += other.duplicates_removed;
        self.runs_created += other.runs_created;
        self.merge_passes += other.merge_passes;
        self.files_processed += other.files_processed;
        self.input_bytes += other.input_bytes;
        self.output_bytes += other.output_bytes;
        self.peak_chunk_bytes = self.peak_chunk_bytes.max(other.peak_chunk_bytes);
        self.split_time_ms += other.split_time_ms;
        self.merge_time_ms += other.merge_time_ms;
        self.processing_time_ms += other.processing_time_ms;
    }
}

/// How a job ended. Exactly one is produced per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    Cancelled,
    Failed(String),
}

impl JobOutcome {
    pub fn from_error(error: &SortError) -> Self {
        match error {
            SortError::Cancelled => JobOutcome::Cancelled,
            other => JobOutcome::Failed(other.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "Deduplication completed successfully"),
            JobOutcome::Cancelled => write!(f, "Deduplication cancelled by user"),
            JobOutcome::Failed(reason) => write!(f, "Deduplication failed: {}", reason),
        }
    }
}

/// Something went wrong on the side without affecting the outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobWarning {
    #[error("Could not delete source {}: {reason}", path.display())]
    SourceNotDeleted { path: PathBuf, reason: String },

    #[error("Could not remove temporary file {}: {reason}", path.display())]
    TempNotRemoved { path: PathBuf, reason: String },
}

impl JobWarning {
    pub(crate) fn temp_not_removed(path: &Path, error: &std::io::Error) -> Self {
        JobWarning::TempNotRemoved {
            path: path.to_path_buf(),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub outcome: JobOutcome,
    pub stats: ExternalSortStats,
    pub warnings: Vec<JobWarning>,
}

impl JobReport {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: JobOutcome::Failed(reason.into()),
            stats: ExternalSortStats::default(),
            warnings: Vec::new(),
        }
    }
}

/// Runs one deduplication job on the calling thread without progress reporting.
pub fn sort_and_deduplicate(
    input_files: &[PathBuf],
    output_file: &Path,
    config: ExternalSortConfig,
) -> JobReport {
    DedupJob::new(input_files.to_vec(), output_file, config).run(NoProgress)
}
