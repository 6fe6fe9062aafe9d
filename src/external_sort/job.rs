use std::path::{Path, PathBuf};
use tracing::error;

use crate::external_sort::processor::ExternalSortProcessor;
use crate::external_sort::progress::{CancelFlag, ProgressSink};
use crate::external_sort::{ExternalSortConfig, JobReport};

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobTarget {
    /// Merge every input into one output file.
    Output(PathBuf),
    /// Deduplicate each input into itself.
    InPlace,
}

/// One deduplication job together with its own cancel flag.
///
/// Each job gets a fresh flag, so cancelling one job can never leak into the next.
pub struct DedupJob {
    inputs: Vec<PathBuf>,
    target: JobTarget,
    config: ExternalSortConfig,
    cancel: CancelFlag,
}

impl DedupJob {
    pub fn new(inputs: Vec<PathBuf>, output: impl AsRef<Path>, config: ExternalSortConfig) -> Self {
        Self {
            inputs,
            target: JobTarget::Output(output.as_ref().to_path_buf()),
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn in_place(sources: Vec<PathBuf>, config: ExternalSortConfig) -> Self {
        Self {
            inputs: sources,
            target: JobTarget::InPlace,
            config,
            cancel: CancelFlag::new(),
        }
    }

    /// A handle the caller can use from any thread to stop the job.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Runs the job to completion on the calling thread.
    pub fn run<S: ProgressSink>(self, mut sink: S) -> JobReport {
        let processor = match ExternalSortProcessor::new(self.config) {
            Ok(processor) => processor,
            Err(e) => return JobReport::failed(format!("Invalid configuration: {}", e)),
        };

        match &self.target {
            JobTarget::Output(output) => processor.process(&self.inputs, output, &self.cancel, &mut sink),
            JobTarget::InPlace => processor.process_in_place(&self.inputs, &self.cancel, &mut sink),
        }
    }

    /// Runs the job on tokio's blocking pool so the async side stays free to forward
    /// progress and cancel requests.
    pub async fn run_async<S: ProgressSink + 'static>(self, sink: S) -> JobReport {
        match tokio::task::spawn_blocking(move || self.run(sink)).await {
            Ok(report) => report,
            Err(e) => {
                error!("Deduplication worker stopped abnormally: {}", e);
                JobReport::failed(format!("worker stopped abnormally: {}", e))
            }
        }
    }
}
