use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::constants::BYTES_PER_MB;
use crate::external_sort::chunk::RunGenerator;
use crate::external_sort::error::{SortError, SortResult};
use crate::external_sort::merger::RunMerger;
use crate::external_sort::progress::{CancelFlag, ProgressSink, ProgressTracker};
use crate::external_sort::resources::{validate_job_paths, TempResources};
use crate::external_sort::{ExternalSortConfig, ExternalSortStats, JobOutcome, JobReport, JobWarning};

/// Drives the two phases of a job and decides between commit and rollback.
pub struct ExternalSortProcessor {
    config: ExternalSortConfig,
}

impl ExternalSortProcessor {
    pub fn new(config: ExternalSortConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Deduplicates `input_files` into `output_file`.
    ///
    /// The output is replaced only on success. With `delete_sources` set, the inputs are
    /// removed afterwards; failing to remove one is a warning, not a failure.
    pub fn process(
        &self,
        input_files: &[PathBuf],
        output_file: &Path,
        cancel: &CancelFlag,
        sink: &mut dyn ProgressSink,
    ) -> JobReport {
        let mut progress = ProgressTracker::new(sink);
        let mut warnings = Vec::new();

        info!(
            "Starting deduplication of {} file(s) into {}",
            input_files.len(),
            output_file.display()
        );
        let result = self.run_job(input_files, output_file, false, cancel, &mut progress, &mut warnings);

        if result.is_ok() && self.config.delete_sources {
            warnings.extend(delete_sources(input_files));
        }

        finish_report(result, warnings)
    }

    /// Deduplicates every source into itself, one file after another.
    ///
    /// Each file goes through its own staging file. A cancel or failure stops at the current
    /// file; files finished before it keep their deduplicated contents.
    pub fn process_in_place(
        &self,
        sources: &[PathBuf],
        cancel: &CancelFlag,
        sink: &mut dyn ProgressSink,
    ) -> JobReport {
        if sources.is_empty() {
            return finish_report(Err(SortError::NoInputs), Vec::new());
        }

        let mut progress = ProgressTracker::new(sink);
        let mut warnings = Vec::new();
        let mut stats = ExternalSortStats::default();
        let count = sources.len();

        info!("Starting in-place deduplication of {} file(s)", count);
        for (index, source) in sources.iter().enumerate() {
            let low = (index * 100 / count) as u8;
            let high = ((index + 1) * 100 / count) as u8;
            progress.set_window(low, high);

            let result = self.run_job(
                std::slice::from_ref(source),
                source,
                true,
                cancel,
                &mut progress,
                &mut warnings,
            );
            match result {
                Ok(file_stats) => stats.absorb(&file_stats),
                Err(e) => {
                    let mut report = finish_report(Err(e), warnings);
                    report.stats = stats;
                    return report;
                }
            }
        }

        finish_report(Ok(stats), warnings)
    }

    fn run_job(
        &self,
        inputs: &[PathBuf],
        target: &Path,
        replace_input: bool,
        cancel: &CancelFlag,
        progress: &mut ProgressTracker<'_>,
        warnings: &mut Vec<JobWarning>,
    ) -> SortResult<ExternalSortStats> {
        let started = Instant::now();

        if !self.config.deduplicate {
            return Err(SortError::InvalidConfig(
                "deduplication is disabled; plain concatenation is not handled here".to_string(),
            ));
        }
        validate_job_paths(inputs, target, replace_input)?;
        cancel.check()?;

        let mut resources = TempResources::new(&self.config.temp_directory)?;
        let outcome = self.split_and_merge(inputs, target, &mut resources, cancel, progress, warnings);

        let mut stats = match outcome.and_then(|stats| cancel.check().map(|_| stats)) {
            Ok(stats) => stats,
            Err(e) => {
                warnings.extend(resources.rollback());
                info!("Job stopped, temporaries removed: {}", e);
                return Err(e);
            }
        };

        warnings.extend(resources.commit(target)?);
        progress.finish();

        stats.processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            "Wrote {} unique line(s) to {} ({} duplicate(s) removed)",
            stats.unique_lines,
            target.display(),
            stats.duplicates_removed
        );
        Ok(stats)
    }

    fn split_and_merge(
        &self,
        inputs: &[PathBuf],
        target: &Path,
        resources: &mut TempResources,
        cancel: &CancelFlag,
        progress: &mut ProgressTracker<'_>,
        warnings: &mut Vec<JobWarning>,
    ) -> SortResult<ExternalSortStats> {
        let chunk_budget = self.config.effective_chunk_budget();
        let generator = RunGenerator::new(
            chunk_budget,
            self.config.io_buffer_size_bytes(),
            self.config.parallel_sort,
        );

        info!(
            "Splitting into runs with a {:.2} MB chunk budget",
            chunk_budget as f64 / BYTES_PER_MB as f64
        );
        let split_started = Instant::now();
        let split = generator.generate_runs(inputs, resources, cancel, progress)?;
        let split_time_ms = split_started.elapsed().as_millis() as u64;
        info!(
            "Split {} line(s) from {} file(s) into {} run(s)",
            split.lines_read, split.files_processed, split.runs_created
        );

        let merge_started = Instant::now();
        let merger = RunMerger::new(
            self.config.merge_buffer_size_bytes(),
            self.config.max_merge_fan_in,
            self.config.io_buffer_size_bytes(),
        );
        let merge_passes = merger.reduce_runs(resources, cancel, warnings)?;

        let mut staging = resources.create_staging(target, self.config.staging_directory.as_deref())?;
        let staging_path = resources
            .staging_path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| target.to_path_buf());
        let merge = merger.merge_runs(resources.runs(), &mut staging, &staging_path, cancel, progress)?;
        staging
            .sync_all()
            .map_err(|e| SortError::DiskWriteFailure { path: staging_path.clone(), source: e })?;
        drop(staging);
        warnings.extend(resources.release_runs());
        let merge_time_ms = merge_started.elapsed().as_millis() as u64;

        Ok(ExternalSortStats {
            total_lines: split.lines_read,
            unique_lines: merge.lines_written,
            duplicates_removed: split.lines_read - merge.lines_written,
            runs_created: split.runs_created,
            merge_passes,
            files_processed: split.files_processed,
            input_bytes: split.total_input_bytes,
            output_bytes: merge.output_bytes,
            peak_chunk_bytes: split.peak_chunk_bytes,
            split_time_ms,
            merge_time_ms,
            processing_time_ms: 0,
        })
    }
}

fn delete_sources(inputs: &[PathBuf]) -> Vec<JobWarning> {
    let mut warnings = Vec::new();
    for input in inputs {
        if let Err(e) = fs::remove_file(input) {
            let warning = JobWarning::SourceNotDeleted {
                path: input.clone(),
                reason: e.to_string(),
            };
            warn!("{}", warning);
            warnings.push(warning);
        }
    }
    warnings
}

fn finish_report(result: SortResult<ExternalSortStats>, warnings: Vec<JobWarning>) -> JobReport {
    match result {
        Ok(stats) => JobReport {
            outcome: JobOutcome::Success,
            stats,
            warnings,
        },
        Err(e) => JobReport {
            outcome: JobOutcome::from_error(&e),
            stats: ExternalSortStats::default(),
            warnings,
        },
    }
}
