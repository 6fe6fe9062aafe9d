use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::external_sort::constants::CANCEL_POLL_INTERVAL_RECORDS;
use crate::external_sort::error::{SortError, SortResult};
use crate::external_sort::progress::{CancelFlag, ProgressTracker};
use crate::external_sort::record::{read_record, Line};
use crate::external_sort::resources::TempResources;

/// A closed, sorted, locally deduplicated run file.
#[derive(Debug, Clone)]
pub struct SortedRun {
    pub run_id: usize,
    pub file_path: PathBuf,
    pub line_count: usize,
    pub file_size_bytes: u64,
}

#[derive(Debug, Default, Clone)]
pub struct SplitSummary {
    pub total_input_bytes: u64,
    pub lines_read: usize,
    pub lines_spilled: usize,
    pub runs_created: usize,
    pub files_processed: usize,
    pub peak_chunk_bytes: usize,
}

/// First phase: cuts the inputs into budget-sized chunks and spills each one as a run.
pub struct RunGenerator {
    chunk_byte_budget: usize,
    io_buffer_size: usize,
    parallel_sort: bool,
}

impl RunGenerator {
    pub fn new(chunk_byte_budget: usize, io_buffer_size: usize, parallel_sort: bool) -> Self {
        Self {
            chunk_byte_budget: chunk_byte_budget.max(1),
            io_buffer_size,
            parallel_sort,
        }
    }

    /// Spills every input, in order, into runs registered with `resources`.
    ///
    /// On error or cancellation the runs spilled so far stay registered; deleting them is the
    /// caller's rollback.
    pub fn generate_runs(
        &self,
        inputs: &[PathBuf],
        resources: &mut TempResources,
        cancel: &CancelFlag,
        progress: &mut ProgressTracker<'_>,
    ) -> SortResult<SplitSummary> {
        let mut summary = SplitSummary::default();
        for path in inputs {
            let metadata = fs::metadata(path).map_err(|e| SortError::unreadable(path, e))?;
            summary.total_input_bytes += metadata.len();
        }
        progress.begin_split(summary.total_input_bytes);

        for path in inputs {
            cancel.check()?;
            self.split_file(path, resources, cancel, progress, &mut summary)?;
            summary.files_processed += 1;
        }

        Ok(summary)
    }

    fn split_file(
        &self,
        path: &Path,
        resources: &mut TempResources,
        cancel: &CancelFlag,
        progress: &mut ProgressTracker<'_>,
        summary: &mut SplitSummary,
    ) -> SortResult<()> {
        let file = File::open(path).map_err(|e| SortError::unreadable(path, e))?;
        let mut reader = BufReader::with_capacity(self.io_buffer_size, file);
        let mut record = Vec::new();

        loop {
            cancel.check()?;

            let mut chunk: Vec<Line> = Vec::new();
            let mut chunk_bytes = 0usize;
            while chunk_bytes < self.chunk_byte_budget {
                if chunk.len() % CANCEL_POLL_INTERVAL_RECORDS == CANCEL_POLL_INTERVAL_RECORDS - 1 {
                    cancel.check()?;
                }
                let read = read_record(&mut reader, &mut record)
                    .map_err(|e| SortError::unreadable(path, e))?;
                if read == 0 {
                    break;
                }
                chunk_bytes += read;
                chunk.push(Line::normalize(&record));
            }

            if chunk.is_empty() {
                return Ok(());
            }

            summary.lines_read += chunk.len();
            summary.peak_chunk_bytes = summary.peak_chunk_bytes.max(chunk_bytes);

            let run = self.sort_and_write_run(chunk, resources, cancel)?;
            debug!(
                run_id = run.run_id,
                lines = run.line_count,
                bytes = run.file_size_bytes,
                "spilled run from {}",
                path.display()
            );
            summary.lines_spilled += run.line_count;
            summary.runs_created += 1;
            resources.register_run(run);

            progress.advance_split(chunk_bytes as u64);
        }
    }

    /// Sorts one chunk and writes it out, skipping each line equal to the one before it.
    pub fn sort_and_write_run(
        &self,
        mut lines: Vec<Line>,
        resources: &mut TempResources,
        cancel: &CancelFlag,
    ) -> SortResult<SortedRun> {
        if self.parallel_sort {
            lines.par_sort_unstable();
        } else {
            lines.sort_unstable();
        }

        let (run_id, run_path) = resources.next_run_path();
        match self.write_run(&lines, &run_path, cancel) {
            Ok((line_count, file_size_bytes)) => Ok(SortedRun {
                run_id,
                file_path: run_path,
                line_count,
                file_size_bytes,
            }),
            Err(e) => {
                // Never registered, so nobody else knows about this file.
                let _ = fs::remove_file(&run_path);
                Err(e)
            }
        }
    }

    fn write_run(&self, lines: &[Line], run_path: &Path, cancel: &CancelFlag) -> SortResult<(usize, u64)> {
        let file = File::create(run_path).map_err(|e| SortError::write(run_path, e))?;
        let mut writer = BufWriter::with_capacity(self.io_buffer_size, file);

        let mut last: Option<&Line> = None;
        let mut line_count = 0;
        let mut file_size = 0u64;
        for line in lines {
            cancel.check()?;
            if last == Some(line) {
                continue;
            }
            line.write_to(&mut writer).map_err(|e| SortError::write(run_path, e))?;
            line_count += 1;
            file_size += line.serialized_len() as u64;
            last = Some(line);
        }

        let file = writer
            .into_inner()
            .map_err(|e| SortError::write(run_path, e.into_error()))?;
        drop(file);

        Ok((line_count, file_size))
    }
}
