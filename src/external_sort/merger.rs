use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::external_sort::chunk::SortedRun;
use crate::external_sort::constants::*;
use crate::external_sort::error::{SortError, SortResult};
use crate::external_sort::progress::{CancelFlag, ProgressTracker};
use crate::external_sort::record::{read_record, Line};
use crate::external_sort::resources::TempResources;
use crate::external_sort::JobWarning;

#[derive(Debug, Default, Clone)]
pub struct MergeSummary {
    pub lines_merged: usize,
    pub lines_written: usize,
    pub duplicates_removed: usize,
    pub output_bytes: u64,
}

/// Heap entry: the head line of one run. Ties on content are broken by run index, which
/// makes the pop order total and the merge deterministic.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct MergeEntry {
    line: Line,
    run_index: usize,
}

/// Read position inside one run file.
struct MergeCursor {
    reader: BufReader<File>,
    path: PathBuf,
    record: Vec<u8>,
}

impl MergeCursor {
    fn open(run: &SortedRun, buffer_size: usize) -> SortResult<Self> {
        let file = File::open(&run.file_path).map_err(|e| SortError::temp_read(&run.file_path, e))?;
        Ok(Self {
            reader: BufReader::with_capacity(buffer_size, file),
            path: run.file_path.clone(),
            record: Vec::new(),
        })
    }

    /// Next line of the run, or `None` once it is exhausted.
    fn advance(&mut self) -> SortResult<Option<Line>> {
        let read = read_record(&mut self.reader, &mut self.record)
            .map_err(|e| SortError::temp_read(&self.path, e))?;
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some(Line::from_serialized(&self.record)))
        }
    }
}

/// Second phase: k-way merge of every run into one globally deduplicated stream.
pub struct RunMerger {
    merge_buffer_size: usize,
    max_fan_in: usize,
    io_buffer_size: usize,
}

impl RunMerger {
    pub fn new(merge_buffer_size: usize, max_fan_in: usize, io_buffer_size: usize) -> Self {
        Self {
            merge_buffer_size,
            max_fan_in: max_fan_in.max(2),
            io_buffer_size,
        }
    }

    /// Merges `runs` into `output`, writing each distinct line once in byte order.
    ///
    /// Every run is sorted and the heap always yields the smallest head, so comparing with the
    /// last written line is enough to drop duplicates across runs and across input files.
    pub fn merge_runs<W: Write>(
        &self,
        runs: &[SortedRun],
        output: &mut W,
        output_path: &Path,
        cancel: &CancelFlag,
        progress: &mut ProgressTracker<'_>,
    ) -> SortResult<MergeSummary> {
        let total_run_bytes: u64 = runs.iter().map(|r| r.file_size_bytes).sum();
        progress.begin_merge(total_run_bytes);
        self.merge_into(runs, output, output_path, cancel, Some(progress))
    }

    /// Pre-merges groups of runs until at most `max_fan_in` remain, so the final merge never
    /// holds more files open than that. Returns the number of extra passes made; runs that
    /// could not be deleted afterwards end up in `warnings`.
    ///
    /// New runs are registered before the runs they replace are retired, so a failure at any
    /// point leaves every file tracked for rollback.
    pub fn reduce_runs(
        &self,
        resources: &mut TempResources,
        cancel: &CancelFlag,
        warnings: &mut Vec<JobWarning>,
    ) -> SortResult<usize> {
        let mut passes = 0;
        while resources.runs().len() > self.max_fan_in {
            let pending: Vec<SortedRun> = resources.runs().to_vec();
            for group in pending.chunks(self.max_fan_in) {
                cancel.check()?;
                let (run_id, run_path) = resources.next_run_path();
                let mut file = File::create(&run_path).map_err(|e| SortError::write(&run_path, e))?;
                let merged = self.merge_into(group, &mut file, &run_path, cancel, None);
                drop(file);
                let summary = match merged {
                    Ok(summary) => summary,
                    Err(e) => {
                        let _ = std::fs::remove_file(&run_path);
                        return Err(e);
                    }
                };
                resources.register_run(SortedRun {
                    run_id,
                    file_path: run_path,
                    line_count: summary.lines_written,
                    file_size_bytes: summary.output_bytes,
                });
            }
            warnings.extend(resources.retire_runs(pending.len()));
            passes += 1;
            debug!(pass = passes, runs = resources.runs().len(), "intermediate merge pass");
        }
        Ok(passes)
    }

    fn merge_into<W: Write>(
        &self,
        runs: &[SortedRun],
        output: &mut W,
        output_path: &Path,
        cancel: &CancelFlag,
        mut progress: Option<&mut ProgressTracker<'_>>,
    ) -> SortResult<MergeSummary> {
        let buffer_size = self.per_run_buffer_size(runs.len());
        let mut cursors = Vec::with_capacity(runs.len());
        let mut heap = BinaryHeap::with_capacity(runs.len().min(MERGE_HEAP_INITIAL_CAPACITY));
        for (run_index, run) in runs.iter().enumerate() {
            let mut cursor = MergeCursor::open(run, buffer_size)?;
            if let Some(line) = cursor.advance()? {
                heap.push(Reverse(MergeEntry { line, run_index }));
            }
            cursors.push(cursor);
        }

        let mut writer = BufWriter::with_capacity(self.io_buffer_size, output);
        let mut summary = MergeSummary::default();
        let mut last_written: Option<Line> = None;

        while let Some(Reverse(entry)) = heap.pop() {
            cancel.check()?;

            let MergeEntry { line, run_index } = entry;
            summary.lines_merged += 1;
            if let Some(progress) = progress.as_deref_mut() {
                progress.advance_merge(line.serialized_len() as u64);
            }

            if let Some(next) = cursors[run_index].advance()? {
                heap.push(Reverse(MergeEntry { line: next, run_index }));
            }

            if last_written.as_ref() == Some(&line) {
                summary.duplicates_removed += 1;
                continue;
            }
            line.write_to(&mut writer)
                .map_err(|e| SortError::write(output_path, e))?;
            summary.lines_written += 1;
            summary.output_bytes += line.serialized_len() as u64;
            last_written = Some(line);
        }

        writer.flush().map_err(|e| SortError::write(output_path, e))?;

        Ok(summary)
    }

    /// Splits the merge buffer budget across runs, never below a usable floor.
    pub fn per_run_buffer_size(&self, run_count: usize) -> usize {
        (self.merge_buffer_size / run_count.max(1)).max(MIN_RUN_READ_BUFFER_BYTES)
    }
}
