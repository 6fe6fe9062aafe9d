use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::external_sort::constants::*;
use crate::external_sort::error::{SortError, SortResult};

/// Cooperative stop request shared between a caller and the job worker.
///
/// Setting the flag never interrupts I/O already in flight; the worker notices it at its next
/// poll point (one chunk read or one heap pop at most).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> SortResult<()> {
        if self.is_cancelled() {
            Err(SortError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receives percentages in `[0, 100]`, never decreasing within one job.
pub trait ProgressSink: Send {
    fn report(&mut self, percent: u8);
}

impl<F> ProgressSink for F
where
    F: FnMut(u8) + Send,
{
    fn report(&mut self, percent: u8) {
        self(percent)
    }
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _percent: u8) {}
}

/// Forwards notifications to an async consumer. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelProgress(pub UnboundedSender<u8>);

impl ProgressSink for ChannelProgress {
    fn report(&mut self, percent: u8) {
        let _ = self.0.send(percent);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressPhase {
    Splitting,
    Merging,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub processed_bytes: u64,
    pub total_bytes: u64,
    pub phase: ProgressPhase,
    pub last_reported_percent: Option<u8>,
}

/// Turns byte counts from both phases into deduplicated, monotonic notifications.
///
/// Splitting maps onto `[0, 50]` and merging onto `[50, 99]`; 100 is only reported by
/// [`finish`](Self::finish) once the output has been committed. A window narrows all of that
/// into a slice of the overall range, which is how in-place jobs spread several files over
/// one progress stream.
pub struct ProgressTracker<'a> {
    sink: &'a mut dyn ProgressSink,
    phase: ProgressPhase,
    processed_bytes: u64,
    total_bytes: u64,
    last_reported: Option<u8>,
    window: (u8, u8),
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            sink,
            phase: ProgressPhase::Splitting,
            processed_bytes: 0,
            total_bytes: 0,
            last_reported: None,
            window: (0, PROGRESS_COMPLETE),
        }
    }

    /// Restricts the following phases to `[low, high]` of the overall range.
    pub fn set_window(&mut self, low: u8, high: u8) {
        let high = high.min(PROGRESS_COMPLETE);
        self.window = (low.min(high), high);
        self.phase = ProgressPhase::Splitting;
        self.processed_bytes = 0;
        self.total_bytes = 0;
    }

    pub fn begin_split(&mut self, total_bytes: u64) {
        self.phase = ProgressPhase::Splitting;
        self.processed_bytes = 0;
        self.total_bytes = total_bytes;
        self.emit(0);
    }

    pub fn advance_split(&mut self, raw_bytes: u64) {
        self.processed_bytes = self.processed_bytes.saturating_add(raw_bytes);
        let percent = if self.total_bytes == 0 {
            SPLIT_PHASE_CEILING
        } else {
            scaled(self.processed_bytes, self.total_bytes, SPLIT_PHASE_CEILING)
        };
        self.emit(percent.min(SPLIT_PHASE_CEILING));
    }

    pub fn begin_merge(&mut self, total_run_bytes: u64) {
        self.phase = ProgressPhase::Merging;
        self.processed_bytes = 0;
        self.total_bytes = total_run_bytes;
        self.emit(SPLIT_PHASE_CEILING);
    }

    pub fn advance_merge(&mut self, consumed_bytes: u64) {
        self.processed_bytes = self.processed_bytes.saturating_add(consumed_bytes);
        if self.total_bytes == 0 {
            return;
        }
        let span = PROGRESS_COMPLETE - SPLIT_PHASE_CEILING;
        let percent = SPLIT_PHASE_CEILING + scaled(self.processed_bytes, self.total_bytes, span);
        self.emit(percent.min(MERGE_PHASE_CEILING));
    }

    pub fn finish(&mut self) {
        self.phase = ProgressPhase::Done;
        self.emit(PROGRESS_COMPLETE);
    }

    pub fn last_reported(&self) -> Option<u8> {
        self.last_reported
    }

    pub fn state(&self) -> ProgressState {
        ProgressState {
            processed_bytes: self.processed_bytes,
            total_bytes: self.total_bytes,
            phase: self.phase,
            last_reported_percent: self.last_reported,
        }
    }

    fn emit(&mut self, phase_percent: u8) {
        let (low, high) = self.window;
        let span = u16::from(high - low);
        let percent = low + (u16::from(phase_percent.min(PROGRESS_COMPLETE)) * span / 100) as u8;

        if self.last_reported.map_or(true, |last| percent > last) {
            self.last_reported = Some(percent);
            self.sink.report(percent);
        }
    }
}

fn scaled(done: u64, total: u64, span: u8) -> u8 {
    let value = u128::from(done) * u128::from(span) / u128::from(total.max(1));
    value.min(u128::from(span)) as u8
}
