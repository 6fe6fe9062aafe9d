// External sort-merge deduplication engine
pub mod external_sort;

// Constants shared by the engine and the CLI
pub mod constants;

// Logging setup and formatting helpers
pub mod utils;

// Re-export main types for convenience
pub use external_sort::{
    CancelFlag, DedupJob, ExternalSortConfig, ExternalSortProcessor, ExternalSortStats, JobOutcome,
    JobReport, JobWarning, SortError,
};
