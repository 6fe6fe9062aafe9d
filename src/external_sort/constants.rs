pub const DEFAULT_CHUNK_BYTE_BUDGET: usize = 64 * 1024 * 1024;
pub const DEFAULT_MEMORY_USAGE_PERCENT: f64 = 60.0;
pub const DEFAULT_IO_BUFFER_SIZE_KB: usize = 64;
pub const DEFAULT_MERGE_BUFFER_SIZE_KB: usize = 256;
pub const DEFAULT_MAX_MERGE_FAN_IN: usize = 256;

pub const MIN_CHUNK_BYTE_BUDGET: usize = 1;
pub const MAX_CHUNK_BYTE_BUDGET: usize = 4 * 1024 * 1024 * 1024;
pub const MIN_MEMORY_USAGE_PERCENT: f64 = 10.0;
pub const MAX_MEMORY_USAGE_PERCENT: f64 = 90.0;
pub const MIN_BUFFER_SIZE_KB: usize = 1;
pub const MAX_BUFFER_SIZE_KB: usize = 65536;
pub const MIN_MERGE_FAN_IN: usize = 2;

/// Floor for the read buffer handed to each run cursor during the merge.
pub const MIN_RUN_READ_BUFFER_BYTES: usize = 4 * 1024;
pub const MERGE_HEAP_INITIAL_CAPACITY: usize = 1024;

pub const TEMP_DIR_NAME: &str = "line_sift_temp";
pub const JOB_DIR_PREFIX: &str = "job_";
pub const RUN_FILE_PREFIX: &str = "run_";
pub const RUN_FILE_EXTENSION: &str = ".run";
pub const STAGING_FILE_SUFFIX: &str = ".tmp";

/// Cancellation is also polled every this many records while a chunk fills up.
pub const CANCEL_POLL_INTERVAL_RECORDS: usize = 4096;

pub const SPLIT_PHASE_CEILING: u8 = 50;
pub const MERGE_PHASE_CEILING: u8 = 99;
pub const PROGRESS_COMPLETE: u8 = 100;

#[cfg(unix)]
pub const NEW_OUTPUT_FILE_MODE: u32 = 0o644;
