use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can end a deduplication job early.
///
/// `Cancelled` is listed here so both phases can unwind with `?`, but it is mapped to its
/// own [`JobOutcome`](crate::external_sort::JobOutcome) variant and never shown as a failure.
#[derive(Error, Debug)]
pub enum SortError {
    #[error("No input files were given")]
    NoInputs,

    #[error("Input file not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    #[error("Cannot read input {}: {source}", path.display())]
    InputUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Output {} is also an input ({})", target.display(), input.display())]
    TargetConflict { target: PathBuf, input: PathBuf },

    #[error("Write to {} failed: {source}", path.display())]
    DiskWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read back temporary run {}: {source}", path.display())]
    TempReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Deduplication cancelled by user")]
    Cancelled,
}

impl SortError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SortError::Cancelled)
    }

    pub(crate) fn unreadable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            SortError::InputNotFound { path }
        } else {
            SortError::InputUnreadable { path, source }
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SortError::DiskWriteFailure {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn temp_read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SortError::TempReadFailure {
            path: path.into(),
            source,
        }
    }
}

pub type SortResult<T> = std::result::Result<T, SortError>;
