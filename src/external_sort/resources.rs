use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir, TempPath};
use tracing::{debug, warn};

use crate::external_sort::chunk::SortedRun;
use crate::external_sort::constants::*;
use crate::external_sort::error::{SortError, SortResult};
use crate::external_sort::JobWarning;

/// Owns every temporary a job creates: the run files inside a private job directory and the
/// staging file the merge writes into.
///
/// A job ends with exactly one of [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping the manager without committing rolls back.
pub struct TempResources {
    /// Set when the temp root did not exist before this job; it is removed again if empty.
    created_root: Option<PathBuf>,
    job_dir: Option<TempDir>,
    runs: Vec<SortedRun>,
    staging: Option<TempPath>,
    next_run_id: usize,
}

impl TempResources {
    pub fn new(temp_root: &Path) -> SortResult<Self> {
        let created_root = if temp_root.is_dir() {
            None
        } else {
            fs::create_dir_all(temp_root).map_err(|e| SortError::write(temp_root, e))?;
            Some(temp_root.to_path_buf())
        };
        let job_dir = match Builder::new().prefix(JOB_DIR_PREFIX).tempdir_in(temp_root) {
            Ok(job_dir) => job_dir,
            Err(e) => {
                if let Some(root) = &created_root {
                    let _ = fs::remove_dir(root);
                }
                return Err(SortError::write(temp_root, e));
            }
        };
        debug!("job directory {}", job_dir.path().display());

        Ok(Self {
            created_root,
            job_dir: Some(job_dir),
            runs: Vec::new(),
            staging: None,
            next_run_id: 0,
        })
    }

    pub fn job_dir(&self) -> Option<&Path> {
        self.job_dir.as_ref().map(TempDir::path)
    }

    /// Reserves the path for the next run file. Nothing is tracked until the run is registered.
    pub fn next_run_path(&mut self) -> (usize, PathBuf) {
        let run_id = self.next_run_id;
        self.next_run_id += 1;
        let dir = self
            .job_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let path = dir.join(format!("{}{}{}", RUN_FILE_PREFIX, run_id, RUN_FILE_EXTENSION));
        (run_id, path)
    }

    pub fn register_run(&mut self, run: SortedRun) {
        self.runs.push(run);
    }

    pub fn runs(&self) -> &[SortedRun] {
        &self.runs
    }

    pub fn staging_path(&self) -> Option<&Path> {
        self.staging.as_deref()
    }

    /// Creates the hidden staging file the merge writes into.
    ///
    /// It lives next to `target` unless `staging_dir` says otherwise, so the final commit is
    /// normally a same-filesystem rename.
    pub fn create_staging(&mut self, target: &Path, staging_dir: Option<&Path>) -> SortResult<File> {
        let dir = match staging_dir {
            Some(dir) => dir.to_path_buf(),
            None => parent_dir(target),
        };
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());

        let staged = Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(STAGING_FILE_SUFFIX)
            .tempfile_in(&dir)
            .map_err(|e| SortError::write(&dir, e))?;
        let (file, path) = staged.into_parts();
        debug!("staging output at {}", path.display());
        self.staging = Some(path);
        Ok(file)
    }

    /// Deletes the run files once the merge no longer needs them.
    pub fn release_runs(&mut self) -> Vec<JobWarning> {
        self.retire_runs(self.runs.len())
    }

    /// Deletes the oldest `count` registered runs, typically after they were merged into
    /// newer ones.
    pub fn retire_runs(&mut self, count: usize) -> Vec<JobWarning> {
        let count = count.min(self.runs.len());
        let mut warnings = Vec::new();
        for run in self.runs.drain(..count) {
            if let Err(e) = remove_if_present(&run.file_path) {
                warnings.push(JobWarning::temp_not_removed(&run.file_path, &e));
            }
        }
        warnings
    }

    /// Moves the staging output over `target` and removes every other temporary.
    ///
    /// Tries a rename first and falls back to [`copy_into_place`] when the rename fails, for
    /// instance because the staging directory sits on another filesystem. Either way the
    /// target is replaced whole or not at all.
    pub fn commit(mut self, target: &Path) -> SortResult<Vec<JobWarning>> {
        let staging = self.staging.take().ok_or_else(|| {
            SortError::write(
                target,
                io::Error::new(io::ErrorKind::NotFound, "no staged output to commit"),
            )
        })?;

        if let Err(e) = adopt_permissions(&staging, target) {
            debug!("could not adjust permissions of {}: {}", staging.display(), e);
        }

        if let Err(rename_err) = staging.persist(target) {
            let staging = rename_err.path;
            debug!(
                "rename into {} failed ({}), copying instead",
                target.display(),
                rename_err.error
            );
            if let Err(e) = replace_by_copy(staging, target) {
                self.cleanup();
                return Err(SortError::write(target, e));
            }
        }

        Ok(self.cleanup())
    }

    /// Deletes every tracked temporary, including a partially written staging file.
    ///
    /// Files that are already gone are not an error, and calling this twice is harmless.
    pub fn rollback(&mut self) -> Vec<JobWarning> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Vec<JobWarning> {
        let mut warnings = self.release_runs();

        if let Some(staging) = self.staging.take() {
            let path = staging.to_path_buf();
            if let Err(e) = staging.close() {
                if e.kind() != io::ErrorKind::NotFound {
                    warnings.push(JobWarning::temp_not_removed(&path, &e));
                }
            }
        }

        if let Some(job_dir) = self.job_dir.take() {
            let path = job_dir.path().to_path_buf();
            if let Err(e) = job_dir.close() {
                if e.kind() != io::ErrorKind::NotFound {
                    warnings.push(JobWarning::temp_not_removed(&path, &e));
                }
            }
        }

        if let Some(root) = self.created_root.take() {
            // Fails while other jobs still use the root, which is fine.
            let _ = fs::remove_dir(&root);
        }

        for warning in &warnings {
            warn!("{}", warning);
        }
        warnings
    }
}

impl Drop for TempResources {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Rename fallback: copies `staging` over `target` and deletes it. `staging` is deleted on
/// failure too, since dropping a `TempPath` removes its file.
pub fn replace_by_copy(staging: TempPath, target: &Path) -> io::Result<()> {
    let source = File::open(&staging)?;
    copy_into_place(source, target)?;
    if let Err(e) = staging.close() {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("staged output left behind after copy: {}", e);
        }
    }
    Ok(())
}

/// Writes everything from `source` into a hidden sibling of `target`, then renames the
/// sibling over `target`.
///
/// The rename stays on the target's filesystem, so a failure at any point (including a full
/// disk halfway through the copy) leaves the old target as it was and removes the sibling.
pub fn copy_into_place<R: Read>(mut source: R, target: &Path) -> io::Result<()> {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let mut sibling = Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(STAGING_FILE_SUFFIX)
        .tempfile_in(parent_dir(target))?;

    io::copy(&mut source, sibling.as_file_mut())?;
    sibling.as_file_mut().flush()?;
    sibling.as_file().sync_all()?;
    if let Err(e) = adopt_permissions(sibling.path(), target) {
        debug!("could not adjust permissions of {}: {}", sibling.path().display(), e);
    }

    sibling.persist(target).map_err(|e| e.error)?;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Staging files are created owner-only; give the result the target's permissions instead.
fn adopt_permissions(staging: &Path, target: &Path) -> io::Result<()> {
    match fs::metadata(target) {
        Ok(meta) => fs::set_permissions(staging, meta.permissions()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => default_permissions(staging),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn default_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(NEW_OUTPUT_FILE_MODE))
}

#[cfg(not(unix))]
fn default_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Resolves `path` to an absolute, symlink-free form even when the file does not exist yet.
pub fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    if let Ok(resolved) = fs::canonicalize(path) {
        return Ok(resolved);
    }
    let parent = fs::canonicalize(parent_dir(path))?;
    match path.file_name() {
        Some(name) => Ok(parent.join(name)),
        None => Ok(parent),
    }
}

/// Checks a job's paths before any file is opened for writing.
///
/// Every input must exist and be a readable file, and `target` must not resolve to any of
/// them unless `replace_input` allows exactly that (in-place mode).
pub fn validate_job_paths(inputs: &[PathBuf], target: &Path, replace_input: bool) -> SortResult<()> {
    if inputs.is_empty() {
        return Err(SortError::NoInputs);
    }

    let resolved_target = resolve_path(target).map_err(|e| SortError::write(target, e))?;

    for input in inputs {
        let metadata = fs::metadata(input).map_err(|e| SortError::unreadable(input, e))?;
        if !metadata.is_file() {
            return Err(SortError::InputUnreadable {
                path: input.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }
        File::open(input).map_err(|e| SortError::unreadable(input, e))?;

        let resolved_input = fs::canonicalize(input).map_err(|e| SortError::unreadable(input, e))?;
        if resolved_input == resolved_target && !replace_input {
            return Err(SortError::TargetConflict {
                target: target.to_path_buf(),
                input: input.clone(),
            });
        }
    }

    if let Ok(meta) = fs::metadata(&resolved_target) {
        if meta.is_dir() {
            return Err(SortError::write(
                target,
                io::Error::new(io::ErrorKind::InvalidInput, "output path is a directory"),
            ));
        }
    }

    Ok(())
}
