use anyhow::Result;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

use line_sift::external_sort::{sort_and_deduplicate, ChannelProgress, NoProgress};
use line_sift::{DedupJob, ExternalSortConfig, JobOutcome, JobWarning};

/// Helper function to create a test configuration with a private temp directory
fn create_test_config(temp_dir: &TempDir, chunk_byte_budget: usize) -> ExternalSortConfig {
    let mut config = ExternalSortConfig::default();
    config.temp_directory = temp_dir.path().join("temp");
    config.chunk_byte_budget = chunk_byte_budget;
    config
}

fn write_input(temp_dir: &TempDir, name: &str, content: &str) -> Result<PathBuf> {
    let path = temp_dir.path().join(name);
    fs::write(&path, content)?;
    Ok(path)
}

fn temp_entries(temp_dir: &TempDir) -> usize {
    let root = temp_dir.path().join("temp");
    fs::read_dir(root).map(|entries| entries.count()).unwrap_or(0)
}

fn staging_leftovers(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with('.') && name.ends_with(".tmp"))
        .collect()
}

#[test]
fn test_two_files_merge_into_sorted_unique_lines() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let a = write_input(&temp_dir, "a.txt", "a\nb\na\nc\n")?;
    let b = write_input(&temp_dir, "b.txt", "b\nd\n")?;
    let output = temp_dir.path().join("out.txt");

    let report = sort_and_deduplicate(&[a, b], &output, create_test_config(&temp_dir, 1024));

    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(fs::read_to_string(&output)?, "a\nb\nc\nd\n");
    assert_eq!(report.stats.total_lines, 6);
    assert_eq!(report.stats.unique_lines, 4);
    assert_eq!(report.stats.duplicates_removed, 2);
    assert_eq!(report.stats.files_processed, 2);
    assert_eq!(temp_entries(&temp_dir), 0);
    assert!(!temp_dir.path().join("temp").exists());
    assert!(staging_leftovers(temp_dir.path()).is_empty());
    Ok(())
}

#[test]
fn test_terminator_styles_are_normalized() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let windows = write_input(&temp_dir, "win.txt", "x\r\ny\r\n")?;
    let unix = write_input(&temp_dir, "unix.txt", "y\nx")?;
    let output = temp_dir.path().join("out.txt");

    let report = sort_and_deduplicate(&[windows, unix], &output, create_test_config(&temp_dir, 1024));

    assert!(report.outcome.is_success());
    assert_eq!(fs::read_to_string(&output)?, "x\ny\n");
    Ok(())
}

#[test]
fn test_output_is_idempotent() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = write_input(&temp_dir, "in.txt", "b\r\n\nb\na \na\r\r\nz\n\n")?;
    let first = temp_dir.path().join("first.txt");
    let second = temp_dir.path().join("second.txt");

    let report = sort_and_deduplicate(&[input], &first, create_test_config(&temp_dir, 3));
    assert!(report.outcome.is_success());
    let report = sort_and_deduplicate(&[first.clone()], &second, create_test_config(&temp_dir, 3));
    assert!(report.outcome.is_success());

    assert_eq!(fs::read(&first)?, fs::read(&second)?);
    assert_eq!(fs::read_to_string(&first)?, "\na\na \nb\nz\n");
    Ok(())
}

#[test]
fn test_complete_unique_and_deterministic_under_many_runs() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut expected = BTreeSet::new();
    let mut inputs = Vec::new();
    for file_index in 0..3 {
        let mut content = String::new();
        for i in 0..400 {
            let word = format!("word-{:03}", (i * 7 + file_index * 13) % 250);
            content.push_str(&word);
            content.push('\n');
            expected.insert(word);
        }
        inputs.push(write_input(&temp_dir, &format!("in{}.txt", file_index), &content)?);
    }

    let first = temp_dir.path().join("first.txt");
    let second = temp_dir.path().join("second.txt");
    let report = sort_and_deduplicate(&inputs, &first, create_test_config(&temp_dir, 64));
    assert!(report.outcome.is_success());
    assert!(report.stats.runs_created > 100);
    let again = sort_and_deduplicate(&inputs, &second, create_test_config(&temp_dir, 64));
    assert!(again.outcome.is_success());

    let text = fs::read_to_string(&first)?;
    let written: Vec<&str> = text.lines().collect();
    let unique: BTreeSet<&str> = written.iter().copied().collect();
    assert_eq!(written.len(), unique.len(), "output contains duplicates");
    assert_eq!(unique, expected.iter().map(String::as_str).collect::<BTreeSet<_>>());
    assert!(written.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(fs::read(&first)?, fs::read(&second)?);
    Ok(())
}

#[test]
fn test_budget_smaller_than_a_line_still_works() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = write_input(&temp_dir, "in.txt", "a-rather-long-line\nshort\na-rather-long-line\n")?;
    let output = temp_dir.path().join("out.txt");

    let report = sort_and_deduplicate(&[input], &output, create_test_config(&temp_dir, 1));

    assert!(report.outcome.is_success());
    assert_eq!(report.stats.runs_created, 3);
    assert_eq!(fs::read_to_string(&output)?, "a-rather-long-line\nshort\n");
    Ok(())
}

#[test]
fn test_memory_bound_on_input_much_larger_than_budget() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let budget = 4 * 1024;
    let mut content = String::new();
    let mut longest = 0;
    for i in 0..20_000 {
        let line = format!("record-{:05}-{}\n", (i * 7919) % 12_000, "x".repeat(i % 17));
        longest = longest.max(line.len());
        content.push_str(&line);
    }
    let input = write_input(&temp_dir, "big.txt", &content)?;
    let output = temp_dir.path().join("out.txt");

    let mut config = create_test_config(&temp_dir, budget);
    config.max_merge_fan_in = 16;
    let report = sort_and_deduplicate(&[input], &output, config);

    assert!(report.outcome.is_success());
    assert!(report.stats.input_bytes > 50 * budget as u64);
    assert!(report.stats.peak_chunk_bytes <= budget + longest);
    assert!(report.stats.merge_passes >= 1);
    assert_eq!(temp_entries(&temp_dir), 0);

    let text = fs::read_to_string(&output)?;
    let written: Vec<&str> = text.lines().collect();
    assert!(written.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(written.len(), report.stats.unique_lines);
    Ok(())
}

#[test]
fn test_target_equal_to_source_is_rejected_untouched() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = write_input(&temp_dir, "same.txt", "b\na\nb\n")?;

    let report = sort_and_deduplicate(&[input.clone()], &input, create_test_config(&temp_dir, 1024));

    match &report.outcome {
        JobOutcome::Failed(reason) => assert!(reason.contains("also an input"), "{}", reason),
        other => panic!("expected a failure, got {:?}", other),
    }
    assert_eq!(fs::read_to_string(&input)?, "b\na\nb\n");
    assert_eq!(temp_entries(&temp_dir), 0);
    Ok(())
}

#[test]
fn test_missing_input_fails_without_touching_target() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let output = write_input(&temp_dir, "out.txt", "previous\n")?;

    let report = sort_and_deduplicate(
        &[temp_dir.path().join("missing.txt")],
        &output,
        create_test_config(&temp_dir, 1024),
    );

    assert!(matches!(report.outcome, JobOutcome::Failed(_)));
    assert_eq!(fs::read_to_string(&output)?, "previous\n");
    Ok(())
}

#[test]
fn test_cancel_during_split_leaves_no_trace() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let content: String = (0..2000).map(|i| format!("line-{}\n", i % 500)).collect();
    let input = write_input(&temp_dir, "in.txt", &content)?;
    let output = write_input(&temp_dir, "out.txt", "previous\n")?;

    let job = DedupJob::new(vec![input], &output, create_test_config(&temp_dir, 256));
    let cancel = job.cancel_flag();
    let report = job.run(move |percent: u8| {
        if percent >= 10 {
            cancel.cancel();
        }
    });

    assert_eq!(report.outcome, JobOutcome::Cancelled);
    assert_eq!(fs::read_to_string(&output)?, "previous\n");
    assert_eq!(temp_entries(&temp_dir), 0);
    assert!(staging_leftovers(temp_dir.path()).is_empty());
    Ok(())
}

#[test]
fn test_cancel_during_merge_leaves_no_trace() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = write_input(&temp_dir, "in.txt", "c\nb\na\n")?;
    let output = write_input(&temp_dir, "out.txt", "previous\n")?;

    let job = DedupJob::new(vec![input], &output, create_test_config(&temp_dir, 2));
    let cancel = job.cancel_flag();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_worker = seen.clone();
    let report = job.run(move |percent: u8| {
        seen_by_worker.lock().unwrap().push(percent);
        // Past 50 the first merged line is already in the staging file.
        if percent > 50 {
            cancel.cancel();
        }
    });

    assert_eq!(report.outcome, JobOutcome::Cancelled);
    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|p| *p > 50));
    assert!(!seen.contains(&100));
    assert_eq!(fs::read_to_string(&output)?, "previous\n");
    assert_eq!(temp_entries(&temp_dir), 0);
    assert!(staging_leftovers(temp_dir.path()).is_empty());
    Ok(())
}

#[test]
fn test_progress_is_monotonic_and_ends_at_100() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let content: String = (0..300).map(|i| format!("{}\n", i % 97)).collect();
    let input = write_input(&temp_dir, "in.txt", &content)?;
    let output = temp_dir.path().join("out.txt");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_worker = seen.clone();
    let report = DedupJob::new(vec![input], &output, create_test_config(&temp_dir, 100))
        .run(move |percent: u8| seen_by_worker.lock().unwrap().push(percent));

    assert!(report.outcome.is_success());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.contains(&50));
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert!(seen.iter().all(|p| *p <= 100));
    Ok(())
}

#[test]
fn test_empty_inputs_produce_empty_output() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = write_input(&temp_dir, "empty.txt", "")?;
    let output = write_input(&temp_dir, "out.txt", "stale\n")?;

    let report = sort_and_deduplicate(&[input], &output, create_test_config(&temp_dir, 1024));

    assert!(report.outcome.is_success());
    assert_eq!(fs::read_to_string(&output)?, "");
    assert_eq!(report.stats.runs_created, 0);
    Ok(())
}

#[test]
fn test_delete_sources_after_success() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let a = write_input(&temp_dir, "a.txt", "1\n2\n")?;
    let b = write_input(&temp_dir, "b.txt", "2\n3\n")?;
    let output = temp_dir.path().join("out.txt");

    let mut config = create_test_config(&temp_dir, 1024);
    config.delete_sources = true;
    let report = sort_and_deduplicate(&[a.clone(), b.clone()], &output, config);

    assert!(report.outcome.is_success());
    assert!(report.warnings.is_empty());
    assert!(!a.exists());
    assert!(!b.exists());
    assert_eq!(fs::read_to_string(&output)?, "1\n2\n3\n");
    Ok(())
}

#[test]
fn test_source_that_cannot_be_deleted_is_only_a_warning() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let a = write_input(&temp_dir, "a.txt", "1\n")?;
    let output = temp_dir.path().join("out.txt");

    let mut config = create_test_config(&temp_dir, 1024);
    config.delete_sources = true;
    // Listing the same source twice means the second removal finds nothing to delete.
    let report = sort_and_deduplicate(&[a.clone(), a.clone()], &output, config);

    assert!(report.outcome.is_success());
    assert!(matches!(
        report.warnings.as_slice(),
        [JobWarning::SourceNotDeleted { .. }]
    ));
    assert_eq!(fs::read_to_string(&output)?, "1\n");
    Ok(())
}

#[test]
fn test_in_place_deduplicates_each_file_separately() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let a = write_input(&temp_dir, "a.txt", "b\na\nb\n")?;
    let b = write_input(&temp_dir, "b.txt", "a\r\nc\r\nc\n")?;

    let report = DedupJob::in_place(vec![a.clone(), b.clone()], create_test_config(&temp_dir, 2)).run(NoProgress);

    assert!(report.outcome.is_success());
    assert_eq!(fs::read_to_string(&a)?, "a\nb\n");
    assert_eq!(fs::read_to_string(&b)?, "a\nc\n");
    assert_eq!(report.stats.files_processed, 2);
    assert_eq!(report.stats.duplicates_removed, 2);
    assert_eq!(temp_entries(&temp_dir), 0);
    assert!(staging_leftovers(temp_dir.path()).is_empty());
    Ok(())
}

#[test]
fn test_in_place_cancel_keeps_finished_files() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let a = write_input(&temp_dir, "a.txt", "b\na\nb\n")?;
    let b = write_input(&temp_dir, "b.txt", "z\ny\nz\n")?;

    let job = DedupJob::in_place(vec![a.clone(), b.clone()], create_test_config(&temp_dir, 1024));
    let cancel = job.cancel_flag();
    let report = job.run(move |percent: u8| {
        if percent >= 50 {
            cancel.cancel();
        }
    });

    assert_eq!(report.outcome, JobOutcome::Cancelled);
    assert_eq!(fs::read_to_string(&a)?, "a\nb\n");
    assert_eq!(fs::read_to_string(&b)?, "z\ny\nz\n");
    assert_eq!(temp_entries(&temp_dir), 0);
    Ok(())
}

#[test]
fn test_sequential_jobs_do_not_share_cancellation() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = write_input(&temp_dir, "in.txt", "b\na\n")?;
    let output = temp_dir.path().join("out.txt");

    let first = DedupJob::new(vec![input.clone()], &output, create_test_config(&temp_dir, 1024));
    first.cancel_flag().cancel();
    assert_eq!(first.run(NoProgress).outcome, JobOutcome::Cancelled);
    assert!(!output.exists());

    let second = DedupJob::new(vec![input], &output, create_test_config(&temp_dir, 1024));
    assert!(second.run(NoProgress).outcome.is_success());
    assert_eq!(fs::read_to_string(&output)?, "a\nb\n");
    Ok(())
}

#[tokio::test]
async fn test_async_job_streams_progress_over_channel() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let a = write_input(&temp_dir, "a.txt", "q\nw\ne\nq\n")?;
    let b = write_input(&temp_dir, "b.txt", "e\nr\n")?;
    let output = temp_dir.path().join("out.txt");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let job = DedupJob::new(vec![a, b], &output, create_test_config(&temp_dir, 4));
    let worker = tokio::spawn(job.run_async(ChannelProgress(tx)));

    let mut seen = Vec::new();
    while let Some(percent) = rx.recv().await {
        seen.push(percent);
    }
    let report = worker.await?;

    assert!(report.outcome.is_success());
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(fs::read_to_string(&output)?, "e\nq\nr\nw\n");
    Ok(())
}

#[test]
fn test_invalid_config_is_reported_as_failure() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = write_input(&temp_dir, "in.txt", "a\n")?;
    let output = temp_dir.path().join("out.txt");

    let mut config = create_test_config(&temp_dir, 1024);
    config.memory_usage_percent = 0.0;
    let report = sort_and_deduplicate(&[input], &output, config);

    assert!(matches!(report.outcome, JobOutcome::Failed(_)));
    assert!(!output.exists());
    Ok(())
}

#[test]
fn test_missing_output_directory_fails_without_creating_it() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = write_input(&temp_dir, "in.txt", "a\n")?;
    let missing_dir = temp_dir.path().join("not-there");
    let output = missing_dir.join("out.txt");

    let report = sort_and_deduplicate(&[input], &output, create_test_config(&temp_dir, 1024));

    assert!(matches!(report.outcome, JobOutcome::Failed(_)));
    assert!(!missing_dir.exists());
    assert!(!temp_dir.path().join("temp").exists());
    Ok(())
}
