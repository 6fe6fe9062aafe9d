use anyhow::Result;
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc;

use line_sift::constants::BYTES_PER_MB;
use line_sift::external_sort::ChannelProgress;
use line_sift::utils::{self, file_label, format_bytes, format_duration};
use line_sift::{DedupJob, ExternalSortConfig, JobOutcome};

const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "line-sift")]
#[command(about = "Line Sift - bounded-memory deduplication of huge line-oriented text files")]
#[command(version)]
struct Args {
    #[arg(required = true, help = "Input text files, merged in the given order")]
    inputs: Vec<PathBuf>,

    #[arg(
        short,
        long,
        required_unless_present = "in_place",
        conflicts_with = "in_place",
        help = "Output file for the deduplicated lines; its directory must already exist"
    )]
    output: Option<PathBuf>,

    #[arg(long, help = "Deduplicate every input into itself instead of merging")]
    in_place: bool,

    #[arg(short, long, help = "JSON configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Memory budget per sorted run, in MB")]
    chunk_size_mb: Option<usize>,

    #[arg(long, help = "Directory for temporary run files")]
    temp_dir: Option<PathBuf>,

    #[arg(long, help = "Delete the inputs after a successful merge")]
    delete_sources: bool,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ExternalSortConfig::from_file(path)?,
        None => ExternalSortConfig::default(),
    };
    if let Some(mb) = args.chunk_size_mb {
        config.chunk_byte_budget = mb.saturating_mul(BYTES_PER_MB);
    }
    if let Some(dir) = &args.temp_dir {
        config.temp_directory = dir.clone();
    }
    if args.delete_sources {
        config.delete_sources = true;
    }
    if args.verbose {
        config.verbose = true;
    }
    config.validate()?;

    utils::setup_logging(if config.verbose { "verbose" } else { "normal" })?;

    println!("🧹 Line Sift");
    for input in &args.inputs {
        println!("🔍 Input: {}", input.display());
    }
    println!("📊 Total input size: {}", format_bytes(utils::total_size(&args.inputs)));

    let job = match &args.output {
        Some(output) => {
            println!("📝 Output: {}", output.display());
            DedupJob::new(args.inputs.clone(), output, config)
        }
        None => {
            println!("📝 Deduplicating {} file(s) in place", args.inputs.len());
            DedupJob::in_place(args.inputs.clone(), config)
        }
    };

    let cancel = job.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n🛑 Cancel requested. Stopping at the next safe point...");
            cancel.cancel();
        }
    });

    let start_time = Instant::now();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(job.run_async(ChannelProgress(progress_tx)));

    while let Some(percent) = progress_rx.recv().await {
        print!("\r⏳ Progress: {:>3}%", percent);
        let _ = io::stdout().flush();
    }
    println!();

    let report = worker.await?;
    let total_time = start_time.elapsed();

    for warning in &report.warnings {
        eprintln!("⚠️ {}", warning);
    }

    match report.outcome {
        JobOutcome::Success => {
            let stats = &report.stats;
            println!("\n🎉 Deduplication completed successfully! 🎉");
            println!("=======================================");
            println!("📊 Total lines: {}", stats.total_lines);
            println!("✨ Unique lines: {}", stats.unique_lines);
            println!(
                "🗑️ Duplicates removed: {} ({:.2}%)",
                stats.duplicates_removed,
                100.0 * stats.duplicates_removed as f64 / stats.total_lines.max(1) as f64
            );
            println!("📁 Files processed: {}", stats.files_processed);
            println!("📦 Runs created: {}", stats.runs_created);
            println!("🧠 Largest chunk: {}", format_bytes(stats.peak_chunk_bytes as u64));
            println!("💿 Output size: {}", format_bytes(stats.output_bytes));
            println!("⏱️ Total time: {}", format_duration(total_time.as_secs_f64()));
            if let Some(output) = &args.output {
                println!("📝 Written to {}", file_label(output));
            }
            Ok(())
        }
        JobOutcome::Cancelled => {
            println!("🛑 Deduplication cancelled; unfinished output was discarded.");
            std::process::exit(EXIT_CANCELLED);
        }
        JobOutcome::Failed(reason) => Err(anyhow::anyhow!("Deduplication failed: {}", reason)),
    }
}
