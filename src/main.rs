use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{error, info, warn, Level, LevelFilter};
use similar::TextDiff;
use srpatch::{apply_patch, is_markdown_path, sanitize_contents, ApplyReport};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

// --- Main Application Entry Point ---

fn main() {
    // 1. Parse command-line arguments using `clap`.
    let args = Args::parse();

    // 2. Call the main logic function.
    //    All complex logic and error handling is inside `run`.
    if let Err(e) = run(args) {
        // 3. If `run` returns an error, print a user-facing message and set
        //    the exit code. Using {:?} ensures the full error chain from
        //    `anyhow` is printed.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Contains the primary logic of the application.
fn run(args: Args) -> Result<()> {
    setup_logging(&args);

    // --- File Reading ---
    let response = fs::read_to_string(&args.response_file).with_context(|| {
        format!(
            "Failed to read response file '{}'",
            args.response_file.display()
        )
    })?;
    let original = fs::read_to_string(&args.target_file).with_context(|| {
        format!(
            "Failed to read target file '{}'",
            args.target_file.display()
        )
    })?;

    // --- Core Patching Logic ---
    let outcome = apply_patch(&original, &response, args.chunk_offset)
        .with_context(|| format!("Could not patch '{}'", args.target_file.display()))?;

    let markdown = is_markdown_path(&args.target_file);
    let new_content = sanitize_contents(&outcome.new_content, markdown);

    info!(
        "Applied {} hunk(s) to '{}'.",
        outcome.report.hunk_results.len(),
        args.target_file.display()
    );

    if args.dry_run {
        let diff = TextDiff::from_lines(original.as_str(), new_content.as_str())
            .unified_diff()
            .to_string();
        println!(
            "----- Proposed Changes for {} -----",
            args.target_file.display()
        );
        print!("{}", diff);
        println!("------------------------------------");
        info!("DRY RUN completed. No files were modified.");
    } else {
        fs::write(&args.target_file, &new_content).with_context(|| {
            format!("Failed to write target file '{}'", args.target_file.display())
        })?;
    }

    // --- Final Summary ---
    if !outcome.report.all_applied_cleanly() {
        error!(
            "--- FAILED to fully patch: {}",
            args.target_file.display()
        );
        log_failed_hunks(&outcome.report);
        warn!("Review the log for errors. The file may be in a partially patched state.");
        // Return an error to set a non-zero exit code.
        return Err(anyhow!(
            "Completed with {} failed hunk(s).",
            outcome.report.failures().len()
        ));
    }

    Ok(())
}

// --- Helper Functions ---

/// Logs the reasons why hunks failed to apply.
fn log_failed_hunks(report: &ApplyReport) {
    for failure in report.failures() {
        warn!("  - Hunk {} failed: {}", failure.hunk_index, failure.reason);
    }
}

/// Configures the global logger from the `-v` count.
fn setup_logging(args: &Args) {
    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace, // -vvv and higher
    };

    // Configure the log format with colors.
    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Apply model-generated search/replace blocks to a file with fuzzy line matching.",
    long_about = "Locates each <<<< / ==== / >>>> block in the response with a whitespace-tolerant\nsliding window over the target file, reconciles indentation, then writes the result."
)]
struct Args {
    /// Path to the file containing the model response with patch blocks.
    response_file: PathBuf,
    /// Path to the target file to patch.
    target_file: PathBuf,
    /// If set, show what would be done, but don't modify any files.
    #[arg(
        short = 'n',
        long,
        help = "Show a unified diff of the proposed change, but don't modify the file."
    )]
    dry_run: bool,
    /// Starting line of this content within the whole file, when the
    /// response was produced against a chunk of a larger file.
    #[arg(
        long,
        default_value_t = 0,
        help = "Starting line offset of this content within the whole file (chunked editing)."
    )]
    chunk_offset: usize,
    /// Increase logging verbosity. Can be used multiple times.
    /// -v for info, -vv for debug, -vvv for trace.
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        long_help = "Increase logging verbosity.\n-v for info, -vv for debug, -vvv for trace."
    )]
    verbose: u8,
}
