//! CLI entry point for `godl`.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use godl_core::{DownloadRequest, Downloader, Error, ErrorKind, ProgressUpdate};
use indicatif::{ProgressBar, ProgressStyle as IndicatifStyle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod cli;

use cli::{Args, ProgressStyle};

/// Process exit codes (spec §6): `0` success, `1` generic failure, `2` usage error.
const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args);
    debug!(?args, "CLI arguments parsed");

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, cancelling download");
            cancel_for_signal.cancel();
        }
    });

    std::process::exit(run(&args, cancel).await);
}

async fn run(args: &Args, cancel: CancellationToken) -> i32 {
    let request = match build_request(args) {
        Ok(request) => request,
        Err(message) => {
            eprintln!("ERROR: {message}");
            return EXIT_USAGE;
        }
    };

    if args.check_connectivity {
        preflight_connectivity(&request.url).await;
    }
    if args.check_space {
        debug!("--check-space is advisory; the sink already surfaces InsufficientSpace on write");
    }

    let downloader = Downloader::new();
    let stats = downloader.download(request, cancel).await;

    match stats {
        Ok(stats) if stats.success => {
            if !args.quiet {
                print_summary(&stats);
            }
            EXIT_SUCCESS
        }
        Ok(stats) => {
            let error = stats.error.unwrap_or_else(|| Error::unknown("download failed with no error recorded"));
            eprintln!("{}", error.display_for_user(args.verbose > 0));
            exit_code_for(&error)
        }
        Err(error) => {
            eprintln!("{}", error.display_for_user(args.verbose > 0));
            exit_code_for(&error)
        }
    }
}

/// Maps an engine error to a process exit code: usage-shaped errors (bad
/// input the user can fix without retrying) get `2`, everything else `1`.
fn exit_code_for(error: &Error) -> i32 {
    match error.kind() {
        ErrorKind::InvalidUrl | ErrorKind::InvalidPath | ErrorKind::ValidationError | ErrorKind::ConfigError => EXIT_USAGE,
        _ => EXIT_FAILURE,
    }
}

fn build_request(args: &Args) -> Result<DownloadRequest, String> {
    let chunk_size = args.parse_chunk_size()?;
    let max_rate = args.parse_max_rate()?;

    let mut request = DownloadRequest::new(args.url.clone());
    request.user_agent = args.user_agent.clone();
    request.destination = args.output.as_ref().map(std::path::PathBuf::from);
    request.timeout = Some(args.timeout);
    request.max_retries = args.max_retries;
    request.concurrency = args.effective_concurrency();
    request.chunk_size = chunk_size;
    request.overwrite = args.force;
    request.create_parent_dirs = args.create_dirs;
    request.resume = args.resume;
    request.max_rate_bytes_per_sec = max_rate;

    let request = if args.progress_bar_enabled() {
        attach_progress_ui(request, args)
    } else {
        request
    };

    request.normalize().map_err(|e| e.display_for_user(args.verbose > 0))
}

impl Args {
    fn progress_bar_enabled(&self) -> bool {
        !self.quiet
    }
}

/// Wires a progress callback matching `--progress-bar`: an indicatif bar for
/// `detailed`/`simple`, or newline-terminated JSON for `json` (spec §6 "JSON
/// progress line").
fn attach_progress_ui(request: DownloadRequest, args: &Args) -> DownloadRequest {
    let interactive = std::io::stderr().is_terminal() && std::env::var_os("CI").is_none();

    match args.progress_bar {
        ProgressStyle::Json => {
            let filename = request.resolved_destination().to_string_lossy().to_string();
            request.with_progress_callback(move |update: ProgressUpdate| {
                print_json_line(&filename, &update);
            })
        }
        _ if !interactive => request,
        ProgressStyle::Detailed | ProgressStyle::Simple => {
            let bar = build_progress_bar(args.progress_bar, args.no_color);
            let total_set = Arc::new(AtomicU64::new(0));
            request.with_progress_callback(move |update: ProgressUpdate| {
                if update.total_size >= 0 && total_set.swap(1, Ordering::SeqCst) == 0 {
                    bar.set_length(update.total_size as u64);
                }
                bar.set_position(update.bytes_downloaded);
                if update.finished {
                    bar.finish_and_clear();
                }
            })
        }
    }
}

fn build_progress_bar(style: ProgressStyle, no_color: bool) -> ProgressBar {
    let bar = ProgressBar::new(0);
    let template = if no_color {
        "[{elapsed_precise}] {bar:40} {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})"
    } else if matches!(style, ProgressStyle::Simple) {
        "{spinner:.green} {bytes}/{total_bytes}"
    } else {
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})"
    };
    if let Ok(style) = IndicatifStyle::with_template(template) {
        bar.set_style(style);
    }
    bar
}

fn print_json_line(filename: &str, update: &ProgressUpdate) {
    let line = godl_core::progress::ProgressJsonLine {
        filename,
        total_size: update.total_size,
        bytes_downloaded: update.bytes_downloaded,
        speed: update.speed_bps,
        percentage: update.percentage().unwrap_or(0.0),
    };
    if let Ok(json) = serde_json::to_string(&line) {
        println!("{json}");
    }
}

fn print_summary(stats: &godl_core::DownloadStats) {
    let resumed = if stats.resumed { " (resumed)" } else { "" };
    println!(
        "Downloaded {} -> {}{} in {:.1}s ({:.1} KiB/s, {} {})",
        stats.url,
        stats.filename.display(),
        resumed,
        stats.duration.as_secs_f64(),
        stats.average_speed_bps / 1024.0,
        stats.retries,
        if stats.retries == 1 { "retry" } else { "retries" },
    );
}

/// Performs a best-effort HEAD request to confirm the host is reachable
/// before starting the real transfer (spec §6 `--check-connectivity`,
/// advisory-only and never fatal by itself).
async fn preflight_connectivity(url: &str) {
    let client = reqwest::Client::new();
    match client.head(url).send().await {
        Ok(_) => debug!(url, "connectivity check succeeded"),
        Err(e) => eprintln!("WARNING: connectivity check failed for {url}: {e}"),
    }
}

/// Initializes `tracing` (grounded in the teacher's `terminal::init_tracing`).
///
/// Log level priority: `RUST_LOG` env var > `--quiet` > `--verbose` count >
/// default `info`. Color is disabled by `--no-color`, `NO_COLOR`, or
/// `TERM=dumb` (spec §6 "Environment").
fn init_tracing(args: &Args) {
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let no_color = args.no_color || no_color_env_requested() || is_dumb_terminal();

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(!no_color)
        .with_env_filter(filter)
        .try_init();
}

fn no_color_env_requested() -> bool {
    std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty())
}

fn is_dumb_terminal() -> bool {
    std::env::var("TERM").map(|v| v.eq_ignore_ascii_case("dumb")).unwrap_or(false)
}
