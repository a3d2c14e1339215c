//! Centralized progress reporting
//!
//! Bars for archive downloads and archive checks, plus a spinner for the
//! stretches spent waiting on the portal or the inbox.

use human_bytes::human_bytes;
use indicatif::{ProgressBar, ProgressStyle as IndicatifStyle};
use std::time::Duration;

/// Progress display style
#[derive(Debug, Clone, Copy)]
pub enum ProgressStyle {
    Download,
    Check,
    Wait,
}

/// Create a progress bar with the specified style
pub fn create_progress_bar(total: u64, style: ProgressStyle) -> ProgressBar {
    let bar = match style {
        ProgressStyle::Wait => ProgressBar::new_spinner(),
        _ => ProgressBar::new(total),
    };
    apply_style(&bar, style);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Progress bar for a download whose size may be unknown
pub fn download_bar(total: Option<u64>, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    match total {
        Some(total) => create_progress_bar(total, ProgressStyle::Download),
        None => create_progress_bar(0, ProgressStyle::Wait),
    }
}

/// Bar counting archives as they are checked
pub fn check_bar(total: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    create_progress_bar(total, ProgressStyle::Check)
}

fn template(template: &str, fallback: IndicatifStyle) -> IndicatifStyle {
    IndicatifStyle::with_template(template).unwrap_or(fallback)
}

/// Apply a style to an existing progress bar
pub fn apply_style(bar: &ProgressBar, style: ProgressStyle) {
    match style {
        ProgressStyle::Download => {
            bar.set_style(
                template(
                    "[{bar:40.cyan/blue}] {percent:>3}% {bytes:>10}/{total_bytes:<10} {bytes_per_sec:>12} ETA {eta:>5} {msg}",
                    IndicatifStyle::default_bar(),
                )
                .progress_chars("━━╸ ")
                .with_key("eta", |state: &indicatif::ProgressState, w: &mut dyn std::fmt::Write| {
                    let _ = write!(w, "{:>5.0}s", state.eta().as_secs_f64());
                })
                .with_key("bytes_per_sec", |state: &indicatif::ProgressState, w: &mut dyn std::fmt::Write| {
                    let bytes_per_sec = state.per_sec();
                    if bytes_per_sec > 1_048_576.0 {
                        let _ = write!(w, "{:>7.2} MiB/s", bytes_per_sec / 1_048_576.0);
                    } else if bytes_per_sec > 1024.0 {
                        let _ = write!(w, "{:>7.2} KiB/s", bytes_per_sec / 1024.0);
                    } else {
                        let _ = write!(w, "{:>7.0}  B/s", bytes_per_sec);
                    }
                })
            );
        }
        ProgressStyle::Check => {
            bar.set_style(
                template("[{bar:40.green}] {pos}/{len} {msg}", IndicatifStyle::default_bar())
                    .progress_chars("━━╸ "),
            );
        }
        ProgressStyle::Wait => {
            bar.set_style(template(
                "{spinner:.yellow} {elapsed:>4} {msg}",
                IndicatifStyle::default_spinner(),
            ));
        }
    }
}

/// One-line outcome of a download run
pub fn format_run_summary(verified: usize, total: usize, bytes_downloaded: u64, failed: usize) -> String {
    if failed == 0 {
        format!(
            "({}/{}) ✓ Verified, downloaded {}",
            verified,
            total,
            human_bytes(bytes_downloaded as f64)
        )
    } else {
        format!(
            "({}/{}) ⚠ Verified, downloaded {} ({} failed)",
            verified,
            total,
            human_bytes(bytes_downloaded as f64),
            failed
        )
    }
}
