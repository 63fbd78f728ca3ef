//! CLI command implementations

use crate::output::{format_bytes, print_output, TaskReport};
use crate::progress::TaskProgress;
use crate::OutputFormat;
use anyhow::{Context, Result};
use console::style;
use dlc_core::{Downloader, Range, TaskHandle};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use url::Url;

/// How often the progress bar is refreshed
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Download Commands
// ============================================================================

/// Run a full or resumed download. Returns true if it succeeded.
pub fn download(
    downloader: &Downloader,
    url: &str,
    dest: Option<PathBuf>,
    range: Range,
    resume: bool,
    format: OutputFormat,
) -> Result<bool> {
    let dest = match dest {
        Some(dest) => dest,
        None => default_destination(url),
    };

    let task = if resume {
        downloader.resume_task(url, &dest, range)
    } else {
        downloader.start_task(url, &dest, range)
    }
    .with_context(|| format!("Failed to start download of {}", url))?;

    let label = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| dest.display().to_string());
    let progress = TaskProgress::new(&label, format == OutputFormat::Human);
    watch(downloader, &task, &progress);

    let report = TaskReport {
        info: downloader.task_info(&task),
        status: downloader.task_status(&task),
    };
    let succeeded = report.status.is_success();
    if format == OutputFormat::Human {
        print_headline(succeeded, &dest);
    }
    print_output(&report, format)?;
    downloader.remove_task(&task);

    Ok(succeeded)
}

/// Ask for the content length of `url`. Returns true if the server answered.
pub fn content_size(downloader: &Downloader, url: &str, format: OutputFormat) -> Result<bool> {
    let task = downloader
        .start_get_content_size(url)
        .with_context(|| format!("Failed to probe {}", url))?;
    downloader.wait_task(&task);
    let status = downloader.task_status(&task);

    match format {
        OutputFormat::Json => {
            let report = TaskReport {
                info: downloader.task_info(&task),
                status: status.clone(),
            };
            print_output(&report, format)?;
        }
        OutputFormat::Human => {
            if status.is_success() {
                println!(
                    "{} {} ({} bytes)",
                    style(url).cyan(),
                    format_bytes(status.size_total),
                    status.size_total
                );
            } else {
                println!(
                    "{} {}: {}",
                    style("✗").red().bold(),
                    url,
                    status.error.message
                );
            }
        }
    }
    downloader.remove_task(&task);

    Ok(status.is_success())
}

fn watch(downloader: &Downloader, task: &TaskHandle, progress: &TaskProgress) {
    while !task.is_finished() {
        progress.update(&downloader.task_status(task));
        thread::sleep(POLL_INTERVAL);
    }
    downloader.wait_task(task);
    progress.finish(&downloader.task_status(task));
}

fn print_headline(succeeded: bool, dest: &Path) {
    if succeeded {
        println!(
            "{} Saved {}",
            style("✓").green().bold(),
            style(dest.display()).cyan()
        );
    } else {
        println!(
            "{} Download to {} failed",
            style("✗").red().bold(),
            style(dest.display()).cyan()
        );
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// File name the URL points at, if it has one
fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.last()?;
    (!name.is_empty()).then(|| name.to_string())
}

/// `<downloads dir>/<file name from url>`
fn default_destination(url: &str) -> PathBuf {
    let dir = dirs::download_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let name = file_name_from_url(url).unwrap_or_else(|| "download".to_string());
    dir.join(name)
}
