//! Progress bar for a running task

use console::style;
use dlc_core::TaskStatus;
use indicatif::{ProgressBar, ProgressStyle};

pub struct TaskProgress {
    bar: ProgressBar,
}

impl TaskProgress {
    /// Visible bar for human output, a hidden one otherwise
    pub fn new(label: &str, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };

        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ");
        bar.set_style(style);
        bar.set_message(label.to_string());

        Self { bar }
    }

    pub fn update(&self, status: &TaskStatus) {
        if status.size_total > 0 {
            self.bar.set_length(status.size_total);
        }
        self.bar.set_position(status.size_downloaded);
    }

    pub fn finish(&self, status: &TaskStatus) {
        self.update(status);
        if status.is_success() {
            self.bar.finish_with_message(format!(
                "{} Download complete",
                style("✓").green().bold()
            ));
        } else {
            self.bar.abandon_with_message(format!(
                "{} Failed: {}",
                style("✗").red().bold(),
                status.error.message
            ));
        }
    }
}
