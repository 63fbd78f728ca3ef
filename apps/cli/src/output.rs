//! Output formatting utilities

use crate::OutputFormat;
use dlc_core::{TaskInfo, TaskStatus};
use indicatif::HumanBytes;
use serde::Serialize;
use std::fmt;

/// Final word on one task
#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub info: TaskInfo,
    pub status: TaskStatus,
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  URL: {}", self.info.url)?;
        if let Some(path) = &self.info.dst_path {
            writeln!(f, "  Destination: {}", path.display())?;
        }
        writeln!(f, "  Size: {}", format_bytes(self.status.size_total))?;
        write!(f, "  Downloaded: {}", format_bytes(self.status.size_downloaded))?;
        if self.status.error.error_happened {
            write!(f, "\n  Error: {}", self.status.error.message)?;
            if self.status.error.http_code >= 400 {
                write!(f, " (HTTP {})", self.status.error.http_code)?;
            }
        }
        Ok(())
    }
}

/// Print output in the specified format
pub fn print_output<T: Serialize + fmt::Display>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human => {
            println!("{}", value);
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    HumanBytes(bytes).to_string()
}
