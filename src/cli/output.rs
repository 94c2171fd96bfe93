//! CLI output formatting utilities.

use crate::pipeline::{RunRecord, RunStatus};
use console::{style, Style};
use indicatif::{ProgressBar, ProgressStyle};

/// Output helper for CLI formatting.
pub struct Output;

impl Output {
    /// Print an info message.
    pub fn info(msg: &str) {
        println!("{} {}", style(">>").cyan().bold(), msg);
    }

    /// Print a success message.
    pub fn success(msg: &str) {
        println!("{} {}", style(">>").green().bold(), msg);
    }

    /// Print a warning message.
    pub fn warning(msg: &str) {
        eprintln!("{} {}", style(">>").yellow().bold(), msg);
    }

    /// Print an error message.
    pub fn error(msg: &str) {
        eprintln!("{} {}", style(">>").red().bold(), msg);
    }

    /// Print a header.
    pub fn header(msg: &str) {
        println!("\n{}", style(msg).bold().underlined());
    }

    /// Print a key-value pair.
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", style(key).dim(), value);
    }

    /// Print a list item.
    pub fn list_item(msg: &str) {
        println!("  {} {}", style("*").cyan(), msg);
    }

    /// Print one line of a run listing.
    pub fn run_info(record: &RunRecord) {
        println!(
            "  {} {} ({}, updated {})",
            style("*").cyan(),
            style(&record.run_id).bold(),
            status_style(&record.status).apply_to(record.status.to_string()),
            record.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    /// Print a failed scene.
    pub fn scene_failure(id: &str, attempts: u32, error: &str) {
        println!(
            "  {} {} after {} attempt{}: {}",
            style("x").red().bold(),
            style(id).bold(),
            attempts,
            if attempts == 1 { "" } else { "s" },
            content_preview(error, 160)
        );
    }

    /// Create a progress bar.
    pub fn progress_bar(len: u64, msg: &str) -> ProgressBar {
        let pb = ProgressBar::new(len);
        if let Ok(bar) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(bar.progress_chars("#>-"));
        }
        pb.set_message(msg.to_string());
        pb
    }

    /// Create a spinner.
    pub fn spinner(msg: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        if let Ok(spinner) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(spinner);
        }
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }

    /// Style for titles.
    pub fn title_style() -> Style {
        Style::new().bold()
    }

    /// Style for dim text.
    pub fn dim_style() -> Style {
        Style::new().dim()
    }
}

fn status_style(status: &RunStatus) -> Style {
    match status {
        RunStatus::Completed => Style::new().green(),
        RunStatus::StepFailed(_) => Style::new().yellow(),
        RunStatus::Abandoned(_) => Style::new().red(),
        _ => Style::new().cyan(),
    }
}

/// Format duration in seconds to a human-readable string.
pub fn format_duration(seconds: f64) -> String {
    let total_seconds = seconds as u32;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Truncate content with ellipsis.
pub fn content_preview(content: &str, max_len: usize) -> String {
    let content = content.replace('\n', " ");
    if content.chars().count() <= max_len {
        content
    } else {
        let cut: String = content.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}
