//! Output formatting utilities

use crate::OutputFormat;
use console::{style, StyledObject};
use ferry_types::{DownloadJob, JobState};
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct JobRow {
    id: String,
    file: String,
    size: String,
    progress: String,
    state: String,
}

impl From<&DownloadJob> for JobRow {
    fn from(job: &DownloadJob) -> Self {
        let file = job.file_name();
        Self {
            id: short_id(job),
            file: if file.chars().count() > 30 {
                format!("{}...", file.chars().take(27).collect::<String>())
            } else {
                file
            },
            size: job.content_length.map(format_bytes).unwrap_or_else(|| "?".to_string()),
            progress: format!("{:.1}%", job.progress()),
            state: job.state.to_string(),
        }
    }
}

/// Print one job in the requested format
pub fn print_job(job: &DownloadJob, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => println!("{}", Table::new([JobRow::from(job)])),
        OutputFormat::Human => print_summary(job, true),
    }
    Ok(())
}

/// Print a list of jobs in the requested format
pub fn print_jobs(jobs: &[DownloadJob], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(jobs)?),
        OutputFormat::Table => println!("{}", Table::new(jobs.iter().map(JobRow::from))),
        OutputFormat::Human => {
            if jobs.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for job in jobs {
                print_summary(job, false);
            }
            println!();
            println!("{} download(s) total", style(jobs.len()).bold());
        }
    }
    Ok(())
}

/// Print a one-line confirmation, unless the output is meant for machines
pub fn print_done(message: &str, job: &DownloadJob, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Human => {
            println!("{} {} {}", style("✓").green().bold(), message, style(job.file_name()).cyan());
            Ok(())
        }
        _ => print_job(job, format),
    }
}

fn print_summary(job: &DownloadJob, detailed: bool) {
    println!(
        "{} {} {} [{}] {}",
        state_icon(job.state),
        style(job.file_name()).bold(),
        style(format!("{:.1}%", job.progress())).dim(),
        style(job.state).dim(),
        style(short_id(job)).dim()
    );

    if detailed {
        println!("    ID: {}", job.id);
        println!("    URL: {}", job.url);
        println!("    Path: {}", job.destination.display());
        match job.content_length {
            Some(size) => println!("    Size: {} / {}", format_bytes(job.bytes_copied), format_bytes(size)),
            None => println!("    Size: {} / ?", format_bytes(job.bytes_copied)),
        }
        println!("    Started: {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(ref error) = job.error {
            println!("    Error: {}", style(error).red());
        }
    }
}

pub fn state_icon(state: JobState) -> StyledObject<&'static str> {
    match state {
        JobState::Completed => style("✓").green(),
        JobState::Downloading => style("↓").cyan(),
        JobState::Paused => style("⏸").yellow(),
        JobState::Failed => style("✗").red(),
        JobState::Cancelled => style("○").dim(),
        JobState::Initiated => style("·").dim(),
    }
}

fn short_id(job: &DownloadJob) -> String {
    job.id.to_string()[..8].to_string()
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Format duration as human-readable
pub fn format_eta(seconds: u64) -> String {
    if seconds == 0 {
        return "-".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_formats() {
        assert_eq!(format_eta(0), "-");
        assert_eq!(format_eta(42), "42s");
        assert_eq!(format_eta(125), "2m 5s");
        assert_eq!(format_eta(3725), "1h 2m 5s");
    }

    #[test]
    fn long_names_are_shortened_in_tables() {
        let job = DownloadJob::new(
            uuid::Uuid::new_v4(),
            1,
            "http://example.com/x".to_string(),
            std::path::PathBuf::from("/tmp/a-very-long-file-name-that-does-not-fit.tar.gz"),
        );
        let row = JobRow::from(&job);
        assert_eq!(row.file.chars().count(), 30);
        assert!(row.file.ends_with("..."));
        assert_eq!(row.size, "?");
    }
}
