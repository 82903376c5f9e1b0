//! Shared helper functions for CLI commands.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar for an import of `total` records.
pub fn import_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Spinner-and-bar for an enrichment pass; the length is set by the pass.
pub fn pass_progress_bar(label: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_prefix(label.to_string());
    pb
}

/// "1h 02m", "3m 05s", "12s".
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{secs}s")
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Time to finish `remaining` records at `per_minute`, or "unknown".
pub fn format_eta(remaining: u64, per_minute: f64) -> String {
    if per_minute <= 0.0 || !per_minute.is_finite() {
        return "unknown".to_string();
    }
    format_minutes(remaining as f64 / per_minute)
}

pub fn format_minutes(minutes: f64) -> String {
    format_duration(Duration::from_secs_f64((minutes * 60.0).max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(12)), "12s");
        assert_eq!(format_duration(Duration::from_secs(185)), "3m 05s");
        assert_eq!(format_duration(Duration::from_secs(3720)), "1h 02m");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(100, 0.0), "unknown");
        assert_eq!(format_eta(600, 200.0), "3m 00s");
    }
}
