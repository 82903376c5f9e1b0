//! Listing import command.

use std::path::PathBuf;

use anyhow::Context;
use console::style;
use tokio::sync::mpsc;

use listing_import::config::{Config, Settings};
use listing_import::import::{
    open_source, BatchRunner, CheckpointBackend, IdempotencyKey, InstanceLock, PartitionMode,
    RunContext, RunEvent, RunSummary, RunnerConfig,
};

use crate::cli::helpers::{format_duration, format_eta, import_progress_bar};

#[derive(clap::Args, Debug)]
pub struct ImportArgs {
    /// Source file (.csv, .tsv or .jsonl)
    pub source: PathBuf,

    /// Records per transaction (overrides config)
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Stop after this many records in this run (0 = no limit)
    #[arg(short, long, default_value = "0")]
    pub limit: u64,

    /// Normalize and count without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Discard the checkpoint and start from the first record
    #[arg(long)]
    pub restart: bool,

    /// Work order: none (source order) or state (grouped by state)
    #[arg(long)]
    pub partition: Option<PartitionMode>,

    /// Only import these states (repeatable, e.g. --state CO --state WY)
    #[arg(long = "state")]
    pub states: Vec<String>,

    /// Conflict key for re-inserted listings: slug or natural
    #[arg(long)]
    pub key: Option<IdempotencyKey>,

    /// Checkpoint backend: file or database
    #[arg(long)]
    pub checkpoint: Option<CheckpointBackend>,

    /// Checkpoint name; separate keys track separate runs
    #[arg(long)]
    pub run_key: Option<String>,

    /// Pause between batches in milliseconds (overrides config)
    #[arg(long)]
    pub pause_ms: Option<u64>,
}

impl ImportArgs {
    /// Layer command-line flags over the configured runner settings.
    fn runner_config(&self, base: &RunnerConfig) -> RunnerConfig {
        let mut config = base.clone();
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(pause) = self.pause_ms {
            config.pause_ms = pause;
        }
        if let Some(mode) = self.partition {
            config.partition = mode;
        }
        if !self.states.is_empty() {
            config.states = self.states.clone();
        }
        if let Some(key) = self.key {
            config.idempotency_key = key;
        }
        if let Some(backend) = self.checkpoint {
            config.checkpoint = backend;
        }
        config.max_records = (self.limit > 0).then_some(self.limit);
        config.dry_run = self.dry_run;
        config.restart = self.restart;
        config
    }
}

/// Import listings from a source file.
pub async fn cmd_import(settings: &Settings, config: &Config, args: ImportArgs) -> anyhow::Result<()> {
    let runner_config = args.runner_config(&config.import);
    let run_key = args
        .run_key
        .clone()
        .unwrap_or_else(|| settings.run_key.clone());

    let source = open_source(&args.source, &config.columns)
        .with_context(|| format!("cannot open source {}", args.source.display()))?;

    settings.ensure_directories()?;
    let _lock = if runner_config.dry_run {
        None
    } else {
        Some(InstanceLock::acquire(&settings.lock_path())?)
    };

    let db = settings.create_db_context();
    db.init_schema()
        .await
        .with_context(|| format!("cannot open database {}", settings.database_url()))?;

    let stop = settings.stop_signal();
    if let Some(path) = stop.stop_file().filter(|p| p.exists()) {
        println!(
            "{} Stop file {} exists; remove it or the run stops before the first batch",
            style("!").yellow(),
            path.display()
        );
    }
    stop.listen_for_ctrl_c();

    let store = settings.progress_store(runner_config.checkpoint, &db, &run_key);
    let ctx = RunContext::new(db, config.normalizer(), runner_config.idempotency_key);

    println!(
        "{} Importing {} (run key '{}'{})",
        style("→").cyan(),
        args.source.display(),
        run_key,
        if runner_config.dry_run { ", dry run" } else { "" }
    );

    let (tx, rx) = mpsc::channel(64);
    let reporter = tokio::spawn(report_progress(rx));

    let mut runner = BatchRunner::new(runner_config, ctx, source, store)
        .with_stop(stop)
        .with_events(tx);
    let result = runner.run().await;
    // Closes the event channel so the reporter drains and exits.
    drop(runner);
    reporter.await?;

    let summary = result?;
    print_summary(&summary);
    Ok(())
}

/// Drive a progress bar from runner events.
async fn report_progress(mut events: mpsc::Receiver<RunEvent>) {
    let mut bar = None;

    while let Some(event) = events.recv().await {
        match event {
            RunEvent::Started {
                total,
                position,
                partitions,
                ..
            } => {
                if position > 0 {
                    println!(
                        "  {} Resuming at record {} of {}",
                        style("↻").cyan(),
                        position,
                        total
                    );
                }
                if partitions > 1 {
                    println!("  {} {} state partitions", style("→").dim(), partitions);
                }
                let pb = import_progress_bar(total);
                pb.set_position(position);
                bar = Some(pb);
            }
            RunEvent::BatchCommitted {
                position,
                partition,
                records_per_minute,
                total,
                ..
            } => {
                if let Some(pb) = &bar {
                    pb.set_position(position);
                    let remaining = total.saturating_sub(position);
                    let eta = format_eta(remaining, records_per_minute);
                    match partition {
                        Some(p) => pb.set_message(format!(
                            "{p} · {records_per_minute:.0}/min · ETA {eta}"
                        )),
                        None => {
                            pb.set_message(format!("{records_per_minute:.0}/min · ETA {eta}"))
                        }
                    }
                }
            }
            RunEvent::BackingOff {
                attempt,
                delay,
                error,
                ..
            } => {
                let line = format!(
                    "  {} Batch failed (attempt {}): {}; retrying in {}",
                    style("!").yellow(),
                    attempt,
                    error,
                    format_duration(delay)
                );
                match &bar {
                    Some(pb) => pb.println(line),
                    None => println!("{line}"),
                }
            }
            RunEvent::Finished(_) => {
                if let Some(pb) = bar.take() {
                    pb.finish_and_clear();
                }
            }
        }
    }

    if let Some(pb) = bar {
        pb.abandon();
    }
}

fn print_summary(summary: &RunSummary) {
    if summary.already_done {
        println!(
            "{} This run key already finished ({} imported). Use --restart to import again.",
            style("✓").green(),
            summary.checkpoint.total_imported
        );
        return;
    }

    let (mark, headline) = if summary.completed {
        (style("✓").green(), "Import complete")
    } else if summary.stopped {
        (style("■").yellow(), "Import stopped")
    } else {
        (style("!").yellow(), "Import paused")
    };
    println!(
        "{} {}{}",
        mark,
        headline,
        if summary.dry_run { " (dry run, nothing written)" } else { "" }
    );

    println!("  This run:   {} batches in {}", summary.batches, format_duration(summary.elapsed));
    println!("  Imported:   {}", style(summary.imported).green());
    println!("  Skipped:    {}", summary.skipped);
    if summary.errors > 0 {
        println!("  Errors:     {}", style(summary.errors).red());
    } else {
        println!("  Errors:     0");
    }
    println!("  Position:   {}/{}", summary.position, summary.total);

    if !summary.dry_run {
        let cp = &summary.checkpoint;
        println!(
            "  Run totals: {} imported, {} skipped, {} errors",
            cp.total_imported, cp.total_skipped, cp.total_errors
        );
    }

    if summary.errors > 0 {
        println!();
        println!("Recent errors:");
        for entry in summary.checkpoint.errors.iter().rev().take(5) {
            println!("  {} {}", style("✗").red(), entry.message);
        }
    }

    if summary.stopped && !summary.completed {
        println!();
        println!("Run the same command again to resume.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> ImportArgs {
        use clap::Parser;

        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: ImportArgs,
        }

        let mut argv = vec!["import", "listings.csv"];
        argv.extend_from_slice(extra);
        Wrapper::try_parse_from(argv).unwrap().args
    }

    #[test]
    fn test_flags_override_config() {
        let base = RunnerConfig {
            batch_size: 500,
            pause_ms: 1000,
            ..Default::default()
        };
        let config = args(&["--batch-size", "25", "--limit", "100", "--key", "natural"])
            .runner_config(&base);

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.pause_ms, 1000);
        assert_eq!(config.max_records, Some(100));
        assert_eq!(config.idempotency_key, IdempotencyKey::Natural);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_defaults_keep_config() {
        let base = RunnerConfig {
            partition: PartitionMode::State,
            states: vec!["CO".to_string()],
            ..Default::default()
        };
        let config = args(&[]).runner_config(&base);
        assert_eq!(config.partition, PartitionMode::State);
        assert_eq!(config.states, vec!["CO"]);
        assert_eq!(config.max_records, None);
    }
}
