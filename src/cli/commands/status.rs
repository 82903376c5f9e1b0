//! Status command.

use console::style;
use serde::Serialize;

use listing_import::config::Settings;
use listing_import::import::{Checkpoint, CheckpointBackend};
use listing_import::models::StateSummary;

use crate::cli::helpers::format_minutes;

#[derive(Debug, Serialize)]
struct StatusReport {
    run_key: String,
    checkpoint_location: String,
    /// None when the run key has never checkpointed.
    checkpoint: Option<Checkpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eta_minutes: Option<f64>,
    database: String,
    /// None when the database does not exist yet.
    counts: Option<Counts>,
}

#[derive(Debug, Serialize)]
struct Counts {
    states: i64,
    cities: i64,
    listings: i64,
    by_state: Vec<StateSummary>,
}

/// Show checkpoint progress and live counts. Never writes.
pub async fn cmd_status(
    settings: &Settings,
    backend: CheckpointBackend,
    run_key: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let run_key = run_key.unwrap_or(&settings.run_key);
    let db_exists = settings.database_exists();
    let ctx = settings.create_db_context();
    let store = settings.progress_store(backend, &ctx, run_key);

    let checkpoint = if backend == CheckpointBackend::Database && !db_exists {
        None
    } else {
        Some(store.load().await?).filter(|cp: &Checkpoint| cp.done || cp.processed() > 0)
    };

    let counts = if db_exists {
        let dimensions = ctx.dimensions();
        Some(Counts {
            states: dimensions.count_states().await?,
            cities: dimensions.count_cities().await?,
            listings: ctx.listings().count().await?,
            by_state: dimensions.state_summaries().await?,
        })
    } else {
        None
    };

    let report = StatusReport {
        run_key: run_key.to_string(),
        checkpoint_location: store.location(),
        eta_minutes: checkpoint
            .as_ref()
            .filter(|cp| !cp.done)
            .and_then(Checkpoint::eta_minutes),
        checkpoint,
        database: settings.database_url(),
        counts,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &StatusReport) {
    println!("{}", style("Import status").bold());
    println!("  Run key:    {}", report.run_key);
    println!("  Checkpoint: {}", report.checkpoint_location);

    match &report.checkpoint {
        None => println!("  {} No progress recorded", style("○").dim()),
        Some(cp) => {
            let state = if cp.done {
                style("complete").green()
            } else {
                style("in progress").yellow()
            };
            match cp.total_records {
                Some(total) => println!("  Position:   {}/{} ({})", cp.position, total, state),
                None => println!("  Position:   {} ({})", cp.position, state),
            }
            if let Some(partition) = &cp.partition {
                println!("  Partition:  {}", partition);
            }
            println!(
                "  Totals:     {} imported, {} skipped, {} errors",
                cp.total_imported, cp.total_skipped, cp.total_errors
            );
            println!("  Rate:       {:.0} records/min", cp.records_per_minute);
            if let Some(eta) = report.eta_minutes {
                println!("  ETA:        {}", format_minutes(eta));
            }
            println!(
                "  Started:    {}",
                cp.start_time.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!(
                "  Updated:    {}",
                cp.last_update.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if let Some(last) = cp.errors.last() {
                println!("  Last error: {}", last.message);
            }
        }
    }

    println!();
    println!("  Database:   {}", report.database);
    match &report.counts {
        None => println!("  {} Not initialized", style("○").dim()),
        Some(counts) => {
            println!(
                "  {} listings in {} cities across {} states",
                counts.listings, counts.cities, counts.states
            );
            for state in counts.by_state.iter().take(10) {
                println!(
                    "    {:<3} {:<20} {:>8} listings {:>6} cities",
                    state.abbreviation, state.name, state.listing_count, state.city_count
                );
            }
            if counts.by_state.len() > 10 {
                println!("    ... and {} more", counts.by_state.len() - 10);
            }
        }
    }
}
