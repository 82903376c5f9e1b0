//! Recount and reset commands.

use anyhow::bail;
use console::style;

use listing_import::config::Settings;
use listing_import::import::CheckpointBackend;

/// Recompute every dimension count from the listings table.
pub async fn cmd_recount(settings: &Settings) -> anyhow::Result<()> {
    if !settings.database_exists() {
        bail!(
            "no database at {}; run `listing-import init` first",
            settings.database_path().display()
        );
    }

    let ctx = settings.create_db_context();
    let dimensions = ctx.dimensions();
    dimensions.recount_all().await?;

    println!(
        "{} Recounted {} states and {} cities",
        style("✓").green(),
        dimensions.count_states().await?,
        dimensions.count_cities().await?
    );
    Ok(())
}

/// Delete the checkpoint for a run key.
pub async fn cmd_reset(
    settings: &Settings,
    backend: CheckpointBackend,
    run_key: Option<&str>,
) -> anyhow::Result<()> {
    let run_key = run_key.unwrap_or(&settings.run_key);

    let ctx = settings.create_db_context();
    if backend == CheckpointBackend::Database {
        ctx.init_schema().await?;
    }
    let store = settings.progress_store(backend, &ctx, run_key);

    if store.clear().await? {
        println!(
            "{} Deleted checkpoint {}",
            style("✓").green(),
            store.location()
        );
    } else {
        println!(
            "{} No checkpoint for run key '{}' ({})",
            style("!").yellow(),
            run_key,
            store.location()
        );
    }
    Ok(())
}
