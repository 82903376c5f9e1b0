//! Enrichment commands.

use std::sync::Arc;

use anyhow::bail;
use console::style;

use listing_import::config::Settings;
use listing_import::enrich::{
    CachedGeocoder, EnrichConfig, GeocodePass, Geocoder, NominatimGeocoder, PassRunner,
    ResponseCache, RetryPolicy,
};
use listing_import::import::{InstanceLock, TokioPacer};

use crate::cli::helpers::pass_progress_bar;

/// Geocode listings that still carry approximate coordinates.
pub async fn cmd_geocode(settings: &Settings, config: &EnrichConfig) -> anyhow::Result<()> {
    if !settings.database_exists() {
        bail!(
            "no database at {}; run `listing-import import` first",
            settings.database_path().display()
        );
    }

    let _lock = InstanceLock::acquire(&settings.lock_path())?;
    let stop = settings.stop_signal();
    stop.listen_for_ctrl_c();

    let nominatim = NominatimGeocoder::new(config, stop.clone())?;
    let geocoder: Arc<dyn Geocoder> = if config.cache {
        let cache = ResponseCache::new(settings.cache_dir.join("geocode"));
        println!(
            "{} Caching responses in {}",
            style("→").dim(),
            cache.dir().display()
        );
        Arc::new(CachedGeocoder::new(nominatim, cache))
    } else {
        Arc::new(nominatim)
    };

    println!(
        "{} Geocoding up to {} listings via {} ({} workers, {} ms between requests)",
        style("→").cyan(),
        config.limit,
        config.endpoint,
        config.concurrency,
        config.min_interval_ms
    );

    let runner = PassRunner::new(config.concurrency, stop.clone())
        .with_progress(pass_progress_bar("geocode"));
    let pass = GeocodePass::new(
        settings.create_db_context(),
        geocoder,
        runner,
        RetryPolicy::from(config),
        Arc::new(TokioPacer::new(stop.clone())),
        config.limit,
    );
    let summary = pass.run().await?;

    if summary.selected == 0 {
        println!(
            "{} No listings with approximate coordinates",
            style("✓").green()
        );
        return Ok(());
    }

    println!(
        "{} Geocoded {} of {} listings",
        style("✓").green(),
        summary.updated,
        summary.selected
    );
    if summary.unchanged > 0 {
        println!("  Unchanged:  {}", summary.unchanged);
    }
    if summary.skipped > 0 {
        println!("  No match:   {}", summary.skipped);
    }
    if summary.failed > 0 {
        println!("  Failed:     {}", style(summary.failed).red());
    }
    if summary.cancelled > 0 {
        println!(
            "  {} Stopped with {} listings not attempted",
            style("!").yellow(),
            summary.cancelled
        );
    }
    Ok(())
}
