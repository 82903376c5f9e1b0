//! Geocoding pass: refines listings whose coordinates were defaulted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::cache::ResponseCache;
use super::rate_limit::{parse_retry_after, IntervalLimiter};
use super::runner::{PassRunner, PassSummary, RetryPolicy, UnitOutcome};
use super::{EnrichConfig, EnrichError};
use crate::import::normalize::DEFAULT_ADDRESS;
use crate::import::{Pacer, StopSignal};
use crate::models::{Coordinates, GeocodeCandidate};
use crate::repository::DbContext;

/// Free-form address lookup.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Best match for `query`, or None when the service has no match.
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, EnrichError>;
}

#[derive(Debug, Deserialize)]
struct Place {
    lat: String,
    lon: String,
}

/// Client for a Nominatim-compatible `/search` endpoint.
pub struct NominatimGeocoder {
    client: Client,
    endpoint: Url,
    limiter: Arc<IntervalLimiter>,
    stop: StopSignal,
}

impl NominatimGeocoder {
    pub fn new(config: &EnrichConfig, stop: StopSignal) -> Result<Self, EnrichError> {
        let endpoint =
            Url::parse(&config.endpoint).map_err(|_| EnrichError::Endpoint(config.endpoint.clone()))?;
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            limiter: Arc::new(IntervalLimiter::new(Duration::from_millis(
                config.min_interval_ms,
            ))),
            stop,
        })
    }

    fn search_url(&self, query: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("format", "jsonv2")
            .append_pair("limit", "1")
            .append_pair("countrycodes", "us");
        url
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, EnrichError> {
        self.limiter.acquire(&self.stop).await?;

        let url = self.search_url(query);
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            if status.as_u16() == 429 || status.as_u16() == 503 {
                self.limiter
                    .defer(retry_after.unwrap_or(self.limiter.min_interval() * 10))
                    .await;
            }
            return Err(EnrichError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                retry_after,
            });
        }

        let places: Vec<Place> = response
            .json()
            .await
            .map_err(|e| EnrichError::Parse(e.to_string()))?;
        Ok(places.first().and_then(parse_place))
    }
}

fn parse_place(place: &Place) -> Option<Coordinates> {
    let coords = Coordinates::new(place.lat.trim().parse().ok()?, place.lon.trim().parse().ok()?);
    coords.is_plausible().then_some(coords)
}

/// Answers from the response cache, asking `inner` only on a miss.
///
/// "No match" answers are cached as well.
pub struct CachedGeocoder<G> {
    inner: G,
    cache: ResponseCache,
}

impl<G: Geocoder> CachedGeocoder<G> {
    pub fn new(inner: G, cache: ResponseCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl<G: Geocoder> Geocoder for CachedGeocoder<G> {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, EnrichError> {
        let key = ResponseCache::key(&["geocode", query]);
        if let Some(hit) = self.cache.get::<Option<Coordinates>>(&key) {
            debug!("Geocode cache hit for '{}'", query);
            return Ok(hit);
        }
        let result = self.inner.geocode(query).await?;
        self.cache.put(&key, &result)?;
        Ok(result)
    }
}

/// The `enrich geocode` pass.
pub struct GeocodePass {
    db: DbContext,
    geocoder: Arc<dyn Geocoder>,
    runner: PassRunner,
    retry: RetryPolicy,
    pacer: Arc<dyn Pacer>,
    limit: usize,
}

impl GeocodePass {
    pub fn new(
        db: DbContext,
        geocoder: Arc<dyn Geocoder>,
        runner: PassRunner,
        retry: RetryPolicy,
        pacer: Arc<dyn Pacer>,
        limit: usize,
    ) -> Self {
        Self {
            db,
            geocoder,
            runner,
            retry,
            pacer,
            limit,
        }
    }

    /// Geocode up to `limit` listings with approximate coordinates.
    pub async fn run(&self) -> Result<PassSummary, EnrichError> {
        let candidates = self.db.listings().geocode_candidates(self.limit).await?;
        info!("Geocoding {} listings with approximate coordinates", candidates.len());

        let summary = self
            .runner
            .run(
                candidates,
                |c: &GeocodeCandidate| format!("listing {} ({})", c.id, c.name),
                |candidate| self.geocode_one(candidate),
            )
            .await;

        info!(
            "Geocoding done: {} updated, {} unchanged, {} without match, {} failed, {} not attempted",
            summary.updated, summary.unchanged, summary.skipped, summary.failed, summary.cancelled
        );
        Ok(summary)
    }

    async fn geocode_one(&self, mut candidate: GeocodeCandidate) -> Result<UnitOutcome, EnrichError> {
        if candidate.address == DEFAULT_ADDRESS {
            candidate.address.clear();
        }
        let query = candidate.query();

        let found = self
            .retry
            .run(self.pacer.as_ref(), self.runner.stop(), &query, || {
                self.geocoder.geocode(&query)
            })
            .await?;

        match found {
            None => Ok(UnitOutcome::Skipped("no match".to_string())),
            Some(coords) => {
                if self.db.listings().update_coordinates(candidate.id, coords).await? {
                    Ok(UnitOutcome::Updated)
                } else {
                    Ok(UnitOutcome::Unchanged)
                }
            }
        }
    }
}
