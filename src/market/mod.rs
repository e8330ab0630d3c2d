mod cache;
mod live;
mod llm_route;
mod validator;

pub use cache::CacheSource;
pub use live::{DirectSearchSource, LiveSearchClient, SearchParams};
pub use llm_route::LlmRoutedSource;
pub use validator::{ListingValidator, ValidatorConfig};

use crate::models::{MarketListing, SearchMethod, SearchOutcome, ValuationRequest};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Merged result size cap.
const MAX_LISTINGS: usize = 20;
/// Below this many cached listings the orchestrator also tries live search.
const SCARCE_CACHE_THRESHOLD: usize = 5;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("source `{source_name}` failed: {detail}")]
    Source {
        source_name: &'static str,
        detail: String,
    },
    #[error("source `{0}` is not configured")]
    Unavailable(&'static str),
}

pub type SourceFuture<'a> =
    Pin<Box<dyn Future<Output = Result<SourceYield, SearchError>> + Send + 'a>>;

/// What one source contributed: listings plus its own trust and method tag.
#[derive(Debug, Clone)]
pub struct SourceYield {
    pub listings: Vec<MarketListing>,
    pub trust_score: f32,
    pub method: SearchMethod,
}

/// One strategy in the ordered source chain. Failure of a source is contained
/// by the orchestrator; it never aborts the chain.
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn fetch<'a>(&'a self, request: &'a ValuationRequest) -> SourceFuture<'a>;
}

/// Runs the ordered source chain and merges what it finds. Sources are tried
/// sequentially: each later source exists as a fallback for the one before,
/// so there is nothing to gain from running them in parallel.
pub struct MarketSearchOrchestrator {
    cache: Option<Arc<dyn ListingSource>>,
    live_chain: Vec<Arc<dyn ListingSource>>,
}

impl MarketSearchOrchestrator {
    pub fn new(
        cache: Option<Arc<dyn ListingSource>>,
        live_chain: Vec<Arc<dyn ListingSource>>,
    ) -> Self {
        Self { cache, live_chain }
    }

    /// Search every applicable source. Never errors: exhausting the chain
    /// yields an empty outcome tagged `no_results`.
    pub async fn search(&self, request: &ValuationRequest) -> SearchOutcome {
        let mut merged: Vec<MarketListing> = Vec::new();
        let mut sources: Vec<String> = Vec::new();
        let mut trust: f32 = 0.0;
        let mut method: Option<SearchMethod> = None;
        let mut attempts: u32 = 0;
        let mut failures: u32 = 0;

        if request.force_refresh {
            info!(
                target = "vantage.market",
                vin = %request.vehicle.vin,
                "cache skipped: force_refresh"
            );
        } else if let Some(cache) = &self.cache {
            attempts += 1;
            match cache.fetch(request).await {
                Ok(yielded) => {
                    if !yielded.listings.is_empty() {
                        sources.push(cache.name().to_string());
                        trust = trust.max(yielded.trust_score);
                        method.get_or_insert(yielded.method);
                        merged.extend(yielded.listings);
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(target = "vantage.market", source = cache.name(), error = %err, "listing_source_failed");
                }
            }
        }

        // Live search supplements a scarce or empty cache. The chain is an
        // ordered fallback: the first live source that yields wins.
        if merged.len() < SCARCE_CACHE_THRESHOLD {
            for source in &self.live_chain {
                attempts += 1;
                match source.fetch(request).await {
                    Ok(yielded) => {
                        if yielded.listings.is_empty() {
                            continue;
                        }
                        sources.push(source.name().to_string());
                        trust = trust.max(yielded.trust_score);
                        method.get_or_insert(yielded.method);
                        merged.extend(yielded.listings);
                        break;
                    }
                    Err(err) => {
                        failures += 1;
                        warn!(target = "vantage.market", source = source.name(), error = %err, "listing_source_failed");
                    }
                }
            }
        }

        let listings = merge_listings(merged, &request.vehicle.vin);
        if listings.is_empty() {
            let mut outcome = SearchOutcome::empty();
            outcome.all_sources_failed = attempts > 0 && failures == attempts;
            return outcome;
        }

        SearchOutcome {
            listings,
            sources,
            trust_score: trust.clamp(0.0, 1.0),
            method: method.unwrap_or(SearchMethod::NoResults),
            all_sources_failed: false,
        }
    }
}

/// Deduplicate, rank, and cap the merged listing set. Exact-VIN matches sort
/// first, then most recently fetched.
pub fn merge_listings(listings: Vec<MarketListing>, request_vin: &str) -> Vec<MarketListing> {
    let mut seen = HashSet::new();
    let mut unique: Vec<MarketListing> = Vec::new();
    for listing in listings {
        if seen.insert(listing.dedup_key()) {
            unique.push(listing);
        }
    }
    unique.sort_by(|a, b| {
        let exact_a = a.matches_vin(request_vin);
        let exact_b = b.matches_vin(request_vin);
        exact_b
            .cmp(&exact_a)
            .then_with(|| b.fetched_at.cmp(&a.fetched_at))
    });
    unique.truncate(MAX_LISTINGS);
    unique
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::{Condition, FuelType, ListingSourceType, VehicleProfile};
    use chrono::{Duration, Utc};

    pub fn request() -> ValuationRequest {
        ValuationRequest {
            vehicle: VehicleProfile {
                vin: "1HGCV1F34MA012345".into(),
                year: 2021,
                make: "Honda".into(),
                model: "Accord".into(),
                trim: Some("LX".into()),
                fuel_type: FuelType::Gasoline,
                body_type: Some("sedan".into()),
            },
            mileage: 35_000,
            condition: Condition::Good,
            location: "90210".into(),
            premium: false,
            force_refresh: false,
        }
    }

    pub fn listing(price: f64, age_days: i64) -> MarketListing {
        MarketListing {
            price,
            mileage: Some(40_000),
            year: 2021,
            make: "Honda".into(),
            model: "Accord".into(),
            trim: Some("LX".into()),
            vin: None,
            source: "autotrader".into(),
            source_type: ListingSourceType::Marketplace,
            url: "https://www.autotrader.com/listing/x".into(),
            fetched_at: Utc::now() - Duration::days(age_days),
            confidence: 0.85,
        }
    }

    pub struct StaticSource {
        pub source_name: &'static str,
        pub result: Result<SourceYield, &'static str>,
    }

    impl ListingSource for StaticSource {
        fn name(&self) -> &'static str {
            self.source_name
        }

        fn fetch<'a>(&'a self, _request: &'a ValuationRequest) -> SourceFuture<'a> {
            let out = match &self.result {
                Ok(yielded) => Ok(yielded.clone()),
                Err(detail) => Err(SearchError::Source {
                    source_name: self.source_name,
                    detail: detail.to_string(),
                }),
            };
            Box::pin(async move { out })
        }
    }
}
