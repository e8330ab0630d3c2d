use super::{ListingSource, SearchError, SourceFuture, SourceYield};
use crate::models::{SearchMethod, ValuationRequest};
use crate::supabase::SupabaseClient;
use tracing::info;

/// Comparable-year window for the similarity query.
const YEAR_WINDOW: i32 = 2;
/// Zip digits used to approximate the geographic radius.
const ZIP_PREFIX_LEN: usize = 3;

/// Cached/database listings. Exact-VIN rows first; failing that, similar
/// make/model rows within the year window and zip prefix.
pub struct CacheSource {
    client: SupabaseClient,
}

impl CacheSource {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    pub fn from_env() -> Option<Self> {
        SupabaseClient::from_env().map(Self::new)
    }

    async fn fetch_inner(&self, request: &ValuationRequest) -> Result<SourceYield, SearchError> {
        let vehicle = &request.vehicle;

        let exact = self
            .client
            .fetch_listings_by_vin(&vehicle.vin)
            .await
            .map_err(|err| SearchError::Source {
                source_name: "listing_cache",
                detail: err.to_string(),
            })?;
        if !exact.is_empty() {
            info!(
                target = "vantage.market",
                vin = %vehicle.vin,
                count = exact.len(),
                "cache_exact_vin_hit"
            );
            return Ok(SourceYield {
                listings: exact,
                trust_score: 0.9,
                method: SearchMethod::CacheExactVin,
            });
        }

        let zip_prefix: Option<String> = {
            let digits: String = request
                .location
                .chars()
                .filter(|c| c.is_ascii_digit())
                .take(ZIP_PREFIX_LEN)
                .collect();
            (digits.len() == ZIP_PREFIX_LEN).then_some(digits)
        };
        let similar = self
            .client
            .fetch_similar_listings(
                &vehicle.make,
                &vehicle.model,
                vehicle.year - YEAR_WINDOW,
                vehicle.year + YEAR_WINDOW,
                zip_prefix.as_deref(),
                20,
            )
            .await
            .map_err(|err| SearchError::Source {
                source_name: "listing_cache",
                detail: err.to_string(),
            })?;

        Ok(SourceYield {
            listings: similar,
            trust_score: 0.75,
            method: SearchMethod::CacheSimilar,
        })
    }
}

impl ListingSource for CacheSource {
    fn name(&self) -> &'static str {
        "listing_cache"
    }

    fn fetch<'a>(&'a self, request: &'a ValuationRequest) -> SourceFuture<'a> {
        Box::pin(self.fetch_inner(request))
    }
}
