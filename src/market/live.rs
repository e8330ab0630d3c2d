use super::{ListingSource, SearchError, SourceFuture, SourceYield};
use crate::http::build_client;
use crate::models::{ListingSourceType, MarketListing, SearchMethod, ValuationRequest};
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::env;
use std::hash::{Hash, Hasher};
use tracing::info;

pub static SEARCH_ENV: Lazy<String> =
    Lazy::new(|| env::var("SEARCH_ENV").unwrap_or_else(|_| "SANDBOX".to_string()));

pub static SEARCH_API_KEY: Lazy<String> =
    Lazy::new(|| env::var("SEARCH_API_KEY").unwrap_or_default());

pub static SEARCH_API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("SEARCH_API_ROOT").unwrap_or_else(|_| {
        if SEARCH_ENV.as_str().eq_ignore_ascii_case("PROD") {
            "https://api.marketcheck.com/v2".to_string()
        } else {
            "https://sandbox.marketcheck.com/v2".to_string()
        }
    })
});

/// Structured parameters for one live-search invocation. The LLM router and
/// the direct source both produce this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchParams {
    pub make: String,
    pub model: String,
    pub year_min: i32,
    pub year_max: i32,
    #[serde(default)]
    pub max_mileage: Option<u32>,
    #[serde(default)]
    pub zip: Option<String>,
    #[serde(default = "default_radius")]
    pub radius_miles: u32,
}

fn default_radius() -> u32 {
    100
}

impl SearchParams {
    /// Parameters derived straight from the request, used both as the direct
    /// call and as the fallback when the LLM router is unavailable.
    pub fn from_request(request: &ValuationRequest) -> Self {
        let vehicle = &request.vehicle;
        Self {
            make: vehicle.make.clone(),
            model: vehicle.model.clone(),
            year_min: vehicle.year - 2,
            year_max: vehicle.year + 2,
            max_mileage: Some(request.mileage.saturating_mul(2).max(60_000)),
            zip: Some(request.location.clone()).filter(|z| !z.trim().is_empty()),
            radius_miles: default_radius(),
        }
    }
}

/// Raw listing candidate as the search vendor returns it. Normalized once
/// here so the pipeline never sees the vendor shape.
#[derive(Debug, Clone, Deserialize)]
pub struct RawListingCandidate {
    #[serde(default)]
    pub price: Option<serde_json::Value>,
    #[serde(default)]
    pub miles: Option<u32>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub trim: Option<String>,
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub certified: Option<bool>,
    #[serde(default)]
    pub vdp_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchApiResponse {
    #[serde(default)]
    listings: Vec<RawListingCandidate>,
}

impl RawListingCandidate {
    pub fn into_listing(self, params: &SearchParams) -> Option<MarketListing> {
        let price = match self.price {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => {
                s.replace(['$', ','], "").trim().parse::<f64>().ok()
            }
            _ => None,
        }
        .filter(|p| p.is_finite() && *p > 0.0)?;

        let source_type = if self.certified.unwrap_or(false) {
            ListingSourceType::Certified
        } else {
            ListingSourceType::Marketplace
        };
        Some(MarketListing {
            price,
            mileage: self.miles,
            year: self.year.unwrap_or(params.year_min),
            make: self.make.unwrap_or_else(|| params.make.clone()),
            model: self.model.unwrap_or_else(|| params.model.clone()),
            trim: self.trim,
            vin: self.vin.filter(|v| !v.trim().is_empty()),
            source: self
                .source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "live_search".into()),
            source_type,
            url: self.vdp_url.unwrap_or_default(),
            fetched_at: Utc::now(),
            confidence: 0.7,
        })
    }
}

/// Thin client over the live-search vendor. Without an API key (or with
/// network disabled) it degrades to a deterministic sandbox stub whose
/// listings are tagged `estimated` so they never reach the anchoring math.
#[derive(Clone)]
pub struct LiveSearchClient {
    http: Client,
    network_enabled: bool,
}

impl LiveSearchClient {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            network_enabled: parse_env_bool("SEARCH_ENABLE_NETWORK"),
        }
    }

    #[cfg(test)]
    pub fn offline() -> Self {
        Self {
            http: build_client(),
            network_enabled: false,
        }
    }

    pub async fn search(&self, params: &SearchParams) -> Result<Vec<MarketListing>, SearchError> {
        if !self.network_enabled || SEARCH_API_KEY.is_empty() {
            info!(
                target = "vantage.market",
                make = %params.make,
                model = %params.model,
                "live search in sandbox mode"
            );
            return Ok(sandbox_listings(params));
        }

        let mut url = format!(
            "{}/search/car/active?api_key={}&make={}&model={}&year_range={}-{}&rows=20",
            SEARCH_API_ROOT.as_str(),
            urlencoding::encode(SEARCH_API_KEY.as_str()),
            urlencoding::encode(params.make.trim()),
            urlencoding::encode(params.model.trim()),
            params.year_min,
            params.year_max,
        );
        if let Some(zip) = params.zip.as_deref() {
            url.push_str(&format!(
                "&zip={}&radius={}",
                urlencoding::encode(zip),
                params.radius_miles
            ));
        }
        if let Some(miles) = params.max_mileage {
            url.push_str(&format!("&miles_range=0-{miles}"));
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| SearchError::Source {
                source_name: "live_search",
                detail: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(SearchError::Source {
                source_name: "live_search",
                detail: format!("HTTP {}", response.status()),
            });
        }

        let payload: SearchApiResponse =
            response.json().await.map_err(|err| SearchError::Source {
                source_name: "live_search",
                detail: err.to_string(),
            })?;

        Ok(payload
            .listings
            .into_iter()
            .filter_map(|raw| raw.into_listing(params))
            .collect())
    }
}

/// Deterministic stub listings for sandbox runs: seeded from the query, priced
/// off a rough model curve, and tagged `estimated` (display/debug only).
fn sandbox_listings(params: &SearchParams) -> Vec<MarketListing> {
    let mut hasher = DefaultHasher::new();
    params.make.to_lowercase().hash(&mut hasher);
    params.model.to_lowercase().hash(&mut hasher);
    params.year_min.hash(&mut hasher);
    let mut rng = SmallRng::seed_from_u64(hasher.finish());

    let mid_year = (params.year_min + params.year_max) / 2;
    let anchor_price: f64 = 24_000.0 + rng.random_range(-4_000.0..4_000.0);
    (0..3)
        .map(|idx| MarketListing {
            price: (anchor_price + rng.random_range(-1_500.0..1_500.0)).max(2_000.0),
            mileage: Some(rng.random_range(20_000..90_000)),
            year: mid_year,
            make: params.make.clone(),
            model: params.model.clone(),
            trim: None,
            vin: None,
            source: "sandbox_search".into(),
            source_type: ListingSourceType::Estimated,
            url: format!("https://sandbox.marketcheck.com/listing/{idx}"),
            fetched_at: Utc::now(),
            confidence: 0.3,
        })
        .collect()
}

fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Last rung of the source chain: invoke the live search directly with
/// parameters derived from the request.
pub struct DirectSearchSource {
    client: LiveSearchClient,
}

impl DirectSearchSource {
    pub fn new(client: LiveSearchClient) -> Self {
        Self { client }
    }
}

impl ListingSource for DirectSearchSource {
    fn name(&self) -> &'static str {
        "live_search"
    }

    fn fetch<'a>(&'a self, request: &'a ValuationRequest) -> SourceFuture<'a> {
        Box::pin(async move {
            let params = SearchParams::from_request(request);
            let listings = self.client.search(&params).await?;
            Ok(SourceYield {
                listings,
                trust_score: 0.7,
                method: SearchMethod::DirectSearch,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::request;
    use serde_json::json;

    #[test]
    fn raw_candidate_parses_string_prices() {
        let raw: RawListingCandidate = serde_json::from_value(json!({
            "price": "$27,500",
            "miles": 41000,
            "vin": "1HGCV1F34MA099999",
            "vdp_url": "https://www.cargurus.com/listing/9"
        }))
        .expect("candidate");
        let params = SearchParams::from_request(&request());
        let listing = raw.into_listing(&params).expect("listing");
        assert_eq!(listing.price, 27500.0);
        assert_eq!(listing.make, "Honda");
        assert_eq!(listing.source_type, ListingSourceType::Marketplace);
    }

    #[test]
    fn raw_candidate_without_usable_price_is_dropped() {
        let raw: RawListingCandidate =
            serde_json::from_value(json!({ "price": "call for price" })).expect("candidate");
        let params = SearchParams::from_request(&request());
        assert!(raw.into_listing(&params).is_none());
    }

    #[test]
    fn sandbox_listings_are_deterministic_and_estimated() {
        let params = SearchParams::from_request(&request());
        let first = sandbox_listings(&params);
        let second = sandbox_listings(&params);
        assert_eq!(first.len(), 3);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.price, b.price);
            assert_eq!(a.source_type, ListingSourceType::Estimated);
        }
    }

    #[tokio::test]
    async fn offline_client_returns_sandbox_stub() {
        let client = LiveSearchClient::offline();
        let params = SearchParams::from_request(&request());
        let listings = client.search(&params).await.expect("sandbox");
        assert!(!listings.is_empty());
        assert!(
            listings
                .iter()
                .all(|l| l.source_type == ListingSourceType::Estimated)
        );
    }
}
