use crate::http::build_client;
use crate::models::{ListingSourceType, MarketListing};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Raw cached-listing row. Upstream rows can be sparse or malformed, so every
/// optional column carries a defaulting rule applied in `into_listing`.
#[derive(Debug, Clone, Deserialize)]
pub struct CachedListingRow {
    pub price: Option<f64>,
    pub mileage: Option<u32>,
    pub year: Option<i32>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub vin: Option<String>,
    pub source: Option<String>,
    pub source_type: Option<String>,
    pub url: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub confidence: Option<f32>,
}

impl CachedListingRow {
    pub fn into_listing(self) -> Option<MarketListing> {
        let price = self.price.filter(|p| p.is_finite() && *p > 0.0)?;
        let source_type = match self.source_type.as_deref() {
            Some("certified") => ListingSourceType::Certified,
            Some("estimated") => ListingSourceType::Estimated,
            _ => ListingSourceType::Marketplace,
        };
        Some(MarketListing {
            price,
            mileage: self.mileage,
            year: self.year.unwrap_or(0),
            make: self.make.unwrap_or_default(),
            model: self.model.unwrap_or_default(),
            trim: self.trim,
            vin: self.vin.filter(|v| !v.trim().is_empty()),
            source: self
                .source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "listing_cache".into()),
            source_type,
            url: self.url.unwrap_or_default(),
            fetched_at: self.fetched_at.unwrap_or_else(Utc::now),
            confidence: self.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        })
    }
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    /// Cached listings whose VIN matches exactly.
    pub async fn fetch_listings_by_vin(
        &self,
        vin: &str,
    ) -> Result<Vec<MarketListing>, SupabaseError> {
        let url = format!(
            "{}/rest/v1/cached_listings?vin=eq.{}&select=*&order=fetched_at.desc&limit=10",
            self.base_url,
            urlencoding::encode(vin.trim())
        );
        self.fetch_rows(url).await
    }

    /// Cached listings for the same make/model within a model-year window.
    /// The geographic filter is a zip-prefix match, which approximates the
    /// collaborator's radius query closely enough for cache reuse.
    pub async fn fetch_similar_listings(
        &self,
        make: &str,
        model: &str,
        year_min: i32,
        year_max: i32,
        zip_prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MarketListing>, SupabaseError> {
        let mut url = format!(
            "{}/rest/v1/cached_listings?make=ilike.{}&model=ilike.{}&year=gte.{}&year=lte.{}",
            self.base_url,
            urlencoding::encode(make.trim()),
            urlencoding::encode(model.trim()),
            year_min,
            year_max,
        );
        if let Some(prefix) = zip_prefix.filter(|p| !p.is_empty()) {
            url.push_str(&format!(
                "&zip=like.{}*",
                urlencoding::encode(prefix)
            ));
        }
        url.push_str(&format!(
            "&select=*&order=fetched_at.desc&limit={limit}"
        ));
        self.fetch_rows(url).await
    }

    async fn fetch_rows(&self, url: String) -> Result<Vec<MarketListing>, SupabaseError> {
        let response = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let rows: Vec<CachedListingRow> = response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        Ok(rows.into_iter().filter_map(|r| r.into_listing()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_without_price_is_dropped() {
        let row = CachedListingRow {
            price: None,
            mileage: None,
            year: Some(2021),
            make: Some("Honda".into()),
            model: Some("Accord".into()),
            trim: None,
            vin: None,
            source: None,
            source_type: None,
            url: None,
            fetched_at: None,
            confidence: None,
        };
        assert!(row.into_listing().is_none());
    }

    #[test]
    fn sparse_row_defaults_are_applied() {
        let row = CachedListingRow {
            price: Some(24000.0),
            mileage: Some(50_000),
            year: Some(2020),
            make: Some("Honda".into()),
            model: Some("Accord".into()),
            trim: None,
            vin: Some("   ".into()),
            source: Some("".into()),
            source_type: Some("certified".into()),
            url: None,
            fetched_at: None,
            confidence: Some(2.0),
        };
        let listing = row.into_listing().expect("listing");
        assert_eq!(listing.source, "listing_cache");
        assert!(listing.vin.is_none());
        assert_eq!(listing.source_type, ListingSourceType::Certified);
        assert_eq!(listing.confidence, 1.0);
    }
}
