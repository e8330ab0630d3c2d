use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Decoded vehicle identity. Supplied by the VIN-decoding collaborator and
/// never mutated inside the pipeline.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleProfile {
    pub vin: String,
    pub year: i32,
    pub make: String,
    pub model: String,
    #[serde(default)]
    pub trim: Option<String>,
    #[serde(default)]
    pub fuel_type: FuelType,
    #[serde(default)]
    pub body_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FuelType {
    #[default]
    Gasoline,
    Diesel,
    Hybrid,
    Electric,
    #[serde(other)]
    Other,
}

impl FuelType {
    pub fn label(&self) -> &'static str {
        match self {
            FuelType::Gasoline => "gasoline",
            FuelType::Diesel => "diesel",
            FuelType::Hybrid => "hybrid",
            FuelType::Electric => "electric",
            FuelType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Excellent,
    VeryGood,
    #[default]
    Good,
    Fair,
    Poor,
}

impl Condition {
    pub fn label(&self) -> &'static str {
        match self {
            Condition::Excellent => "excellent",
            Condition::VeryGood => "very good",
            Condition::Good => "good",
            Condition::Fair => "fair",
            Condition::Poor => "poor",
        }
    }
}

/// One valuation invocation. Built once per request and read-only afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct ValuationRequest {
    pub vehicle: VehicleProfile,
    pub mileage: u32,
    #[serde(default)]
    pub condition: Condition,
    pub location: String,
    #[serde(default)]
    pub premium: bool,
    #[serde(default)]
    pub force_refresh: bool,
}

/// Signed delta applied to the running value, with a human-readable reason.
/// The ordered sequence of adjustments is part of the audit trail; it is
/// appended in pipeline order and never reordered or deduplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub label: String,
    pub amount: f64,
    pub reason: String,
}

impl Adjustment {
    pub fn new(label: &str, amount: f64, reason: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            amount,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ListingSourceType {
    Marketplace,
    Certified,
    /// Synthetic or modeled prices. Shown for debugging, excluded from all
    /// anchoring and confidence math.
    Estimated,
}

/// One comparable listing produced by the market search orchestrator.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketListing {
    pub price: f64,
    #[serde(default)]
    pub mileage: Option<u32>,
    pub year: i32,
    pub make: String,
    pub model: String,
    #[serde(default)]
    pub trim: Option<String>,
    #[serde(default)]
    pub vin: Option<String>,
    pub source: String,
    pub source_type: ListingSourceType,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub confidence: f32,
}

impl MarketListing {
    /// Dedup key: VIN when present, identity of price+mileage+source otherwise.
    pub fn dedup_key(&self) -> String {
        match &self.vin {
            Some(vin) if !vin.trim().is_empty() => format!("vin:{}", vin.trim().to_uppercase()),
            _ => format!(
                "p:{:.0}|m:{}|s:{}",
                self.price,
                self.mileage.map(|m| m.to_string()).unwrap_or_default(),
                self.source
            ),
        }
    }

    pub fn matches_vin(&self, vin: &str) -> bool {
        !vin.trim().is_empty()
            && self
                .vin
                .as_deref()
                .map(|v| v.trim().eq_ignore_ascii_case(vin.trim()))
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    CacheExactVin,
    CacheSimilar,
    LlmRouted,
    DirectSearch,
    NoResults,
}

/// Outcome of one orchestration attempt over the source chain. Transient.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub listings: Vec<MarketListing>,
    pub sources: Vec<String>,
    pub trust_score: f32,
    pub method: SearchMethod,
    /// True when every attempted source returned an error (as opposed to
    /// returning cleanly with nothing). Feeds the `error` status, never a
    /// pipeline failure.
    pub all_sources_failed: bool,
}

impl SearchOutcome {
    pub fn empty() -> Self {
        Self {
            listings: Vec::new(),
            sources: Vec::new(),
            trust_score: 0.0,
            method: SearchMethod::NoResults,
            all_sources_failed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MarketSearchStatus {
    Success,
    Fallback,
    Error,
}

/// Named contributions to the final confidence score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub base: f32,
    pub exact_match_bonus: f32,
    pub multi_listing_bonus: f32,
    pub certified_bonus: f32,
    pub trusted_source_bonus: f32,
    pub trust_score_bonus: f32,
    pub final_score: u8,
    pub capped: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

/// Final output of the pipeline. Assembled once, immutable afterwards. Every
/// numeric field is always present; absence of data is expressed as 0 or the
/// configured floor, never as a missing field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationResult {
    pub vin: String,
    pub year: i32,
    pub make: String,
    pub model: String,
    #[serde(default)]
    pub trim: Option<String>,
    pub base_value: f64,
    pub adjustments: Vec<Adjustment>,
    pub final_value: f64,
    pub confidence: u8,
    pub confidence_breakdown: ConfidenceBreakdown,
    pub listing_count: usize,
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    pub market_search_status: MarketSearchStatus,
    pub sources: Vec<String>,
    pub explanation: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ValuationResponse {
    pub result: ValuationResult,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
