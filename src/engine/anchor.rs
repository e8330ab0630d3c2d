use crate::models::{Adjustment, ListingSourceType, MarketListing, MarketSearchStatus};

/// Pull toward a confirmed exact-VIN listing.
const EXACT_MATCH_WEIGHT: f64 = 0.8;
/// Ceiling on how much a handful of comparable listings can move the value.
const PARTIAL_ANCHOR_CAP: f64 = 0.4;
/// Minimum comparable listings before the partial anchor applies at all.
const MIN_LISTINGS_FOR_ANCHOR: usize = 3;

#[derive(Debug, Clone)]
pub struct AnchorDecision {
    pub adjustment: Option<Adjustment>,
    pub status: MarketSearchStatus,
    pub source_tag: Option<&'static str>,
    pub exact_match: bool,
}

/// Nudges the running value toward validated market data. Exact identifier
/// matches dominate; thin samples get at most a bounded pull; anything less
/// leaves the model value untouched and flags the fallback status.
pub fn apply_market_anchor(
    running_value: f64,
    validated: &[MarketListing],
    request_vin: &str,
    trust_score: f32,
) -> AnchorDecision {
    let real: Vec<&MarketListing> = validated
        .iter()
        .filter(|l| l.source_type != ListingSourceType::Estimated)
        .collect();

    if let Some(exact) = real.iter().find(|l| l.matches_vin(request_vin)) {
        let delta = (exact.price - running_value) * EXACT_MATCH_WEIGHT;
        return AnchorDecision {
            adjustment: Some(Adjustment::new(
                "market_anchor",
                delta,
                format!(
                    "exact VIN match listed at ${:.0} on {}",
                    exact.price, exact.source
                ),
            )),
            status: MarketSearchStatus::Success,
            source_tag: Some("exact_vin_match"),
            exact_match: true,
        };
    }

    if real.len() >= MIN_LISTINGS_FOR_ANCHOR {
        let average = real.iter().map(|l| l.price).sum::<f64>() / real.len() as f64;
        let weight = (trust_score as f64).clamp(0.0, PARTIAL_ANCHOR_CAP);
        let delta = (average - running_value) * weight;
        return AnchorDecision {
            adjustment: Some(Adjustment::new(
                "market_anchor",
                delta,
                format!(
                    "{} comparable listings averaging ${average:.0}, weight {weight:.2}",
                    real.len()
                ),
            )),
            status: MarketSearchStatus::Success,
            source_tag: Some("market_listings"),
            exact_match: false,
        };
    }

    AnchorDecision {
        adjustment: None,
        status: MarketSearchStatus::Fallback,
        source_tag: None,
        exact_match: false,
    }
}
