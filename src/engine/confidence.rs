use crate::models::{ConfidenceBreakdown, ListingSourceType, MarketListing, MarketSearchStatus};

const BASE_SCORE: f32 = 55.0;
const BASE_SCORE_DEGRADED: f32 = 45.0;
const HARD_CAP: f32 = 95.0;
/// Without live market data the score can never look confident.
const NO_MARKET_DATA_CAP: f32 = 60.0;
const TRUST_BONUS_THRESHOLD: f32 = 0.7;

/// Domains whose listings earn the high-trust bonus. Narrower than the
/// validator allow-list on purpose.
const TRUSTED_DOMAINS: &[&str] = &[
    "autotrader.com",
    "cars.com",
    "cargurus.com",
    "carmax.com",
    "carvana.com",
];

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceInputs<'a> {
    pub validated: &'a [MarketListing],
    pub trust_score: f32,
    pub exact_match: bool,
    pub status: MarketSearchStatus,
    pub fallback_used: bool,
}

/// Computes the bounded 0-100 confidence score with its named contributions.
pub fn score_confidence(inputs: ConfidenceInputs<'_>) -> ConfidenceBreakdown {
    let real: Vec<&MarketListing> = inputs
        .validated
        .iter()
        .filter(|l| l.source_type != ListingSourceType::Estimated)
        .collect();

    let base = if inputs.fallback_used {
        BASE_SCORE_DEGRADED
    } else {
        BASE_SCORE
    };

    let exact_match_bonus = if inputs.exact_match { 20.0 } else { 0.0 };
    let multi_listing_bonus = if real.len() >= 2 { 10.0 } else { 0.0 };
    let certified_bonus = if real
        .iter()
        .any(|l| l.source_type == ListingSourceType::Certified)
    {
        5.0
    } else {
        0.0
    };
    let trusted_source_bonus = if real.iter().any(|l| trusted_domain(&l.url)) {
        5.0
    } else {
        0.0
    };
    let trust_score_bonus = if inputs.trust_score > TRUST_BONUS_THRESHOLD {
        let span = 1.0 - TRUST_BONUS_THRESHOLD;
        (((inputs.trust_score - TRUST_BONUS_THRESHOLD) / span) * 5.0).min(5.0)
    } else {
        0.0
    };

    let mut score = base
        + exact_match_bonus
        + multi_listing_bonus
        + certified_bonus
        + trusted_source_bonus
        + trust_score_bonus;

    let mut capped = false;
    if score > HARD_CAP {
        score = HARD_CAP;
        capped = true;
    }
    if inputs.status != MarketSearchStatus::Success && score > NO_MARKET_DATA_CAP {
        score = NO_MARKET_DATA_CAP;
        capped = true;
    }
    let score = score.clamp(0.0, 100.0);

    ConfidenceBreakdown {
        base,
        exact_match_bonus,
        multi_listing_bonus,
        certified_bonus,
        trusted_source_bonus,
        trust_score_bonus,
        final_score: score.round() as u8,
        capped,
    }
}

fn trusted_domain(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    TRUSTED_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::listing;

    fn inputs<'a>(validated: &'a [MarketListing]) -> ConfidenceInputs<'a> {
        ConfidenceInputs {
            validated,
            trust_score: 0.75,
            exact_match: false,
            status: MarketSearchStatus::Success,
            fallback_used: false,
        }
    }

    #[test]
    fn healthy_market_data_scores_above_fifty() {
        let listings: Vec<_> = (0..5).map(|i| listing(27_000.0 + i as f64 * 500.0, i)).collect();
        let breakdown = score_confidence(inputs(&listings));
        assert!(breakdown.final_score >= 50);
        assert_eq!(breakdown.base, BASE_SCORE);
        assert_eq!(breakdown.multi_listing_bonus, 10.0);
        assert_eq!(breakdown.trusted_source_bonus, 5.0);
    }

    #[test]
    fn exact_match_bonus_is_twenty() {
        let listings = vec![listing(27_000.0, 0)];
        let mut args = inputs(&listings);
        args.exact_match = true;
        let breakdown = score_confidence(args);
        assert_eq!(breakdown.exact_match_bonus, 20.0);
    }

    #[test]
    fn hard_cap_holds_at_ninety_five() {
        let mut listings: Vec<_> = (0..5).map(|i| listing(27_000.0 + i as f64, i)).collect();
        listings[0].source_type = ListingSourceType::Certified;
        let mut args = inputs(&listings);
        args.exact_match = true;
        args.trust_score = 1.0;
        let breakdown = score_confidence(args);
        assert_eq!(breakdown.final_score, 95);
        assert!(breakdown.capped);
    }

    #[test]
    fn non_success_status_caps_at_sixty() {
        let listings: Vec<_> = (0..5).map(|i| listing(27_000.0 + i as f64, i)).collect();
        let mut args = inputs(&listings);
        args.exact_match = true;
        args.status = MarketSearchStatus::Fallback;
        let breakdown = score_confidence(args);
        assert!(breakdown.final_score <= 60);
        assert!(breakdown.capped);
    }

    #[test]
    fn upstream_fallback_lowers_the_base() {
        let breakdown = score_confidence(ConfidenceInputs {
            validated: &[],
            trust_score: 0.0,
            exact_match: false,
            status: MarketSearchStatus::Fallback,
            fallback_used: true,
        });
        assert_eq!(breakdown.base, BASE_SCORE_DEGRADED);
        assert!(breakdown.final_score <= 60);
    }

    #[test]
    fn estimated_listings_earn_no_bonuses() {
        let mut stubs: Vec<_> = (0..4).map(|i| listing(20_000.0, i)).collect();
        for stub in &mut stubs {
            stub.source_type = ListingSourceType::Estimated;
        }
        let mut args = inputs(&stubs);
        args.status = MarketSearchStatus::Fallback;
        args.trust_score = 0.0;
        let breakdown = score_confidence(args);
        assert_eq!(breakdown.multi_listing_bonus, 0.0);
        assert_eq!(breakdown.trusted_source_bonus, 0.0);
    }
}
