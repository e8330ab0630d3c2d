use crate::models::{Adjustment, ListingSourceType, MarketListing, VehicleProfile};

/// Renders the valuation narrative. Pure formatting over already-computed
/// fields; no lookups, no side effects, cannot fail.
pub fn render_explanation(
    profile: &VehicleProfile,
    base_value: f64,
    base_source_tag: &str,
    adjustments: &[Adjustment],
    validated: &[MarketListing],
    final_value: f64,
    confidence: u8,
) -> String {
    let mut out = String::new();

    let trim = profile
        .trim
        .as_deref()
        .map(|t| format!(" {t}"))
        .unwrap_or_default();
    out.push_str(&format!(
        "Valuation for {} {} {}{trim} (VIN {}).\n",
        profile.year, profile.make, profile.model, profile.vin
    ));
    out.push_str(&format!(
        "Base value: ${base_value:.0} ({}).\n",
        match base_source_tag {
            "msrp_db_lookup" => "suggested price lookup",
            "estimated_msrp" => "estimated from model family",
            other => other,
        }
    ));

    out.push_str("Adjustments:\n");
    for adjustment in adjustments {
        let sign = if adjustment.amount >= 0.0 { "+" } else { "-" };
        out.push_str(&format!(
            "  {sign}${:.0} {}: {}\n",
            adjustment.amount.abs(),
            adjustment.label,
            adjustment.reason
        ));
    }

    let real: Vec<f64> = validated
        .iter()
        .filter(|l| l.source_type != ListingSourceType::Estimated)
        .map(|l| l.price)
        .collect();
    if real.is_empty() {
        out.push_str("Market analysis: no live comparable listings were available; the value relies on the pricing model alone.\n");
    } else {
        let mut sorted = real.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let average = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let median = if sorted.len() % 2 == 1 {
            sorted[sorted.len() / 2]
        } else {
            (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
        };
        out.push_str(&format!(
            "Market analysis: {} comparable listings, min ${min:.0}, median ${median:.0}, average ${average:.0}, max ${max:.0}.\n",
            sorted.len()
        ));
    }

    out.push_str(&format!(
        "Final value: ${final_value:.0} with confidence {confidence}/100.\n"
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::{listing, request};

    #[test]
    fn narrative_lists_every_adjustment_in_order() {
        let adjustments = vec![
            Adjustment::new("depreciation", -1_000.0, "age"),
            Adjustment::new("mileage", 2_000.0, "below average"),
        ];
        let text = render_explanation(
            &request().vehicle,
            28_500.0,
            "msrp_db_lookup",
            &adjustments,
            &[],
            29_500.0,
            55,
        );
        let dep = text.find("depreciation").expect("depreciation line");
        let mileage = text.find("mileage").expect("mileage line");
        assert!(dep < mileage);
        assert!(text.contains("-$1000"));
        assert!(text.contains("+$2000"));
        assert!(text.contains("no live comparable listings"));
    }

    #[test]
    fn market_summary_reports_median_and_range() {
        let listings = vec![
            listing(27_000.0, 0),
            listing(28_000.0, 1),
            listing(29_500.0, 2),
        ];
        let text = render_explanation(
            &request().vehicle,
            28_500.0,
            "msrp_db_lookup",
            &[],
            &listings,
            28_400.0,
            70,
        );
        assert!(text.contains("3 comparable listings"));
        assert!(text.contains("min $27000"));
        assert!(text.contains("median $28000"));
        assert!(text.contains("max $29500"));
        assert!(text.contains("confidence 70/100"));
    }

    #[test]
    fn identical_inputs_render_identical_text() {
        let args = (
            request().vehicle,
            28_500.0,
            "estimated_msrp",
            vec![Adjustment::new("condition", 0.0, "good")],
        );
        let a = render_explanation(&args.0, args.1, args.2, &args.3, &[], 28_500.0, 45);
        let b = render_explanation(&args.0, args.1, args.2, &args.3, &[], 28_500.0, 45);
        assert_eq!(a, b);
    }
}
