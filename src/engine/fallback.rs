use super::base_price::depreciated_family_estimate;
use crate::models::VehicleProfile;
use tracing::warn;

/// Absolute floor on any value leaving the pipeline.
pub const VALUE_FLOOR: f64 = 8_000.0;
/// Confidence ceiling whenever the emergency estimate had to step in.
pub const EMERGENCY_CONFIDENCE_CAP: u8 = 60;

#[derive(Debug, Clone, Copy)]
pub struct GuaranteedValue {
    pub value: f64,
    pub emergency: bool,
}

/// The pipeline's correctness backstop. Runs unconditionally after anchoring:
/// an invalid running value is discarded for the deterministic emergency
/// estimate, and every value is floored and rounded to whole dollars.
pub fn guarantee_value(
    running_value: f64,
    profile: &VehicleProfile,
    as_of_year: i32,
) -> GuaranteedValue {
    let (value, emergency) = if running_value.is_finite() && running_value > 0.0 {
        (running_value, false)
    } else {
        warn!(
            target = "vantage.engine",
            vin = %profile.vin,
            running_value = running_value,
            "invalid running value, using emergency estimate"
        );
        (depreciated_family_estimate(profile, as_of_year), true)
    };

    GuaranteedValue {
        value: value.max(VALUE_FLOOR).round(),
        emergency,
    }
}
