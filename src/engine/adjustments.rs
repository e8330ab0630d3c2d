use crate::models::{Adjustment, Condition, FuelType, ValuationRequest};

const EXPECTED_MILES_PER_YEAR: f64 = 12_000.0;
const MILEAGE_RATE_PER_MILE: f64 = 0.08;
const MILEAGE_CAP: f64 = 2_500.0;
/// Model years that depreciate before the age-based step kicks in are already
/// priced into the suggested-price table.
const DEPRECIATION_GRACE_YEARS: i32 = 2;

/// Output of one full pass over the adjustment chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentRun {
    pub adjustments: Vec<Adjustment>,
    pub value: f64,
    pub fuel_degraded: bool,
}

/// Applies the fixed adjustment chain: depreciation, mileage, condition,
/// fuel-cost context, equipment packages. Exactly one record per step, in
/// this order, every time; a step with nothing to say records a zero delta.
/// Pure function of its inputs, so identical inputs reproduce identical
/// adjustment lists.
pub fn apply_adjustments(request: &ValuationRequest, base_value: f64, as_of_year: i32) -> AdjustmentRun {
    let mut value = base_value;
    let mut adjustments = Vec::with_capacity(5);

    let dep = depreciation(request, value, as_of_year);
    value += dep.amount;
    adjustments.push(dep);

    let mileage = mileage_adjustment(request, as_of_year);
    value += mileage.amount;
    adjustments.push(mileage);

    let condition = condition_adjustment(request.condition, value);
    value += condition.amount;
    adjustments.push(condition);

    let (fuel, fuel_degraded) = fuel_cost_adjustment(request);
    value += fuel.amount;
    adjustments.push(fuel);

    let packages = package_adjustment(request);
    value += packages.amount;
    adjustments.push(packages);

    AdjustmentRun {
        adjustments,
        value,
        fuel_degraded,
    }
}

fn depreciation(request: &ValuationRequest, value: f64, as_of_year: i32) -> Adjustment {
    let age = (as_of_year - request.vehicle.year).clamp(0, 40);
    let charged_years = (age - DEPRECIATION_GRACE_YEARS).max(0);
    let (rate_per_year, cap) = match request.vehicle.fuel_type {
        FuelType::Electric => (0.020, 0.15),
        FuelType::Hybrid => (0.012, 0.10),
        _ => (0.015, 0.12),
    };
    let rate = (charged_years as f64 * rate_per_year).min(cap);
    Adjustment::new(
        "depreciation",
        -(value * rate),
        format!(
            "{age} model years old ({} fuel), {:.1}% age depreciation",
            request.vehicle.fuel_type.label(),
            rate * 100.0
        ),
    )
}

fn mileage_adjustment(request: &ValuationRequest, as_of_year: i32) -> Adjustment {
    let age = (as_of_year - request.vehicle.year).clamp(0, 40).max(1);
    let expected = EXPECTED_MILES_PER_YEAR * age as f64;
    let delta_miles = expected - request.mileage as f64;
    let amount = (delta_miles * MILEAGE_RATE_PER_MILE).clamp(-MILEAGE_CAP, MILEAGE_CAP);
    let direction = if delta_miles >= 0.0 { "below" } else { "above" };
    Adjustment::new(
        "mileage",
        amount,
        format!(
            "{} miles vs {:.0} expected ({} average)",
            request.mileage, expected, direction
        ),
    )
}

fn condition_adjustment(condition: Condition, value: f64) -> Adjustment {
    let rate = match condition {
        Condition::Excellent => 0.05,
        Condition::VeryGood => 0.02,
        Condition::Good => 0.0,
        Condition::Fair => -0.10,
        Condition::Poor => -0.25,
    };
    Adjustment::new(
        "condition",
        value * rate,
        format!("reported condition: {}", condition.label()),
    )
}

/// Average regional pump price by leading zip digit, against a national
/// reference. Unknown regions degrade to a zero adjustment, never an error.
fn fuel_cost_adjustment(request: &ValuationRequest) -> (Adjustment, bool) {
    const NATIONAL_AVG: f64 = 3.25;
    let regional = request
        .location
        .chars()
        .find(|c| c.is_ascii_digit())
        .map(|digit| match digit {
            '0' => 3.30,
            '1' => 3.25,
            '2' => 3.15,
            '3' => 3.05,
            '4' => 3.10,
            '5' => 3.00,
            '6' => 3.05,
            '7' => 2.95,
            '8' => 3.35,
            _ => 4.05,
        });

    let Some(price) = regional else {
        return (
            Adjustment::new(
                "fuel_cost",
                0.0,
                format!(
                    "regional fuel cost unavailable for `{}`",
                    request.location.trim()
                ),
            ),
            true,
        );
    };

    let diff = price - NATIONAL_AVG;
    let factor = match request.vehicle.fuel_type {
        FuelType::Gasoline => -800.0,
        FuelType::Diesel => -600.0,
        FuelType::Hybrid => 400.0,
        FuelType::Electric => 700.0,
        FuelType::Other => 0.0,
    };
    let amount = diff * factor;
    (
        Adjustment::new(
            "fuel_cost",
            amount,
            format!(
                "regional fuel at ${price:.2}/gal vs ${NATIONAL_AVG:.2} national, {} vehicle",
                request.vehicle.fuel_type.label()
            ),
        ),
        false,
    )
}

struct EquipmentPackage {
    keyword: &'static str,
    name: &'static str,
    value: f64,
}

const EQUIPMENT_PACKAGES: &[EquipmentPackage] = &[
    EquipmentPackage { keyword: "touring", name: "Touring package", value: 1_500.0 },
    EquipmentPackage { keyword: "platinum", name: "Platinum package", value: 1_800.0 },
    EquipmentPackage { keyword: "limited", name: "Limited package", value: 1_200.0 },
    EquipmentPackage { keyword: "premium", name: "Premium package", value: 900.0 },
    EquipmentPackage { keyword: "sport", name: "Sport package", value: 700.0 },
    EquipmentPackage { keyword: "trd", name: "TRD package", value: 1_000.0 },
    EquipmentPackage { keyword: "ex-l", name: "Leather package", value: 800.0 },
];

fn package_adjustment(request: &ValuationRequest) -> Adjustment {
    let haystack = format!(
        "{} {}",
        request.vehicle.model,
        request.vehicle.trim.as_deref().unwrap_or_default()
    )
    .to_lowercase();

    let mut total = 0.0;
    let mut names: Vec<&'static str> = Vec::new();
    for package in EQUIPMENT_PACKAGES {
        if haystack.contains(package.keyword) {
            total += package.value;
            names.push(package.name);
        }
    }

    let reason = if names.is_empty() {
        "no equipment packages detected".to_string()
    } else {
        format!("detected packages: {}", names.join(", "))
    };
    Adjustment::new("equipment_packages", total, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::request;

    #[test]
    fn chain_always_appends_five_records_in_order() {
        let run = apply_adjustments(&request(), 28_500.0, 2026);
        let labels: Vec<&str> = run.adjustments.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "depreciation",
                "mileage",
                "condition",
                "fuel_cost",
                "equipment_packages"
            ]
        );
    }

    #[test]
    fn chain_is_deterministic() {
        let first = apply_adjustments(&request(), 28_500.0, 2026);
        let second = apply_adjustments(&request(), 28_500.0, 2026);
        assert_eq!(first, second);
    }

    #[test]
    fn low_mileage_earns_a_capped_bonus() {
        let mut req = request();
        req.mileage = 5_000;
        let run = apply_adjustments(&req, 28_500.0, 2026);
        let mileage = &run.adjustments[1];
        assert_eq!(mileage.amount, MILEAGE_CAP);
    }

    #[test]
    fn poor_condition_cuts_a_quarter() {
        let mut req = request();
        req.condition = crate::models::Condition::Poor;
        let run = apply_adjustments(&req, 20_000.0, 2026);
        let condition = &run.adjustments[2];
        assert!(condition.amount < 0.0);
        let value_before = 20_000.0 + run.adjustments[0].amount + run.adjustments[1].amount;
        assert!((condition.amount - value_before * -0.25).abs() < 1e-6);
    }

    #[test]
    fn good_condition_records_a_zero_delta() {
        let run = apply_adjustments(&request(), 28_500.0, 2026);
        assert_eq!(run.adjustments[2].amount, 0.0);
    }

    #[test]
    fn unknown_region_degrades_to_zero_fuel_adjustment() {
        let mut req = request();
        req.location = "OUTBACK".into();
        let run = apply_adjustments(&req, 28_500.0, 2026);
        assert!(run.fuel_degraded);
        assert_eq!(run.adjustments[3].amount, 0.0);
        assert!(run.adjustments[3].reason.contains("unavailable"));
    }

    #[test]
    fn touring_trim_detects_a_package() {
        let mut req = request();
        req.vehicle.trim = Some("Touring".into());
        let run = apply_adjustments(&req, 28_500.0, 2026);
        assert_eq!(run.adjustments[4].amount, 1_500.0);
        assert!(run.adjustments[4].reason.contains("Touring"));
    }

    #[test]
    fn electric_vehicles_depreciate_faster() {
        let mut req = request();
        req.vehicle.fuel_type = crate::models::FuelType::Electric;
        let ev = apply_adjustments(&req, 28_500.0, 2026);
        let gas = apply_adjustments(&request(), 28_500.0, 2026);
        assert!(ev.adjustments[0].amount < gas.adjustments[0].amount);
    }
}
