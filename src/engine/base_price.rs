use crate::models::{FuelType, VehicleProfile};

/// Per-year retention applied when estimating from the family base table.
const RETENTION_PER_YEAR: f64 = 0.88;
/// An estimate never drops below this share of the nominal family base.
const ESTIMATE_FLOOR_RATIO: f64 = 0.40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasePriceSource {
    MsrpDbLookup,
    EstimatedMsrp,
}

impl BasePriceSource {
    pub fn tag(&self) -> &'static str {
        match self {
            BasePriceSource::MsrpDbLookup => "msrp_db_lookup",
            BasePriceSource::EstimatedMsrp => "estimated_msrp",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BasePrice {
    pub value: f64,
    pub source: BasePriceSource,
}

struct SuggestedPrice {
    make: &'static str,
    model: &'static str,
    trim: Option<&'static str>,
    year: i32,
    price: f64,
}

/// Known model-year suggested prices. A real deployment backs this with the
/// pricing database; the table covers the volume models we see most.
const SUGGESTED_PRICES: &[SuggestedPrice] = &[
    SuggestedPrice { make: "honda", model: "accord", trim: Some("lx"), year: 2019, price: 26_500.0 },
    SuggestedPrice { make: "honda", model: "accord", trim: Some("lx"), year: 2020, price: 27_200.0 },
    SuggestedPrice { make: "honda", model: "accord", trim: Some("lx"), year: 2021, price: 28_500.0 },
    SuggestedPrice { make: "honda", model: "accord", trim: Some("lx"), year: 2022, price: 29_100.0 },
    SuggestedPrice { make: "honda", model: "accord", trim: Some("sport"), year: 2021, price: 30_300.0 },
    SuggestedPrice { make: "honda", model: "accord", trim: None, year: 2021, price: 28_900.0 },
    SuggestedPrice { make: "honda", model: "civic", trim: None, year: 2021, price: 23_400.0 },
    SuggestedPrice { make: "honda", model: "cr-v", trim: None, year: 2021, price: 27_900.0 },
    SuggestedPrice { make: "toyota", model: "camry", trim: None, year: 2021, price: 27_300.0 },
    SuggestedPrice { make: "toyota", model: "corolla", trim: None, year: 2021, price: 21_500.0 },
    SuggestedPrice { make: "toyota", model: "rav4", trim: None, year: 2021, price: 28_800.0 },
    SuggestedPrice { make: "toyota", model: "tacoma", trim: None, year: 2021, price: 30_500.0 },
    SuggestedPrice { make: "ford", model: "f-150", trim: None, year: 2021, price: 36_900.0 },
    SuggestedPrice { make: "ford", model: "escape", trim: None, year: 2021, price: 26_800.0 },
    SuggestedPrice { make: "chevrolet", model: "silverado 1500", trim: None, year: 2021, price: 35_600.0 },
    SuggestedPrice { make: "chevrolet", model: "equinox", trim: None, year: 2021, price: 25_800.0 },
    SuggestedPrice { make: "tesla", model: "model 3", trim: None, year: 2021, price: 41_200.0 },
    SuggestedPrice { make: "tesla", model: "model y", trim: None, year: 2021, price: 49_900.0 },
    SuggestedPrice { make: "bmw", model: "3 series", trim: None, year: 2021, price: 43_800.0 },
    SuggestedPrice { make: "nissan", model: "altima", trim: None, year: 2021, price: 25_300.0 },
    SuggestedPrice { make: "hyundai", model: "elantra", trim: None, year: 2021, price: 21_100.0 },
    SuggestedPrice { make: "subaru", model: "outback", trim: None, year: 2021, price: 28_100.0 },
];

/// Nominal family base by make, used when the model-year lookup misses.
fn family_base(profile: &VehicleProfile) -> f64 {
    let mut base = match profile.make.trim().to_lowercase().as_str() {
        "toyota" | "honda" | "mazda" | "subaru" => 27_000.0,
        "ford" | "chevrolet" | "gmc" | "ram" => 32_000.0,
        "nissan" | "hyundai" | "kia" | "volkswagen" => 25_000.0,
        "bmw" | "audi" | "lexus" | "acura" | "volvo" => 45_000.0,
        "mercedes-benz" | "mercedes" | "porsche" => 55_000.0,
        "tesla" | "rivian" | "lucid" => 48_000.0,
        _ => 25_000.0,
    };
    if let Some(body) = profile.body_type.as_deref() {
        let body = body.to_lowercase();
        if body.contains("truck") || body.contains("pickup") || body.contains("suv") {
            base *= 1.15;
        }
    }
    if matches!(profile.fuel_type, FuelType::Electric) {
        base *= 1.10;
    }
    base
}

/// Look up a suggested price for this exact configuration, or estimate one
/// from the family base and the depreciation curve. Never fails: missing data
/// degrades to the estimate branch.
pub fn resolve_base_price(profile: &VehicleProfile, as_of_year: i32) -> BasePrice {
    if let Some(price) = lookup_suggested(profile) {
        return BasePrice {
            value: price,
            source: BasePriceSource::MsrpDbLookup,
        };
    }
    BasePrice {
        value: depreciated_family_estimate(profile, as_of_year),
        source: BasePriceSource::EstimatedMsrp,
    }
}

/// The family-base depreciation curve, shared with the emergency estimator.
pub fn depreciated_family_estimate(profile: &VehicleProfile, as_of_year: i32) -> f64 {
    let nominal = family_base(profile);
    let age = (as_of_year - profile.year).clamp(0, 30);
    let depreciated = nominal * RETENTION_PER_YEAR.powi(age);
    depreciated.max(nominal * ESTIMATE_FLOOR_RATIO)
}

fn lookup_suggested(profile: &VehicleProfile) -> Option<f64> {
    let make = profile.make.trim().to_lowercase();
    let model = profile.model.trim().to_lowercase();
    let trim = profile
        .trim
        .as_deref()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty());

    let mut trim_agnostic: Option<f64> = None;
    for entry in SUGGESTED_PRICES {
        if entry.make != make || entry.model != model || entry.year != profile.year {
            continue;
        }
        match (entry.trim, trim.as_deref()) {
            (Some(entry_trim), Some(requested)) if entry_trim == requested => {
                return Some(entry.price);
            }
            (None, _) => trim_agnostic = Some(entry.price),
            _ => {}
        }
    }
    trim_agnostic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FuelType;

    fn profile(make: &str, model: &str, trim: Option<&str>, year: i32) -> VehicleProfile {
        VehicleProfile {
            vin: "TESTVIN0000000000".into(),
            year,
            make: make.into(),
            model: model.into(),
            trim: trim.map(|t| t.into()),
            fuel_type: FuelType::Gasoline,
            body_type: None,
        }
    }

    #[test]
    fn exact_trim_lookup_wins() {
        let resolved = resolve_base_price(&profile("Honda", "Accord", Some("LX"), 2021), 2026);
        assert_eq!(resolved.value, 28_500.0);
        assert_eq!(resolved.source, BasePriceSource::MsrpDbLookup);
    }

    #[test]
    fn unknown_trim_falls_back_to_trim_agnostic_row() {
        let resolved = resolve_base_price(&profile("Honda", "Accord", Some("EX-L"), 2021), 2026);
        assert_eq!(resolved.value, 28_900.0);
        assert_eq!(resolved.source, BasePriceSource::MsrpDbLookup);
    }

    #[test]
    fn unknown_model_estimates_and_never_fails() {
        let resolved = resolve_base_price(&profile("Zorch", "Whirlwind", None, 2010), 2026);
        assert_eq!(resolved.source, BasePriceSource::EstimatedMsrp);
        assert!(resolved.value > 0.0);
        // 16 model years decays to the 40% floor.
        assert_eq!(resolved.value, 25_000.0 * 0.40);
    }

    #[test]
    fn estimate_is_floored_at_forty_percent_of_nominal() {
        let old = resolve_base_price(&profile("Toyota", "Cressida", None, 1992), 2026);
        assert_eq!(old.value, 27_000.0 * 0.40);
    }

    #[test]
    fn future_model_year_does_not_inflate_the_estimate() {
        let next_year = resolve_base_price(&profile("Zorch", "Whirlwind", None, 2027), 2026);
        assert_eq!(next_year.value, 25_000.0);
    }
}
