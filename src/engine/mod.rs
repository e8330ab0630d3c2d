mod adjustments;
mod anchor;
mod base_price;
mod confidence;
mod explain;
mod fallback;

pub use adjustments::{AdjustmentRun, apply_adjustments};
pub use anchor::{AnchorDecision, apply_market_anchor};
pub use base_price::{BasePrice, BasePriceSource, resolve_base_price};
pub use confidence::{ConfidenceInputs, score_confidence};
pub use explain::render_explanation;
pub use fallback::{EMERGENCY_CONFIDENCE_CAP, VALUE_FLOOR, guarantee_value};

use crate::events::{PipelineEvents, TracingEvents};
use crate::llm::{LlmClient, LlmConfig};
use crate::market::{
    CacheSource, DirectSearchSource, ListingValidator, LiveSearchClient, LlmRoutedSource,
    MarketSearchOrchestrator, ValidatorConfig,
};
use crate::models::{
    MarketListing, MarketSearchStatus, PriceRange, SearchMethod, SearchOutcome, StageReport,
    ValuationRequest, ValuationResponse, ValuationResult,
};
use chrono::{Datelike, Utc};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

const MAX_REQUEST_MILEAGE: u32 = 1_000_000;
const MIN_REQUEST_YEAR: i32 = 1900;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct EngineError {
    stage: &'static str,
    message: String,
    kind: EngineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    InvalidInput,
    Internal,
}

impl EngineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: EngineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: EngineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> EngineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// The valuation pipeline. One request in, one result out, stages strictly
/// sequential; every failure below request validation is absorbed into the
/// result rather than surfaced.
#[derive(Clone)]
pub struct ValuationEngine {
    pub llm: Arc<LlmClient>,
    orchestrator: Arc<MarketSearchOrchestrator>,
    validator: Arc<ListingValidator>,
    events: Arc<dyn PipelineEvents>,
}

impl ValuationEngine {
    pub fn new() -> Self {
        let llm = Arc::new(LlmClient::new(LlmConfig::from_env()));
        let live = LiveSearchClient::from_env();
        let cache = CacheSource::from_env()
            .map(|source| Arc::new(source) as Arc<dyn crate::market::ListingSource>);
        let llm_source = Arc::new(LlmRoutedSource::new(llm.clone(), live.clone()))
            as Arc<dyn crate::market::ListingSource>;
        let direct_source =
            Arc::new(DirectSearchSource::new(live)) as Arc<dyn crate::market::ListingSource>;
        let orchestrator = Arc::new(MarketSearchOrchestrator::new(
            cache,
            vec![llm_source, direct_source],
        ));
        let validator = Arc::new(ListingValidator::new(ValidatorConfig::from_env()));
        Self {
            llm,
            orchestrator,
            validator,
            events: Arc::new(TracingEvents),
        }
    }

    /// Assemble an engine from injected parts. Tests use this to stub the
    /// source chain and swap in a recording event emitter.
    pub fn with_parts(
        orchestrator: MarketSearchOrchestrator,
        validator: ListingValidator,
        events: Arc<dyn PipelineEvents>,
    ) -> Self {
        Self {
            llm: Arc::new(LlmClient::new(LlmConfig::from_env())),
            orchestrator: Arc::new(orchestrator),
            validator: Arc::new(validator),
            events,
        }
    }

    // Public wrappers for granular stage endpoints
    pub fn stage_base_price(&self, vehicle: &crate::models::VehicleProfile) -> BasePrice {
        resolve_base_price(vehicle, Utc::now().year())
    }

    pub fn stage_adjustments(&self, request: &ValuationRequest, base_value: f64) -> AdjustmentRun {
        apply_adjustments(request, base_value, Utc::now().year())
    }

    pub async fn stage_market_search(&self, request: &ValuationRequest) -> SearchOutcome {
        self.orchestrator.search(request).await
    }

    /// The outbound `computeValuation` operation: validation errors surface,
    /// nothing else does.
    pub async fn run(&self, request: ValuationRequest) -> Result<ValuationResponse, EngineError> {
        validate_request(&request)?;
        Ok(self.run_lenient(request).await)
    }

    /// Infallible variant. A request that fails validation skips straight to
    /// the emergency estimate instead of erroring; used where a result is
    /// needed no matter what came in.
    pub async fn run_lenient(&self, request: ValuationRequest) -> ValuationResponse {
        let as_of_year = Utc::now().year();
        let mut stages: Vec<StageReport> = Vec::new();

        if let Err(err) = validate_request(&request) {
            self.events.stage_fallback("validate_request", err.detail());
            return self.emergency_response(&request, as_of_year, stages);
        }

        let base = self
            .capture_stage("resolve_base_price", &mut stages, {
                let vehicle = request.vehicle.clone();
                async move {
                    let resolved = resolve_base_price(&vehicle, as_of_year);
                    StageOutcome::new(
                        resolved,
                        json!({
                            "value": resolved.value,
                            "source": resolved.source.tag(),
                        }),
                    )
                }
            })
            .await;
        if base.source == BasePriceSource::EstimatedMsrp {
            self.events
                .stage_fallback("resolve_base_price", "estimated_msrp");
        }

        let run = self
            .capture_stage("apply_adjustments", &mut stages, {
                let request = request.clone();
                async move {
                    let run = apply_adjustments(&request, base.value, as_of_year);
                    StageOutcome::new(
                        run.clone(),
                        json!({
                            "adjustments": run.adjustments,
                            "running_value": run.value,
                            "fuel_degraded": run.fuel_degraded,
                        }),
                    )
                }
            })
            .await;
        if run.fuel_degraded {
            self.events
                .stage_fallback("apply_adjustments", "fuel_cost_unavailable");
        }

        let outcome = self
            .capture_stage("market_search", &mut stages, {
                let orchestrator = self.orchestrator.clone();
                let request = request.clone();
                async move {
                    let outcome = orchestrator.search(&request).await;
                    StageOutcome::new(
                        outcome.clone(),
                        json!({
                            "count": outcome.listings.len(),
                            "method": outcome.method,
                            "sources": outcome.sources,
                            "trust_score": outcome.trust_score,
                        }),
                    )
                }
            })
            .await;
        if outcome.method == SearchMethod::NoResults {
            self.events.stage_fallback("market_search", "no_results");
        }

        let validated = self
            .capture_stage("validate_listings", &mut stages, {
                let validator = self.validator.clone();
                let listings = outcome.listings.clone();
                async move {
                    let before = listings.len();
                    let kept = validator.validate(listings).await;
                    let output = json!({
                        "kept": kept.len(),
                        "dropped": before - kept.len(),
                    });
                    StageOutcome::new(kept, output)
                }
            })
            .await;

        let mut adjustments = run.adjustments;
        let mut running_value = run.value;
        let decision = self
            .capture_stage("market_anchor", &mut stages, {
                let validated = validated.clone();
                let vin = request.vehicle.vin.clone();
                let trust = outcome.trust_score;
                async move {
                    let decision = apply_market_anchor(running_value, &validated, &vin, trust);
                    let output = json!({
                        "applied": decision.adjustment.is_some(),
                        "status": decision.status,
                        "source_tag": decision.source_tag,
                    });
                    StageOutcome::new(decision, output)
                }
            })
            .await;
        if let Some(anchor) = decision.adjustment.clone() {
            running_value += anchor.amount;
            adjustments.push(anchor);
        } else {
            self.events.stage_fallback("market_anchor", "no_anchor");
        }

        let status = if outcome.all_sources_failed {
            MarketSearchStatus::Error
        } else {
            decision.status
        };
        let fallback_used = base.source == BasePriceSource::EstimatedMsrp
            || run.fuel_degraded
            || outcome.method == SearchMethod::NoResults
            || outcome.all_sources_failed;

        let mut breakdown = self
            .capture_stage("score_confidence", &mut stages, {
                let validated = validated.clone();
                async move {
                    let breakdown = score_confidence(ConfidenceInputs {
                        validated: &validated,
                        trust_score: outcome.trust_score,
                        exact_match: decision.exact_match,
                        status,
                        fallback_used,
                    });
                    let output = json!({
                        "final_score": breakdown.final_score,
                        "capped": breakdown.capped,
                    });
                    StageOutcome::new(breakdown, output)
                }
            })
            .await;

        let guaranteed = self
            .capture_stage("guarantee_value", &mut stages, {
                let vehicle = request.vehicle.clone();
                async move {
                    let out = guarantee_value(running_value, &vehicle, as_of_year);
                    StageOutcome::new(
                        out,
                        json!({
                            "final_value": out.value,
                            "emergency": out.emergency,
                        }),
                    )
                }
            })
            .await;
        if guaranteed.emergency {
            self.events
                .stage_fallback("guarantee_value", "emergency_fallback");
            if breakdown.final_score > EMERGENCY_CONFIDENCE_CAP {
                breakdown.final_score = EMERGENCY_CONFIDENCE_CAP;
                breakdown.capped = true;
            }
        }

        let mut sources = vec![base.source.tag().to_string()];
        sources.extend(outcome.sources.clone());
        match decision.source_tag {
            Some(tag) => sources.push(tag.to_string()),
            None => sources.push("fallback_algorithm".to_string()),
        }
        if guaranteed.emergency {
            sources.push("emergency_fallback".to_string());
        }

        let explanation = self
            .capture_stage("render_explanation", &mut stages, {
                let vehicle = request.vehicle.clone();
                let adjustments = adjustments.clone();
                let validated = validated.clone();
                let base_tag = base.source.tag();
                let confidence = breakdown.final_score;
                async move {
                    let text = render_explanation(
                        &vehicle,
                        base.value,
                        base_tag,
                        &adjustments,
                        &validated,
                        guaranteed.value,
                        confidence,
                    );
                    let output = json!({ "chars": text.len() });
                    StageOutcome::new(text, output)
                }
            })
            .await;

        let result = assemble_result(
            &request,
            base,
            adjustments,
            &validated,
            guaranteed.value,
            breakdown,
            status,
            sources,
            explanation,
        );
        ValuationResponse { result, stages }
    }

    /// Emergency-only path for requests the validator rejected. Purely
    /// deterministic: depreciation curve, floor, capped confidence.
    fn emergency_response(
        &self,
        request: &ValuationRequest,
        as_of_year: i32,
        mut stages: Vec<StageReport>,
    ) -> ValuationResponse {
        let started = Instant::now();
        let guaranteed = guarantee_value(f64::NAN, &request.vehicle, as_of_year);
        let mut breakdown = score_confidence(ConfidenceInputs {
            validated: &[],
            trust_score: 0.0,
            exact_match: false,
            status: MarketSearchStatus::Fallback,
            fallback_used: true,
        });
        breakdown.final_score = breakdown.final_score.min(EMERGENCY_CONFIDENCE_CAP);
        let sources = vec![
            "estimated_msrp".to_string(),
            "fallback_algorithm".to_string(),
            "emergency_fallback".to_string(),
        ];
        let explanation = render_explanation(
            &request.vehicle,
            guaranteed.value,
            "estimated_msrp",
            &[],
            &[],
            guaranteed.value,
            breakdown.final_score,
        );
        stages.push(StageReport::new(
            "guarantee_value",
            started.elapsed().as_millis(),
            json!({
                "final_value": guaranteed.value,
                "emergency": true,
            }),
        ));
        let result = assemble_result(
            request,
            BasePrice {
                value: guaranteed.value,
                source: BasePriceSource::EstimatedMsrp,
            },
            Vec::new(),
            &[],
            guaranteed.value,
            breakdown,
            MarketSearchStatus::Fallback,
            sources,
            explanation,
        );
        ValuationResponse { result, stages }
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> T
    where
        Fut: Future<Output = StageOutcome<T>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        self.events.stage_completed(name, elapsed_ms, &outcome.output);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        outcome.value
    }
}

impl Default for ValuationEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_request(request: &ValuationRequest) -> Result<(), EngineError> {
    let vehicle = &request.vehicle;
    if vehicle.vin.trim().is_empty() {
        return Err(EngineError::invalid_input("validate_request", "missing_vin"));
    }
    if vehicle.make.trim().is_empty() || vehicle.model.trim().is_empty() {
        return Err(EngineError::invalid_input(
            "validate_request",
            "missing_make_or_model",
        ));
    }
    let current_year = Utc::now().year();
    if vehicle.year < MIN_REQUEST_YEAR || vehicle.year > current_year + 1 {
        return Err(EngineError::invalid_input(
            "validate_request",
            format!("year_out_of_range: {}", vehicle.year),
        ));
    }
    if request.mileage > MAX_REQUEST_MILEAGE {
        return Err(EngineError::invalid_input(
            "validate_request",
            format!("mileage_out_of_range: {}", request.mileage),
        ));
    }
    if request.location.trim().is_empty() {
        return Err(EngineError::invalid_input(
            "validate_request",
            "missing_location",
        ));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn assemble_result(
    request: &ValuationRequest,
    base: BasePrice,
    adjustments: Vec<crate::models::Adjustment>,
    validated: &[MarketListing],
    final_value: f64,
    breakdown: crate::models::ConfidenceBreakdown,
    status: MarketSearchStatus,
    sources: Vec<String>,
    explanation: String,
) -> ValuationResult {
    let real: Vec<f64> = validated
        .iter()
        .filter(|l| l.source_type != crate::models::ListingSourceType::Estimated)
        .map(|l| l.price)
        .collect();
    let price_range = if real.is_empty() {
        None
    } else {
        let min = real.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = real.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Some(PriceRange { min, max })
    };
    let confidence = breakdown.final_score.min(100);

    ValuationResult {
        vin: request.vehicle.vin.clone(),
        year: request.vehicle.year,
        make: request.vehicle.make.clone(),
        model: request.vehicle.model.clone(),
        trim: request.vehicle.trim.clone(),
        base_value: base.value,
        adjustments,
        final_value,
        confidence,
        confidence_breakdown: breakdown,
        listing_count: real.len(),
        price_range,
        market_search_status: status,
        sources,
        explanation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEvents;
    use crate::market::testing::{StaticSource, listing, request};
    use crate::market::{ListingValidator, MarketSearchOrchestrator, SourceYield, ValidatorConfig};
    use crate::models::{Condition, FuelType, VehicleProfile};

    fn engine_with_cache(prices: &[f64]) -> ValuationEngine {
        let cache = Arc::new(StaticSource {
            source_name: "listing_cache",
            result: Ok(SourceYield {
                listings: prices.iter().map(|p| listing(*p, 1)).collect(),
                trust_score: 0.75,
                method: SearchMethod::CacheSimilar,
            }),
        });
        ValuationEngine::with_parts(
            MarketSearchOrchestrator::new(Some(cache), vec![]),
            ListingValidator::new(ValidatorConfig::default()),
            Arc::new(TracingEvents),
        )
    }

    fn engine_without_listings() -> ValuationEngine {
        let cache = Arc::new(StaticSource {
            source_name: "listing_cache",
            result: Ok(SourceYield {
                listings: vec![],
                trust_score: 0.0,
                method: SearchMethod::CacheSimilar,
            }),
        });
        ValuationEngine::with_parts(
            MarketSearchOrchestrator::new(Some(cache), vec![]),
            ListingValidator::new(ValidatorConfig::default()),
            Arc::new(TracingEvents),
        )
    }

    #[tokio::test]
    async fn accord_with_five_listings_lands_in_the_market_band() {
        let engine =
            engine_with_cache(&[27_000.0, 28_000.0, 28_500.0, 29_000.0, 29_500.0]);
        let response = engine.run(request()).await.expect("valuation");
        let result = &response.result;
        assert!(result.final_value >= 27_000.0 && result.final_value <= 30_000.0);
        assert_eq!(result.market_search_status, MarketSearchStatus::Success);
        assert!(result.sources.iter().any(|s| s == "market_listings"));
        assert!(result.confidence >= 50);
        assert_eq!(result.listing_count, 5);
        assert_eq!(
            result.price_range,
            Some(crate::models::PriceRange {
                min: 27_000.0,
                max: 29_500.0
            })
        );
    }

    #[tokio::test]
    async fn zero_listings_falls_back_with_capped_confidence() {
        let engine = engine_without_listings();
        let response = engine.run(request()).await.expect("valuation");
        let result = &response.result;
        assert!(result.final_value >= 15_000.0 && result.final_value <= 35_000.0);
        assert_ne!(result.market_search_status, MarketSearchStatus::Success);
        assert!(result.sources.iter().any(|s| s == "fallback_algorithm"));
        assert!(result.confidence <= 60);
        assert_eq!(result.listing_count, 0);
        assert!(result.price_range.is_none());
        assert!(!result.explanation.is_empty());
    }

    #[tokio::test]
    async fn exact_vin_match_forces_success_and_references_the_source() {
        let mut exact = listing(29_000.0, 0);
        exact.vin = Some("1HGCV1F34MA012345".into());
        exact.source = "carvana".into();
        exact.url = "https://www.carvana.com/vehicle/1".into();
        let cache = Arc::new(StaticSource {
            source_name: "listing_cache",
            result: Ok(SourceYield {
                listings: vec![exact],
                trust_score: 0.9,
                method: SearchMethod::CacheExactVin,
            }),
        });
        let engine = ValuationEngine::with_parts(
            MarketSearchOrchestrator::new(Some(cache), vec![]),
            ListingValidator::new(ValidatorConfig::default()),
            Arc::new(TracingEvents),
        );
        let response = engine.run(request()).await.expect("valuation");
        let result = &response.result;
        assert_eq!(result.market_search_status, MarketSearchStatus::Success);
        assert!(result.sources.iter().any(|s| s == "exact_vin_match"));
        let anchor = result
            .adjustments
            .iter()
            .find(|a| a.label == "market_anchor")
            .expect("anchor adjustment");
        assert!(anchor.reason.contains("carvana"));
    }

    #[tokio::test]
    async fn two_listings_add_no_anchor_adjustment() {
        let engine = engine_with_cache(&[27_000.0, 28_000.0]);
        let response = engine.run(request()).await.expect("valuation");
        assert!(
            !response
                .result
                .adjustments
                .iter()
                .any(|a| a.label == "market_anchor")
        );
        assert_eq!(
            response.result.market_search_status,
            MarketSearchStatus::Fallback
        );
    }

    #[tokio::test]
    async fn malformed_request_still_yields_a_positive_emergency_estimate() {
        let garbage = ValuationRequest {
            vehicle: VehicleProfile {
                vin: "GARBAGE000000000".into(),
                year: -3,
                make: String::new(),
                model: String::new(),
                trim: None,
                fuel_type: FuelType::Other,
                body_type: None,
            },
            mileage: 9_999_999,
            condition: Condition::Poor,
            location: String::new(),
            premium: false,
            force_refresh: false,
        };
        let engine = engine_without_listings();
        let response = engine.run_lenient(garbage).await;
        let result = &response.result;
        assert!(result.final_value > 0.0);
        assert!(result.final_value >= VALUE_FLOOR);
        assert!(result.sources.iter().any(|s| s == "emergency_fallback"));
        assert!(result.confidence <= EMERGENCY_CONFIDENCE_CAP);
        assert!(!result.explanation.is_empty());
    }

    #[tokio::test]
    async fn malformed_request_is_rejected_by_the_strict_entry_point() {
        let mut bad = request();
        bad.vehicle.make = String::new();
        let engine = engine_without_listings();
        let err = engine.run(bad).await.expect_err("should reject");
        assert_eq!(err.kind(), EngineErrorKind::InvalidInput);
        assert_eq!(err.stage(), "validate_request");
    }

    #[tokio::test]
    async fn stage_sequence_is_fixed_and_fallbacks_are_emitted() {
        let events = Arc::new(RecordingEvents::default());
        let cache = Arc::new(StaticSource {
            source_name: "listing_cache",
            result: Ok(SourceYield {
                listings: vec![],
                trust_score: 0.0,
                method: SearchMethod::CacheSimilar,
            }),
        });
        let engine = ValuationEngine::with_parts(
            MarketSearchOrchestrator::new(Some(cache), vec![]),
            ListingValidator::new(ValidatorConfig::default()),
            events.clone(),
        );
        let response = engine.run(request()).await.expect("valuation");
        let names: Vec<&str> = response.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "resolve_base_price",
                "apply_adjustments",
                "market_search",
                "validate_listings",
                "market_anchor",
                "score_confidence",
                "guarantee_value",
                "render_explanation",
            ]
        );
        assert_eq!(events.completed(), names);
        assert!(
            events
                .fallbacks()
                .iter()
                .any(|(stage, _)| *stage == "market_anchor")
        );
    }

    #[tokio::test]
    async fn identical_requests_produce_identical_adjustments_and_value() {
        let engine = engine_without_listings();
        let first = engine.run(request()).await.expect("first");
        let second = engine.run(request()).await.expect("second");
        assert_eq!(first.result.adjustments, second.result.adjustments);
        assert_eq!(first.result.final_value, second.result.final_value);
    }

    #[tokio::test]
    async fn all_sources_failing_reports_error_status_not_a_throw() {
        let cache = Arc::new(StaticSource {
            source_name: "listing_cache",
            result: Err("db offline"),
        });
        let direct = Arc::new(StaticSource {
            source_name: "live_search",
            result: Err("timeout"),
        });
        let engine = ValuationEngine::with_parts(
            MarketSearchOrchestrator::new(Some(cache), vec![direct]),
            ListingValidator::new(ValidatorConfig::default()),
            Arc::new(TracingEvents),
        );
        let response = engine.run(request()).await.expect("valuation");
        assert_eq!(
            response.result.market_search_status,
            MarketSearchStatus::Error
        );
        assert!(response.result.final_value > 0.0);
        assert!(response.result.confidence <= 60);
    }
}
