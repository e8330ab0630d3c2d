use super::live::{LiveSearchClient, SearchParams};
use super::{ListingSource, SearchError, SourceFuture, SourceYield};
use crate::llm::{LlmClient, LlmMessage};
use crate::models::{SearchMethod, ValuationRequest};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

const SYSTEM_PROMPT: &str = r#"
You are a vehicle market search router. Given a vehicle and a location, respond
with a single JSON object selecting live-search parameters: make, model,
year_min, year_max, max_mileage, zip, radius_miles. Widen the year range or the
radius only when the vehicle is rare. Output JSON only.
"#;

/// LLM-routed live search. The model's only job is to pick structured search
/// parameters; the actual search call is the same `LiveSearchClient` the
/// direct source uses. Any model failure surfaces as a `SearchError` so the
/// orchestrator moves on to the direct call.
pub struct LlmRoutedSource {
    llm: Arc<LlmClient>,
    client: LiveSearchClient,
}

impl LlmRoutedSource {
    pub fn new(llm: Arc<LlmClient>, client: LiveSearchClient) -> Self {
        Self { llm, client }
    }

    async fn fetch_inner(&self, request: &ValuationRequest) -> Result<SourceYield, SearchError> {
        let params = self.route(request).await?;
        let listings = self.client.search(&params).await?;
        Ok(SourceYield {
            listings,
            trust_score: 0.85,
            method: SearchMethod::LlmRouted,
        })
    }

    async fn route(&self, request: &ValuationRequest) -> Result<SearchParams, SearchError> {
        let vehicle = &request.vehicle;
        let payload = json!({
            "year": vehicle.year,
            "make": vehicle.make,
            "model": vehicle.model,
            "trim": vehicle.trim,
            "fuel_type": vehicle.fuel_type.label(),
            "mileage": request.mileage,
            "zip": request.location,
        });
        let messages = vec![
            LlmMessage {
                role: "system".into(),
                content: SYSTEM_PROMPT.into(),
            },
            LlmMessage {
                role: "user".into(),
                content: payload.to_string(),
            },
        ];

        let value = self
            .llm
            .chat_json(&messages)
            .await
            .map_err(|err| SearchError::Source {
                source_name: "llm_search",
                detail: err.to_string(),
            })?;

        match serde_json::from_value::<SearchParams>(value) {
            Ok(params) if !params.make.trim().is_empty() && params.year_min <= params.year_max => {
                Ok(params)
            }
            Ok(params) => {
                warn!(
                    target = "vantage.llm",
                    make = %params.make,
                    "router returned unusable params"
                );
                Err(SearchError::Source {
                    source_name: "llm_search",
                    detail: "unusable search params".into(),
                })
            }
            Err(err) => Err(SearchError::Source {
                source_name: "llm_search",
                detail: err.to_string(),
            }),
        }
    }
}

impl ListingSource for LlmRoutedSource {
    fn name(&self) -> &'static str {
        "llm_search"
    }

    fn fetch<'a>(&'a self, request: &'a ValuationRequest) -> SourceFuture<'a> {
        Box::pin(self.fetch_inner(request))
    }
}
