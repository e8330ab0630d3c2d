mod engine;
mod events;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod market;
mod metrics;
mod models;
mod security;
mod supabase;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use engine::{EngineError, EngineErrorKind, ValuationEngine};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ValuationRequest, ValuationResponse, VehicleProfile};
use security::{ApiGuard, CallerIdentity, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    if let Err(err) = run().await {
        error!(target = "vantage.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let guard = ApiGuard::from_env();
    let engine = ValuationEngine::new();
    let (queue, _worker) = jobs::JobQueue::spawn(engine.clone());
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre::eyre!("prometheus recorder: {err}"))?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        engine,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/valuations", post(create_valuation))
        .nest(
            "/stages",
            Router::new()
                .route("/base_price", post(stage_base_price))
                .route("/adjustments", post(stage_adjustments))
                .route("/market_search", post(stage_market_search)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/valuations", post(enqueue_valuation_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(guard, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "vantage.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    engine: ValuationEngine,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, ValuationResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "vantage-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Engine(EngineError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Vantage API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Run the full valuation pipeline.
///
/// - Method: `POST`
/// - Path: `/valuations`
/// - Auth: `Authorization: Bearer <key>` or `X-Vantage-Key: <key>`
/// - Body: `ValuationRequest`
/// - Response: `ValuationResponse` (result + per-stage transcript)
async fn create_valuation(
    State(state): State<AppState>,
    Extension(context): Extension<CallerIdentity>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<ValuationRequest>,
) -> Result<Json<ValuationResponse>, AppError> {
    crate::metrics::inc_requests("/valuations");
    info!(
        target = "vantage.api",
        org_id = %context.org_id,
        api_key = %context.key_label,
        vin = %payload.vehicle.vin,
        premium = payload.premium,
        "valuation invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let response = state.engine.run(payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let response = state.engine.run(payload).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = state.engine.run(payload).await?;

    Ok(Json(response))
}

#[derive(Debug)]
enum AppError {
    Engine(EngineError),
}

impl From<EngineError> for AppError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Engine(err) => {
                let status = match err.kind() {
                    EngineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    EngineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_valuation_job(
    State(state): State<AppState>,
    Extension(context): Extension<CallerIdentity>,
    Json(payload): Json<ValuationRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/valuations");
    let id = state
        .queue
        .enqueue_valuation(payload, context)
        .await
        .map_err(|err| AppError::Engine(EngineError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Engine(EngineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::Engine(EngineError::invalid_input(
            "jobs",
            "not_found",
        )))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

// -------- Stage endpoints (manual granular control) --------

#[derive(Debug, Deserialize)]
struct BasePriceStageRequest {
    vehicle: VehicleProfile,
}

async fn stage_base_price(
    State(state): State<AppState>,
    Json(req): Json<BasePriceStageRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/stages/base_price");
    let resolved = state.engine.stage_base_price(&req.vehicle);
    Ok(Json(json!({
        "value": resolved.value,
        "source": resolved.source.tag(),
    })))
}

#[derive(Debug, Deserialize)]
struct AdjustmentsStageRequest {
    #[serde(flatten)]
    request: ValuationRequest,
    base_value: f64,
}

async fn stage_adjustments(
    State(state): State<AppState>,
    Json(req): Json<AdjustmentsStageRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/stages/adjustments");
    engine::validate_request(&req.request)?;
    let run = state.engine.stage_adjustments(&req.request, req.base_value);
    Ok(Json(json!({
        "adjustments": run.adjustments,
        "value": run.value,
        "fuel_degraded": run.fuel_degraded,
    })))
}

async fn stage_market_search(
    State(state): State<AppState>,
    Json(req): Json<ValuationRequest>,
) -> Result<Json<models::SearchOutcome>, AppError> {
    crate::metrics::inc_requests("/stages/market_search");
    engine::validate_request(&req)?;
    let outcome = state.engine.stage_market_search(&req).await;
    Ok(Json(outcome))
}
