use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    convert::Infallible,
    env,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Valuations are expensive per call (LLM routing plus liveness probes), so
/// the per-caller budget is a small fixed window rather than a burst bucket.
const DEFAULT_RATE_PER_MIN: u32 = 30;
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Authentication plus per-org request budgeting for the valuation routes.
#[derive(Clone)]
pub struct ApiGuard {
    keys: Arc<HashMap<String, CallerIdentity>>,
    limiter: Arc<RequestWindows>,
}

/// Who is asking for a valuation. Attached as a request extension after
/// authentication and carried into job logs.
#[derive(Clone, Debug)]
pub struct CallerIdentity {
    pub org_id: String,
    pub key_label: String,
}

impl ApiGuard {
    pub fn from_env() -> Self {
        Self {
            keys: Arc::new(load_keys_from_env()),
            limiter: Arc::new(RequestWindows::from_env()),
        }
    }

    fn authenticate(&self, secret: &str) -> Option<CallerIdentity> {
        self.keys.get(secret).cloned()
    }
}

pub async fn require_api_auth(
    State(guard): State<ApiGuard>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(secret) = presented_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Vantage-Key or Bearer token",
        ));
    };

    let Some(caller) = guard.authenticate(&secret) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match guard.limiter.admit(&caller.org_id).await {
        Admission::Granted { limit, remaining } => {
            request.extensions_mut().insert(caller);
            let mut response = next.run(request).await;
            set_rate_headers(response.headers_mut(), limit, remaining, None);
            Ok(response)
        }
        Admission::Exhausted { limit, retry_after } => {
            warn!(
                target = "vantage.api",
                org_id = %caller.org_id,
                "valuation rate window exhausted"
            );
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Valuation budget for this window is spent",
            );
            set_rate_headers(response.headers_mut(), limit, 0, Some(retry_after));
            Ok(response)
        }
    }
}

fn presented_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        let token = raw[6..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    headers
        .get("X-Vantage-Key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

fn set_rate_headers(
    headers: &mut http::HeaderMap,
    limit: u32,
    remaining: u32,
    retry_after: Option<Duration>,
) {
    headers.insert(
        "X-RateLimit-Limit",
        HeaderValue::from_str(&limit.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    headers.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from_str(&remaining.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    if let Some(wait) = retry_after {
        let secs = wait.as_secs().max(1);
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_str(&secs.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
    }
}

fn load_keys_from_env() -> HashMap<String, CallerIdentity> {
    let raw = env::var("VANTAGE_API_KEYS").unwrap_or_else(|_| "demo-org:demo-key".to_string());
    let mut keys = HashMap::new();
    for (idx, entry) in raw.split(',').enumerate() {
        if entry.trim().is_empty() {
            continue;
        }
        match parse_key_entry(entry, idx) {
            Some((secret, caller)) => {
                keys.insert(secret, caller);
            }
            None => warn!(
                target = "vantage.api",
                "ignored malformed VANTAGE_API_KEYS entry: {}",
                entry.trim()
            ),
        }
    }

    if keys.is_empty() {
        warn!(
            target = "vantage.api",
            "VANTAGE_API_KEYS produced no keys; falling back to demo credentials"
        );
        keys.insert(
            "demo-key".to_string(),
            CallerIdentity {
                org_id: "demo-org".to_string(),
                key_label: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "vantage.api",
            key_count = keys.len(),
            "loaded API keys from env"
        );
    }

    keys
}

fn parse_key_entry(entry: &str, idx: usize) -> Option<(String, CallerIdentity)> {
    let (org, secret) = entry.trim().split_once(':')?;
    let org = org.trim();
    let secret = secret.trim();
    if org.is_empty() || secret.is_empty() {
        return None;
    }
    Some((
        secret.to_string(),
        CallerIdentity {
            org_id: org.to_string(),
            key_label: format!("key-{:02}", idx + 1),
        },
    ))
}

/// Fixed-window counters per org. The window resets wholesale when it ages
/// out; no partial refill.
struct RequestWindows {
    per_window: u32,
    windows: Mutex<HashMap<String, Window>>,
}

struct Window {
    started: Instant,
    used: u32,
}

enum Admission {
    Granted { limit: u32, remaining: u32 },
    Exhausted { limit: u32, retry_after: Duration },
}

impl RequestWindows {
    fn from_env() -> Self {
        let per_window = env::var("VALUATION_RATE_PER_MIN")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RATE_PER_MIN);
        Self {
            per_window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    async fn admit(&self, org_id: &str) -> Admission {
        let mut guard = self.windows.lock().await;
        let now = Instant::now();
        let window = guard.entry(org_id.to_string()).or_insert(Window {
            started: now,
            used: 0,
        });

        if now.duration_since(window.started) >= RATE_WINDOW {
            window.started = now;
            window.used = 0;
        }

        if window.used < self.per_window {
            window.used += 1;
            Admission::Granted {
                limit: self.per_window,
                remaining: self.per_window - window.used,
            }
        } else {
            Admission::Exhausted {
                limit: self.per_window,
                retry_after: RATE_WINDOW.saturating_sub(now.duration_since(window.started)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn windows(per_window: u32) -> RequestWindows {
        RequestWindows {
            per_window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn key_entries_parse_org_and_secret() {
        let (secret, caller) = parse_key_entry(" acme : s3cret ", 0).expect("entry");
        assert_eq!(secret, "s3cret");
        assert_eq!(caller.org_id, "acme");
        assert_eq!(caller.key_label, "key-01");

        assert!(parse_key_entry("no-separator", 0).is_none());
        assert!(parse_key_entry(":missing-org", 0).is_none());
        assert!(parse_key_entry("missing-secret:", 0).is_none());
    }

    #[tokio::test]
    async fn window_exhausts_after_its_budget_and_reports_remaining() {
        let limiter = windows(2);
        match limiter.admit("acme").await {
            Admission::Granted { remaining, .. } => assert_eq!(remaining, 1),
            Admission::Exhausted { .. } => panic!("first request should pass"),
        }
        match limiter.admit("acme").await {
            Admission::Granted { remaining, .. } => assert_eq!(remaining, 0),
            Admission::Exhausted { .. } => panic!("second request should pass"),
        }
        match limiter.admit("acme").await {
            Admission::Exhausted { limit, retry_after } => {
                assert_eq!(limit, 2);
                assert!(retry_after <= RATE_WINDOW);
            }
            Admission::Granted { .. } => panic!("third request should be rejected"),
        }
    }

    #[tokio::test]
    async fn windows_are_per_org() {
        let limiter = windows(1);
        assert!(matches!(
            limiter.admit("acme").await,
            Admission::Granted { .. }
        ));
        assert!(matches!(
            limiter.admit("globex").await,
            Admission::Granted { .. }
        ));
        assert!(matches!(
            limiter.admit("acme").await,
            Admission::Exhausted { .. }
        ));
    }

    #[test]
    fn presented_key_prefers_bearer_and_trims() {
        let mut headers = http::HeaderMap::new();
        headers.insert("X-Vantage-Key", HeaderValue::from_static(" header-key "));
        assert_eq!(presented_key(&headers).as_deref(), Some("header-key"));

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert_eq!(presented_key(&headers).as_deref(), Some("token-123"));

        let empty = http::HeaderMap::new();
        assert!(presented_key(&empty).is_none());
    }
}
