use serde_json::Value;
#[cfg(test)]
use std::sync::Mutex;
use tracing::info;

/// Structured stage events emitted by the valuation engine. Injected so tests
/// can assert on the event stream instead of scraping log text.
pub trait PipelineEvents: Send + Sync {
    fn stage_completed(&self, stage: &'static str, elapsed_ms: u128, output: &Value);
    fn stage_fallback(&self, stage: &'static str, reason: &str);
}

/// Default emitter: structured tracing events plus the trace-based counters.
pub struct TracingEvents;

impl PipelineEvents for TracingEvents {
    fn stage_completed(&self, stage: &'static str, elapsed_ms: u128, output: &Value) {
        crate::metrics::stage_elapsed(stage, elapsed_ms);
        info!(
            target = "vantage.engine",
            stage = stage,
            elapsed_ms = elapsed_ms as u64,
            output = %output,
            "stage_completed"
        );
    }

    fn stage_fallback(&self, stage: &'static str, reason: &str) {
        crate::metrics::stage_fallback(stage, reason);
        info!(
            target = "vantage.engine",
            stage = stage,
            reason = reason,
            "stage_fallback"
        );
    }
}

/// Collects events in memory. Used by tests to assert stage order and
/// fallback signals.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingEvents {
    inner: Mutex<Recorded>,
}

#[cfg(test)]
#[derive(Default)]
struct Recorded {
    completed: Vec<&'static str>,
    fallbacks: Vec<(&'static str, String)>,
}

#[cfg(test)]
impl RecordingEvents {
    pub fn completed(&self) -> Vec<&'static str> {
        self.inner.lock().expect("events lock").completed.clone()
    }

    pub fn fallbacks(&self) -> Vec<(&'static str, String)> {
        self.inner.lock().expect("events lock").fallbacks.clone()
    }
}

#[cfg(test)]
impl PipelineEvents for RecordingEvents {
    fn stage_completed(&self, stage: &'static str, _elapsed_ms: u128, _output: &Value) {
        self.inner.lock().expect("events lock").completed.push(stage);
    }

    fn stage_fallback(&self, stage: &'static str, reason: &str) {
        self.inner
            .lock()
            .expect("events lock")
            .fallbacks
            .push((stage, reason.to_string()));
    }
}
