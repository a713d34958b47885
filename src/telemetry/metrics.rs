//! Translation metrics through the `metrics` facade.
//!
//! Nothing is recorded unless the host application installs a recorder.

use std::time::Duration;

pub const TRANSLATIONS_TOTAL: &str = "tons_translations_total";
pub const TRANSLATION_LATENCY_MS: &str = "tons_translation_latency_ms";

/// Count one finished call and record its latency.
///
/// `outcome` is `"ok"` or an [`EngineError::kind`](crate::EngineError::kind) label.
pub fn record_translation(engine: &str, outcome: &'static str, elapsed: Duration) {
    metrics::counter!(
        TRANSLATIONS_TOTAL,
        "engine" => engine.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(TRANSLATION_LATENCY_MS, "engine" => engine.to_string())
        .record(elapsed.as_secs_f64() * 1000.0);
}
