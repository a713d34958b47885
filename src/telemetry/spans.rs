//! Span utilities for translation calls.

use tracing::{info_span, Span};

/// Extension trait for recording call outcomes on a span.
pub trait SpanExt {
    /// Record `status` and, on failure, `error.message`.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;

    fn record_latency(&self, elapsed: std::time::Duration);
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }

    fn record_latency(&self, elapsed: std::time::Duration) {
        self.record("latency_ms", elapsed.as_millis() as u64);
    }
}

/// Factory for translation call spans.
pub struct TranslationSpan;

impl TranslationSpan {
    /// Span with `engine` and `mode` set and empty result fields.
    ///
    /// `mode` is `"blocking"` or `"stream"`.
    pub fn new(engine: &str, mode: &'static str) -> Span {
        info_span!(
            "translation",
            engine = %engine,
            mode = mode,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
