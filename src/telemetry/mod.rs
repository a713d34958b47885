//! Telemetry: structured logging, call spans and metrics.

mod logging;
pub(crate) mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{record_translation, TRANSLATIONS_TOTAL, TRANSLATION_LATENCY_MS};
pub use spans::{SpanExt, TranslationSpan};
