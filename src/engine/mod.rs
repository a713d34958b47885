//! Translation engines.
//!
//! Every backend implements [`Engine`]: a blocking `translate` and a
//! streaming `translate_stream`, both driven by a [`Request`] and a
//! [`CancellationToken`]. Failures inside a stream arrive as a terminal
//! [`Response`] carrying the error text, never as a panic or a dropped
//! channel.

pub mod config;
mod deadline;
pub mod embedded;
pub mod error;
pub mod input;
pub mod output;
pub mod process;
pub mod prompt;
pub mod remote;
pub mod streaming;

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use config::SamplingConfig;
pub use deadline::DeadlineScope;
pub use embedded::{EmbeddedConfig, EmbeddedEngine, ModelLoader, NativeModel};
pub use error::EngineError;
pub use input::Request;
pub use output::{FinishReason, Response, StreamMode};
pub use process::{AgentPreset, OutputFormat, ProcessConfig, ProcessEngine};
pub use prompt::{build_prompt, DEFAULT_PROMPT_TEMPLATE, DEFAULT_SYSTEM_PROMPT};
pub use remote::{ModelInfo, RemoteConfig, RemoteEngine};
pub use streaming::{ResponseSender, ResponseStream};

use crate::telemetry::{record_translation, SpanExt, TranslationSpan};

/// A translation backend.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Stable identifier, possibly qualified by model or command.
    fn name(&self) -> &str;

    /// Cheap reachability probe. Never generates and never fails.
    async fn available(&self) -> bool;

    /// How streamed text relates to the final result.
    fn stream_mode(&self) -> StreamMode {
        StreamMode::Delta
    }

    /// Translate to completion.
    async fn translate(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Response, EngineError>;

    /// Start a streaming translation.
    ///
    /// Errors returned here mean nothing was started. Once a stream is
    /// returned, every outcome is delivered through it and it ends after
    /// exactly one terminal response.
    async fn translate_stream(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, EngineError>;

    /// Release backend resources. Safe to call repeatedly.
    async fn close(&self) -> Result<(), EngineError>;
}

/// Run a blocking translation inside a span and record its outcome.
pub(crate) async fn observed<F>(engine: &str, call: F) -> Result<Response, EngineError>
where
    F: Future<Output = Result<Response, EngineError>>,
{
    let span = TranslationSpan::new(engine, "blocking");
    let started = Instant::now();
    let result = call.instrument(span.clone()).await;

    let elapsed = started.elapsed();
    span.record_result(&result);
    span.record_latency(elapsed);
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    record_translation(engine, outcome, elapsed);
    result
}
