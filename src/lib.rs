//! tons core
//!
//! Translation backends behind one [`Engine`] abstraction:
//!
//! - **Embedded**: a local model decoded in-process (`gguf` feature)
//! - **Agent**: an external command-line agent driven as a child process
//! - **Remote**: an Ollama server over HTTP
//!
//! Every engine offers a blocking call that returns the complete
//! translation and a streaming call that delivers partial output over a
//! bounded channel. Cancellation and timeouts flow through a
//! [`tokio_util::sync::CancellationToken`].
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use tons_core::Engine;
//!
//! # async fn demo() -> Result<(), tons_core::EngineError> {
//! let settings = tons_core::config::load().unwrap_or_default();
//! let engine = settings.build_engine()?;
//! let request = settings.request("Hello", "English", "Korean");
//! let response = engine.translate(&request, &CancellationToken::new()).await?;
//! println!("{}", response.text);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod telemetry;

pub use config::{EngineKind, Settings};
pub use engine::{
    Engine, EngineError, FinishReason, Request, Response, ResponseStream, SamplingConfig,
    StreamMode,
};
