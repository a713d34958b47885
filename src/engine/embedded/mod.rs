//! In-process translation over a native model.
//!
//! The engine loads its model lazily on first use, keeps it until
//! [`Engine::close`], and admits one decode at a time through a gate of
//! capacity one. Decoding runs on a blocking thread; streamed pieces are
//! handed back to the async side as they are produced.

#[cfg(feature = "gguf")]
mod backend;
mod decode;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[cfg(feature = "gguf")]
pub use backend::LlamaLoader;
pub use decode::{run_decode_loop, PieceAction};

use super::streaming::{self, DeliveryError, ResponseSender, ResponseStream};
use super::{observed, Engine, EngineError, FinishReason, Request, Response, SamplingConfig};
use crate::telemetry::TranslationSpan;

/// Vocabulary index of a token.
pub type TokenId = i32;

/// Embedded engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    /// Path to the model file.
    pub model_path: PathBuf,
    /// Context window in tokens.
    pub context_size: u32,
    /// Decode threads. 0 = auto.
    pub n_threads: u32,
    /// Layers offloaded to the GPU.
    pub n_gpu_layers: u32,
    /// Seed for the final distribution sampler.
    pub seed: u32,
    pub sampling: SamplingConfig,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            context_size: 2048,
            n_threads: 0,
            n_gpu_layers: 0,
            seed: 0,
            sampling: SamplingConfig::default(),
        }
    }
}

impl EmbeddedConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.model_path.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig("model_path is required".into()));
        }
        if self.context_size == 0 {
            return Err(EngineError::InvalidConfig("context_size must be > 0".into()));
        }
        self.sampling.validate()
    }
}

/// Loads a native model from an [`EmbeddedConfig`]. Called on a blocking thread.
pub trait ModelLoader: Send + Sync {
    fn load(&self, config: &EmbeddedConfig) -> Result<Arc<dyn NativeModel>, EngineError>;

    /// Cheap probe used by [`Engine::available`].
    fn available(&self, config: &EmbeddedConfig) -> bool {
        config.model_path.is_file()
    }
}

/// A loaded model that can open decode sessions.
pub trait NativeModel: Send + Sync {
    /// Tokenize `prompt`, decode it as one batch and return a session ready
    /// to sample the first generated token.
    fn session<'a>(
        &'a self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<Box<dyn DecodeSession + 'a>, EngineError>;
}

/// One generation in progress.
pub trait DecodeSession {
    fn sample(&mut self) -> TokenId;
    fn is_end_of_sequence(&self, token: TokenId) -> bool;
    fn token_to_piece(&mut self, token: TokenId) -> Result<String, EngineError>;
    /// Decode `token` as the next single-token batch.
    fn feed(&mut self, token: TokenId) -> Result<(), EngineError>;
}

enum ModelState {
    Uninitialized,
    Ready(Arc<dyn NativeModel>),
    Closed,
}

struct Inner {
    name: String,
    config: EmbeddedConfig,
    loader: Arc<dyn ModelLoader>,
    state: Mutex<ModelState>,
    gate: Arc<Semaphore>,
}

/// Translation engine backed by an in-process model.
pub struct EmbeddedEngine {
    inner: Arc<Inner>,
}

impl EmbeddedEngine {
    /// Engine that loads GGUF models through llama.cpp.
    #[cfg(feature = "gguf")]
    pub fn new(config: EmbeddedConfig) -> Result<Self, EngineError> {
        Self::with_loader(config, Arc::new(LlamaLoader))
    }

    pub fn with_loader(
        config: EmbeddedConfig,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let name = match config.model_path.file_stem() {
            Some(stem) => format!("embedded:{}", stem.to_string_lossy()),
            None => "embedded".to_string(),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                name,
                config,
                loader,
                state: Mutex::new(ModelState::Uninitialized),
                gate: Arc::new(Semaphore::new(1)),
            }),
        })
    }

    pub fn config(&self) -> &EmbeddedConfig {
        &self.inner.config
    }

    /// Load the model if it is not loaded yet.
    ///
    /// Concurrent callers share one load. A failed load leaves the engine
    /// uninitialized so a later call retries.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.inner.model().await.map(|_| ())
    }

    pub async fn is_loaded(&self) -> bool {
        matches!(*self.inner.state.lock().await, ModelState::Ready(_))
    }
}

impl Inner {
    async fn model(&self) -> Result<Arc<dyn NativeModel>, EngineError> {
        let mut state = self.state.lock().await;
        match &*state {
            ModelState::Ready(model) => return Ok(model.clone()),
            ModelState::Closed => {
                return Err(EngineError::Initialization("engine is closed".into()))
            }
            ModelState::Uninitialized => {}
        }

        tracing::info!(engine = %self.name, path = %self.config.model_path.display(), "loading model");
        let loader = self.loader.clone();
        let config = self.config.clone();
        let model = tokio::task::spawn_blocking(move || loader.load(&config))
            .await
            .map_err(|e| EngineError::Initialization(format!("load task: {e}")))?
            .map_err(|e| {
                tracing::error!(engine = %self.name, error = %e, "model load failed");
                e
            })?;
        *state = ModelState::Ready(model.clone());
        Ok(model)
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, EngineError> {
        if self.gate.available_permits() == 0 {
            tracing::debug!(engine = %self.name, "waiting for model gate");
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Acquisition("cancelled while waiting".into())),
            permit = self.gate.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::Initialization("engine is closed".into()))
            }
        }
    }

    async fn translate(&self, request: &Request, cancel: &CancellationToken) -> Result<Response, EngineError> {
        let model = self.model().await?;
        let permit = self.acquire(cancel).await?;

        let prompt = request.build_prompt();
        tracing::debug!(engine = %self.name, %prompt, "decoding");
        let sampling = self.config.sampling;
        let cancel = cancel.clone();
        let (text, result) = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut text = String::new();
            let result = model.session(&prompt, &sampling).and_then(|mut session| {
                run_decode_loop(session.as_mut(), sampling.max_tokens, &cancel, |piece| {
                    text.push_str(&piece);
                    Ok(PieceAction::Continue)
                })
            });
            (text, result)
        })
        .await
        .map_err(|e| EngineError::Generation(format!("decode task: {e}")))?;

        match result {
            Ok(reason) => {
                tracing::debug!(engine = %self.name, ?reason, "decode finished");
                Ok(Response::complete(text))
            }
            Err(e) => Err(e.with_partial(text)),
        }
    }

    async fn stream_worker(
        self: Arc<Self>,
        model: Arc<dyn NativeModel>,
        request: Request,
        cancel: CancellationToken,
        tx: ResponseSender,
    ) {
        let permit = match self.acquire(&cancel).await {
            Ok(permit) => permit,
            Err(e) => return tx.fail(&e).await,
        };

        let prompt = request.build_prompt();
        let sampling = self.config.sampling;
        let handle = Handle::current();
        let tx = Arc::new(tx);
        let worker_tx = tx.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            decode_into(model.as_ref(), &prompt, &sampling, &cancel, &worker_tx, &handle)
        })
        .await;

        // the blocking closure has dropped its handle, even when it panicked
        let Ok(tx) = Arc::try_unwrap(tx) else {
            tracing::error!(engine = %self.name, "response sender still shared after decode");
            return;
        };
        match joined {
            Ok(Ok(reason)) => {
                tracing::debug!(engine = %self.name, ?reason, "decode finished");
                tx.finish().await;
            }
            Ok(Err(e)) => tx.fail(&e).await,
            Err(e) => {
                tracing::error!(engine = %self.name, error = %e, "decode task failed");
                tx.fail(&EngineError::Generation(format!("decode task: {e}"))).await;
            }
        }
    }
}

/// Decode on the current (blocking) thread, delivering each piece through `tx`.
fn decode_into(
    model: &dyn NativeModel,
    prompt: &str,
    sampling: &SamplingConfig,
    cancel: &CancellationToken,
    tx: &ResponseSender,
    handle: &Handle,
) -> Result<FinishReason, EngineError> {
    let mut session = model.session(prompt, sampling)?;
    run_decode_loop(session.as_mut(), sampling.max_tokens, cancel, |piece| {
        match handle.block_on(tx.send_delta(piece, cancel)) {
            Ok(()) => Ok(PieceAction::Continue),
            Err(DeliveryError::Cancelled) => Err(EngineError::Timeout),
            Err(DeliveryError::Closed) => Ok(PieceAction::Stop),
        }
    })
}

#[async_trait]
impl Engine for EmbeddedEngine {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn available(&self) -> bool {
        self.inner.loader.available(&self.inner.config)
    }

    async fn translate(&self, request: &Request, cancel: &CancellationToken) -> Result<Response, EngineError> {
        if request.is_empty() {
            return Ok(Response::finished());
        }
        observed(self.name(), self.inner.translate(request, cancel)).await
    }

    async fn translate_stream(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, EngineError> {
        let (tx, rx) = streaming::channel(self.name());
        if request.is_empty() {
            tx.finish().await;
            return Ok(rx);
        }

        let model = self.inner.model().await?;
        let span = TranslationSpan::new(self.name(), "stream");
        tokio::spawn(
            self.inner
                .clone()
                .stream_worker(model, request, cancel, tx)
                .instrument(span),
        );
        Ok(rx)
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        if matches!(*state, ModelState::Ready(_)) {
            tracing::info!(engine = %self.inner.name, "releasing model");
        }
        *state = ModelState::Closed;
        self.inner.gate.close();
        Ok(())
    }
}
