//! llama-cpp-2 model loader for the embedded engine.
//!
//! Model loading, context creation and sampling via the llama-cpp-2
//! bindings. One llama backend is shared by every loaded model in the
//! process; it is freed when the last model drops.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, Weak};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use super::{DecodeSession, EmbeddedConfig, ModelLoader, NativeModel, TokenId};
use crate::engine::{EngineError, SamplingConfig};

static BACKEND: Mutex<Weak<LlamaBackend>> = Mutex::new(Weak::new());

fn shared_backend() -> Result<Arc<LlamaBackend>, EngineError> {
    let mut guard = BACKEND
        .lock()
        .map_err(|_| EngineError::Initialization("backend lock poisoned".into()))?;
    if let Some(backend) = guard.upgrade() {
        return Ok(backend);
    }
    let backend = LlamaBackend::init()
        .map_err(|e| EngineError::Initialization(format!("backend init: {e}")))?;
    let backend = Arc::new(backend);
    *guard = Arc::downgrade(&backend);
    Ok(backend)
}

/// Loads GGUF files through llama.cpp.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaLoader;

impl ModelLoader for LlamaLoader {
    fn load(&self, config: &EmbeddedConfig) -> Result<Arc<dyn NativeModel>, EngineError> {
        let backend = shared_backend()?;
        let params = LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers);
        let model = LlamaModel::load_from_file(&backend, &config.model_path, &params)
            .map_err(|e| EngineError::Initialization(format!("load {}: {e}", config.model_path.display())))?;
        tracing::info!(
            path = %config.model_path.display(),
            size_bytes = model.size(),
            n_ctx = config.context_size,
            "gguf model loaded"
        );
        Ok(Arc::new(LlamaNative {
            model,
            backend,
            n_ctx: config.context_size,
            n_threads: resolve_threads(config.n_threads),
            seed: config.seed,
        }))
    }
}

/// A loaded model. `model` is declared before `backend` so it drops first.
struct LlamaNative {
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    n_ctx: u32,
    n_threads: i32,
    seed: u32,
}

// SAFETY: LlamaModel and LlamaBackend are Send+Sync in llama-cpp-2. Each
// decode creates its own context, and the engine gate admits one at a time.
unsafe impl Send for LlamaNative {}
unsafe impl Sync for LlamaNative {}

impl NativeModel for LlamaNative {
    fn session<'a>(
        &'a self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<Box<dyn DecodeSession + 'a>, EngineError> {
        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| EngineError::Generation(format!("tokenize: {e}")))?;
        if tokens.len() >= self.n_ctx as usize {
            return Err(EngineError::Generation(format!(
                "prompt has {} tokens, context window is {}",
                tokens.len(),
                self.n_ctx
            )));
        }

        let mut ctx = self.create_context()?;
        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        add_seq(&mut batch, &tokens)?;
        decode(&mut ctx, &mut batch)?;

        Ok(Box::new(LlamaSession {
            model: &self.model,
            ctx,
            sampler: build_sampler(sampling, self.seed),
            pos: tokens.len() as i32,
            decoder: encoding_rs::UTF_8.new_decoder(),
        }))
    }
}

impl LlamaNative {
    fn create_context(&self) -> Result<LlamaContext<'_>, EngineError> {
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.n_ctx))
            .with_n_threads(self.n_threads)
            .with_n_threads_batch(self.n_threads);
        self.model
            .new_context(&self.backend, params)
            .map_err(|e| EngineError::Generation(format!("ctx: {e}")))
    }
}

struct LlamaSession<'a> {
    model: &'a LlamaModel,
    ctx: LlamaContext<'a>,
    sampler: LlamaSampler,
    pos: i32,
    decoder: encoding_rs::Decoder,
}

impl DecodeSession for LlamaSession<'_> {
    fn sample(&mut self) -> TokenId {
        // -1 samples from the last position that produced logits
        let token = self.sampler.sample(&self.ctx, -1);
        self.sampler.accept(token);
        token.0
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn token_to_piece(&mut self, token: TokenId) -> Result<String, EngineError> {
        self.model
            .token_to_piece(LlamaToken(token), &mut self.decoder, false, None)
            .map_err(|e| EngineError::Generation(format!("detok: {e}")))
    }

    fn feed(&mut self, token: TokenId) -> Result<(), EngineError> {
        let mut batch = LlamaBatch::new(1, 1);
        batch
            .add(LlamaToken(token), self.pos, &[0], true)
            .map_err(|e| EngineError::Generation(format!("batch: {e}")))?;
        decode(&mut self.ctx, &mut batch)?;
        self.pos += 1;
        Ok(())
    }
}

fn add_seq(batch: &mut LlamaBatch, tokens: &[LlamaToken]) -> Result<(), EngineError> {
    let n = tokens.len();
    for (i, &tok) in tokens.iter().enumerate() {
        // logits only for the last prompt token
        batch
            .add(tok, i as i32, &[0], i + 1 == n)
            .map_err(|e| EngineError::Generation(format!("batch: {e}")))?;
    }
    Ok(())
}

fn decode(ctx: &mut LlamaContext<'_>, batch: &mut LlamaBatch) -> Result<(), EngineError> {
    ctx.decode(batch)
        .map_err(|e| EngineError::Generation(format!("decode: {e}")))
}

/// Temperature, then top-p, then the final distribution sampler.
fn build_sampler(sampling: &SamplingConfig, seed: u32) -> LlamaSampler {
    LlamaSampler::chain_simple([
        LlamaSampler::temp(sampling.temperature),
        LlamaSampler::top_p(sampling.top_p, 1),
        LlamaSampler::dist(seed),
    ])
}

fn resolve_threads(n: u32) -> i32 {
    if n == 0 {
        // all logical cores, capped at 16
        let optimal = num_cpus::get().clamp(1, 16);
        i32::try_from(optimal).unwrap_or(4)
    } else {
        i32::try_from(n).unwrap_or(4)
    }
}
