//! Translation through an Ollama server.

mod api;

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use api::{LineBuffer, ModelInfo};

use self::api::{ErrorBody, GenerateChunk, GenerateOptions, GenerateRequest, TagsResponse};
use super::streaming::{self, DeliveryError, ResponseSender, ResponseStream};
use super::{observed, DeadlineScope, Engine, EngineError, Request, Response, SamplingConfig};
use crate::telemetry::TranslationSpan;

/// Fixed timeout for model listing, independent of generation.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Ollama engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL, e.g. `http://localhost:11434`.
    pub host: String,
    pub model: String,
    #[serde(with = "secs")]
    pub timeout: Duration,
    pub sampling: SamplingConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout: Duration::from_secs(120),
            sampling: SamplingConfig::default(),
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let host = self.host.trim();
        if !(host.starts_with("http://") || host.starts_with("https://")) {
            return Err(EngineError::InvalidConfig(format!(
                "ollama host must be an http(s) URL, got {host:?}"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(EngineError::InvalidConfig("ollama model is required".into()));
        }
        if self.timeout.is_zero() {
            return Err(EngineError::InvalidConfig("ollama timeout must be > 0".into()));
        }
        self.sampling.validate()
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Translation engine backed by an Ollama server.
#[derive(Debug, Clone)]
pub struct RemoteEngine {
    config: RemoteConfig,
    name: String,
    client: reqwest::Client,
}

impl RemoteEngine {
    pub fn new(config: RemoteConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| EngineError::Initialization(format!("http client: {e}")))?;
        Ok(Self {
            name: format!("ollama:{}", config.model),
            config,
            client,
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.host.trim().trim_end_matches('/'))
    }

    fn generate_body<'a>(&'a self, prompt: &'a str, request: &'a Request, stream: bool) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &self.config.model,
            prompt,
            system: request.system_prompt(),
            stream,
            options: GenerateOptions::from(&self.config.sampling),
        }
    }

    /// Models installed on the server.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, EngineError> {
        let response = self
            .client
            .get(self.endpoint("/api/tags"))
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        let tags: TagsResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(tags.models)
    }

    async fn run(&self, request: &Request, cancel: &CancellationToken) -> Result<Response, EngineError> {
        let scope = DeadlineScope::new(cancel, Some(self.config.timeout));
        let prompt = request.build_prompt();
        tracing::debug!(engine = %self.name, %prompt, "sending generate request");
        let body = self.generate_body(&prompt, request, false);

        let call = async {
            let response = self
                .client
                .post(self.endpoint("/api/generate"))
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;
            let chunk: GenerateChunk = check_status(response)
                .await?
                .json()
                .await
                .map_err(transport_error)?;
            Ok::<_, EngineError>(chunk)
        };

        let chunk = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(EngineError::Timeout),
            chunk = call => chunk?,
        };
        if let Some(error) = chunk.error.filter(|e| !e.is_empty()) {
            return Err(EngineError::Transport(error));
        }
        Ok(Response::complete(chunk.response.trim()))
    }
}

#[async_trait]
impl Engine for RemoteEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn available(&self) -> bool {
        self.list_models().await.is_ok()
    }

    async fn translate(&self, request: &Request, cancel: &CancellationToken) -> Result<Response, EngineError> {
        if request.is_empty() {
            return Ok(Response::finished());
        }
        observed(self.name(), self.run(request, cancel)).await
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

        let scope = DeadlineScope::new(&cancel, Some(self.config.timeout));
        let prompt = request.build_prompt();
        tracing::debug!(engine = %self.name, %prompt, "sending streaming generate request");
        let call = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&self.generate_body(&prompt, &request, true));

        let span = TranslationSpan::new(self.name(), "stream");
        tokio::spawn(relay(call, scope, tx).instrument(span));
        Ok(rx)
    }

    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

enum Line {
    Skip,
    Delta(String),
    Done(String),
    Failed(EngineError),
}

fn decode_line(line: &str) -> Line {
    match serde_json::from_str::<GenerateChunk>(line) {
        Ok(chunk) => match chunk.error.filter(|e| !e.is_empty()) {
            Some(error) => Line::Failed(EngineError::Transport(error)),
            None if chunk.done => Line::Done(chunk.response),
            None if chunk.response.is_empty() => Line::Skip,
            None => Line::Delta(chunk.response),
        },
        Err(e) => Line::Failed(EngineError::Transport(format!("invalid response line: {e}"))),
    }
}

/// Relay NDJSON chunks until the server reports completion.
async fn relay(call: reqwest::RequestBuilder, scope: DeadlineScope, tx: ResponseSender) {
    let sent = tokio::select! {
        biased;
        _ = scope.cancelled() => return tx.fail(&EngineError::Timeout).await,
        sent = call.send() => sent,
    };
    let response = match sent.map_err(transport_error) {
        Ok(response) => response,
        Err(e) => return tx.fail(&e).await,
    };
    let response = tokio::select! {
        biased;
        _ = scope.cancelled() => return tx.fail(&EngineError::Timeout).await,
        checked = check_status(response) => checked,
    };
    let mut body = match response {
        Ok(response) => response.bytes_stream(),
        Err(e) => return tx.fail(&e).await,
    };

    let mut lines = LineBuffer::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            next = body.next() => Some(next),
        };
        let (batch, eof) = match next {
            None => return tx.fail(&EngineError::Timeout).await,
            Some(Some(Ok(bytes))) => (lines.push(&bytes), false),
            Some(Some(Err(e))) => return tx.fail(&transport_error(e)).await,
            Some(None) => (lines.finish().into_iter().collect(), true),
        };

        for line in batch {
            match decode_line(&line) {
                Line::Skip => {}
                Line::Delta(text) => match tx.send_delta(text, scope.token()).await {
                    Ok(()) => {}
                    Err(DeliveryError::Cancelled) => return tx.fail(&EngineError::Timeout).await,
                    Err(DeliveryError::Closed) => return,
                },
                Line::Done(text) => return tx.finish_with(text).await,
                Line::Failed(e) => return tx.fail(&e).await,
            }
        }
        if eof {
            return tx
                .fail(&EngineError::Transport("stream ended before completion".into()))
                .await;
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => parsed.error,
        Err(_) => body.trim().to_string(),
    };
    tracing::warn!(%status, %message, "ollama request rejected");
    Err(EngineError::Transport(format!("HTTP {status}: {message}")))
}

fn transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Timeout
    } else if e.is_connect() {
        EngineError::Transport(format!("cannot connect to server: {e}"))
    } else {
        EngineError::Transport(e.to_string())
    }
}
