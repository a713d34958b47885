//! Translation through external command-line agents.
//!
//! Each request spawns the agent once with the built prompt as its final
//! argument. Output is decoded according to the agent's [`OutputFormat`]:
//! raw bytes are relayed as deltas, event streams are decoded line by line
//! into cumulative text. The configured timeout bounds the whole call; on
//! expiry the agent is interrupted, given [`GRACE_PERIOD`] to exit, then
//! killed.

mod events;
mod reader;
mod shutdown;

use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use events::{final_text, EventAccumulator, EventOutcome};
pub use shutdown::{terminate, Termination, GRACE_PERIOD};

use self::reader::{spawn_chunk_reader, spawn_line_reader, ReadEvent};
use super::streaming::{self, DeliveryError, ResponseSender, ResponseStream};
use super::{observed, DeadlineScope, Engine, EngineError, Request, Response, StreamMode};
use crate::telemetry::TranslationSpan;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const STDERR_TAIL: usize = 512;

/// How an agent writes its answer to stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Plain text, relayed chunk by chunk.
    #[default]
    Raw,
    /// Newline-delimited JSON events.
    EventStream,
}

/// Agents with a known command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentPreset {
    ClaudeCode,
    GeminiCli,
    Codex,
}

impl AgentPreset {
    pub const ALL: [AgentPreset; 3] = [Self::ClaudeCode, Self::GeminiCli, Self::Codex];

    pub fn id(self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::GeminiCli => "gemini-cli",
            Self::Codex => "codex",
        }
    }

    /// Default configuration for this agent.
    pub fn config(self) -> ProcessConfig {
        match self {
            Self::ClaudeCode => ProcessConfig {
                name: self.id().into(),
                command: "claude".into(),
                args: [
                    "--model",
                    "haiku",
                    "--tools",
                    "",
                    "--output-format",
                    "stream-json",
                    "--verbose",
                    "--include-partial-messages",
                    "-p",
                ]
                .map(String::from)
                .to_vec(),
                timeout: DEFAULT_TIMEOUT,
                output: OutputFormat::EventStream,
                system_prompt_flag: Some("--system-prompt".into()),
            },
            Self::GeminiCli => ProcessConfig::custom(self.id(), "gemini", vec!["-p".into()]),
            Self::Codex => ProcessConfig::custom(self.id(), "codex", vec!["-p".into()]),
        }
    }
}

impl fmt::Display for AgentPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for AgentPreset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::InvalidConfig(format!("unknown agent: {s}")))
    }
}

/// Configuration of one agent engine. Immutable once the engine is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Engine name reported by [`Engine::name`].
    pub name: String,
    /// Executable, looked up on `PATH`.
    pub command: String,
    /// Arguments placed before the prompt.
    pub args: Vec<String>,
    pub timeout: Duration,
    pub output: OutputFormat,
    /// Flag that introduces a system prompt, for agents that accept one.
    pub system_prompt_flag: Option<String>,
}

impl ProcessConfig {
    /// Raw-output agent with the default timeout and no system prompt flag.
    pub fn custom(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            timeout: DEFAULT_TIMEOUT,
            output: OutputFormat::Raw,
            system_prompt_flag: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.command.trim().is_empty() {
            return Err(EngineError::InvalidConfig("agent command is required".into()));
        }
        if self.timeout.is_zero() {
            return Err(EngineError::InvalidConfig("agent timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Translation engine that drives an external agent process.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: Arc<ProcessConfig>,
}

impl ProcessEngine {
    pub fn new(config: ProcessConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self { config: Arc::new(config) })
    }

    pub fn from_preset(preset: AgentPreset) -> Self {
        Self { config: Arc::new(preset.config()) }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// True if the command resolves on `PATH`.
    pub fn is_installed(&self) -> bool {
        which::which(&self.config.command).is_ok()
    }

    /// Base arguments, then the system prompt pair if supported, then the prompt.
    pub fn build_args(&self, request: &Request) -> Vec<String> {
        let mut args = self.config.args.clone();
        if let (Some(flag), Some(system)) = (&self.config.system_prompt_flag, request.system_prompt()) {
            args.push(flag.clone());
            args.push(system.to_string());
        }
        args.push(request.build_prompt());
        args
    }

    fn spawn(&self, request: &Request, stderr: Stdio) -> Result<Child, EngineError> {
        let args = self.build_args(request);
        tracing::info!(agent = %self.config.name, command = %self.config.command, "spawning agent");
        tracing::debug!(agent = %self.config.name, ?args, "agent arguments");
        Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Process(format!("failed to start {}: {e}", self.config.command)))
    }

    async fn run(&self, request: &Request, cancel: &CancellationToken) -> Result<Response, EngineError> {
        let scope = DeadlineScope::new(cancel, Some(self.config.timeout));
        let mut child = self.spawn(request, Stdio::piped())?;
        let stdout = child.stdout.take().map(read_all);
        let stderr = child.stderr.take().map(read_all);

        let exited = tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = exited else {
            abort_all([&stdout, &stderr]);
            let outcome = terminate(&mut child, GRACE_PERIOD).await;
            tracing::warn!(agent = %self.config.name, ?outcome, "agent timed out");
            return Err(EngineError::Timeout);
        };
        let status = status.map_err(|e| EngineError::Process(format!("wait: {e}")))?;

        let output = collect(stdout, &scope).await?;
        if !status.success() {
            let stderr = collect(stderr, &scope).await?;
            let stderr = String::from_utf8_lossy(&stderr);
            tracing::warn!(agent = %self.config.name, %status, "agent failed");
            return Err(EngineError::Process(exit_message(&self.config.command, status, &stderr)));
        }
        tracing::debug!(agent = %self.config.name, bytes = output.len(), "agent finished");

        let text = match self.config.output {
            OutputFormat::Raw => String::from_utf8_lossy(&output).into_owned(),
            OutputFormat::EventStream => final_text(&output),
        };
        Ok(Response::complete(text.trim_end()))
    }
}

/// Every installed preset agent.
pub fn available_agents() -> Vec<ProcessEngine> {
    AgentPreset::ALL
        .into_iter()
        .map(ProcessEngine::from_preset)
        .filter(ProcessEngine::is_installed)
        .collect()
}

#[async_trait]
impl Engine for ProcessEngine {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn available(&self) -> bool {
        self.is_installed()
    }

    fn stream_mode(&self) -> StreamMode {
        match self.config.output {
            OutputFormat::Raw => StreamMode::Delta,
            OutputFormat::EventStream => StreamMode::Cumulative,
        }
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
        let child = match self.spawn(&request, Stdio::inherit()) {
            Ok(child) => child,
            Err(e) => {
                tx.fail(&e).await;
                return Ok(rx);
            }
        };
        let span = TranslationSpan::new(self.name(), "stream");
        tokio::spawn(relay(self.config.clone(), child, scope, tx).instrument(span));
        Ok(rx)
    }

    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

enum StreamDecoder {
    Raw(encoding_rs::Decoder),
    Events(EventAccumulator),
}

enum Decoded {
    Nothing,
    Emit(String),
    Finished,
}

impl StreamDecoder {
    fn new(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Raw => Self::Raw(encoding_rs::UTF_8.new_decoder()),
            OutputFormat::EventStream => Self::Events(EventAccumulator::new()),
        }
    }

    fn push(&mut self, event: ReadEvent) -> Decoded {
        match (self, event) {
            (Self::Raw(decoder), ReadEvent::Chunk(bytes)) => {
                let text = decode_utf8(decoder, &bytes, false);
                if text.is_empty() {
                    Decoded::Nothing
                } else {
                    Decoded::Emit(text)
                }
            }
            (Self::Events(acc), ReadEvent::Line(line)) => match acc.push_line(&line) {
                Some(EventOutcome::Text(text)) => Decoded::Emit(text),
                Some(EventOutcome::Finished) => Decoded::Finished,
                None => Decoded::Nothing,
            },
            _ => Decoded::Nothing,
        }
    }

    /// Bytes held back at end of output, if any.
    fn flush(&mut self) -> String {
        match self {
            Self::Raw(decoder) => decode_utf8(decoder, &[], true),
            Self::Events(_) => String::new(),
        }
    }

    /// Text for the terminal response: empty for deltas, the whole result
    /// for cumulative output.
    fn into_final_text(self) -> String {
        match self {
            Self::Raw(_) => String::new(),
            Self::Events(acc) => acc.into_text(),
        }
    }
}

fn decode_utf8(decoder: &mut encoding_rs::Decoder, bytes: &[u8], last: bool) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(bytes.len())
        .unwrap_or(bytes.len() * 3 + 4);
    let mut out = String::with_capacity(capacity);
    let _ = decoder.decode_to_string(bytes, &mut out, last);
    out
}

/// Coordinate one streaming call: read output, watch the deadline, reap.
async fn relay(config: Arc<ProcessConfig>, mut child: Child, scope: DeadlineScope, tx: ResponseSender) {
    let Some(stdout) = child.stdout.take() else {
        terminate(&mut child, GRACE_PERIOD).await;
        return tx.fail(&EngineError::Process("stdout was not captured".into())).await;
    };
    let (mut events, reader) = match config.output {
        OutputFormat::Raw => spawn_chunk_reader(stdout),
        OutputFormat::EventStream => spawn_line_reader(stdout),
    };
    let mut decoder = StreamDecoder::new(config.output);

    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            event = events.recv() => Some(event),
        };
        let Some(event) = next else {
            reader.abort();
            return timed_out(&config, &mut child, tx).await;
        };

        match event {
            Some(ReadEvent::Failed(e)) => {
                reap(&mut child, &scope).await;
                return tx.fail(&EngineError::Process(format!("read error: {e}"))).await;
            }
            Some(event) => match decoder.push(event) {
                Decoded::Nothing => {}
                Decoded::Emit(text) => match tx.send_delta(text, scope.token()).await {
                    Ok(()) => {}
                    Err(DeliveryError::Cancelled) => {
                        reader.abort();
                        return timed_out(&config, &mut child, tx).await;
                    }
                    Err(DeliveryError::Closed) => {
                        tracing::debug!(agent = %config.name, "consumer went away");
                        reader.abort();
                        terminate(&mut child, GRACE_PERIOD).await;
                        return;
                    }
                },
                Decoded::Finished => {
                    reader.abort();
                    tx.finish_with(decoder.into_final_text()).await;
                    terminate(&mut child, GRACE_PERIOD).await;
                    return;
                }
            },
            None => {
                let tail = decoder.flush();
                if !tail.is_empty() {
                    let _ = tx.send_delta(tail, scope.token()).await;
                }
                return finish_at_exit(&config, &mut child, &scope, tx, decoder.into_final_text()).await;
            }
        }
    }
}

/// Output ended: wait for exit, still bounded by the deadline.
async fn finish_at_exit(
    config: &ProcessConfig,
    child: &mut Child,
    scope: &DeadlineScope,
    tx: ResponseSender,
    text: String,
) {
    let exited = tokio::select! {
        biased;
        _ = scope.cancelled() => None,
        status = child.wait() => Some(status),
    };
    match exited {
        None => timed_out(config, child, tx).await,
        Some(Ok(status)) if status.success() => {
            tracing::debug!(agent = %config.name, "agent finished");
            tx.finish_with(text).await;
        }
        Some(Ok(status)) => {
            tracing::warn!(agent = %config.name, %status, "agent failed");
            tx.fail(&EngineError::Process(exit_message(&config.command, status, ""))).await;
        }
        Some(Err(e)) => tx.fail(&EngineError::Process(format!("wait: {e}"))).await,
    }
}

async fn timed_out(config: &ProcessConfig, child: &mut Child, tx: ResponseSender) {
    let outcome = terminate(child, GRACE_PERIOD).await;
    tracing::warn!(agent = %config.name, ?outcome, "agent timed out");
    tx.fail(&EngineError::Timeout).await;
}

/// Wait for exit; terminate instead if the deadline fires first.
async fn reap(child: &mut Child, scope: &DeadlineScope) {
    let exited = tokio::select! {
        biased;
        _ = scope.cancelled() => false,
        _ = child.wait() => true,
    };
    if !exited {
        terminate(child, GRACE_PERIOD).await;
    }
}

fn read_all<R>(mut pipe: R) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

async fn collect(
    task: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    scope: &DeadlineScope,
) -> Result<Vec<u8>, EngineError> {
    let Some(task) = task else { return Ok(Vec::new()) };
    let abort = task.abort_handle();
    let joined = tokio::select! {
        biased;
        _ = scope.cancelled() => {
            abort.abort();
            return Err(EngineError::Timeout);
        }
        joined = task => joined,
    };
    joined
        .map_err(|e| EngineError::Process(format!("reader task: {e}")))?
        .map_err(|e| EngineError::Process(format!("read error: {e}")))
}

fn abort_all(tasks: [&Option<JoinHandle<std::io::Result<Vec<u8>>>>; 2]) {
    for task in tasks.into_iter().flatten() {
        task.abort();
    }
}

fn exit_message(command: &str, status: std::process::ExitStatus, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return format!("{command} exited with {status}");
    }
    let start = stderr
        .char_indices()
        .rev()
        .nth(STDERR_TAIL - 1)
        .map_or(0, |(i, _)| i);
    format!("{command} exited with {status}: {}", &stderr[start..])
}
