//! Settings resolution: optional TOML file, then environment overrides.
//!
//! Values come from the file named by `TONS_CONFIG` (if set), then from
//! `TONS_*` environment variables. Invalid environment values fall back to
//! the current value without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `TONS_CONFIG` | unset | Path to a TOML settings file |
//! | `TONS_ENGINE` | `internal` | `internal`, `terminal-agent` or `ollama` |
//! | `TONS_MODEL_PATH` | unset | Model file for the embedded engine |
//! | `TONS_CONTEXT_SIZE` | 2048 | Embedded context window (tokens) |
//! | `TONS_N_THREADS` | 0 | Embedded decode threads (0 = auto) |
//! | `TONS_AGENT` | `claude-code` | Agent preset or custom agent name |
//! | `TONS_AGENT_COMMAND` | preset | Agent executable |
//! | `TONS_AGENT_ARGS` | preset | Whitespace-separated base arguments |
//! | `TONS_AGENT_TIMEOUT` | 60 | Agent timeout (secs) |
//! | `TONS_OLLAMA_HOST` | `http://localhost:11434` | Ollama base URL |
//! | `TONS_OLLAMA_MODEL` | `llama3.2` | Ollama model |
//! | `TONS_OLLAMA_TIMEOUT` | 120 | Ollama generation timeout (secs) |
//! | `TONS_TEMPERATURE` | 0.7 | Sampling temperature |
//! | `TONS_TOP_P` | 0.9 | Nucleus sampling threshold |
//! | `TONS_MAX_TOKENS` | 512 | Generation budget |
//! | `TONS_PROMPT` | built-in | Prompt template |
//! | `TONS_SYSTEM_PROMPT` | built-in | System prompt (empty disables) |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{
    AgentPreset, EmbeddedConfig, Engine, EngineError, ProcessConfig, ProcessEngine, RemoteConfig,
    RemoteEngine, Request, SamplingConfig, DEFAULT_PROMPT_TEMPLATE, DEFAULT_SYSTEM_PROMPT,
};

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which backend to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    #[default]
    #[serde(rename = "internal", alias = "embedded")]
    Embedded,
    #[serde(rename = "terminal-agent", alias = "agent")]
    Agent,
    #[serde(rename = "ollama", alias = "remote")]
    Remote,
}

impl EngineKind {
    pub fn id(self) -> &'static str {
        match self {
            Self::Embedded => "internal",
            Self::Agent => "terminal-agent",
            Self::Remote => "ollama",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for EngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" | "embedded" => Ok(Self::Embedded),
            "terminal-agent" | "agent" => Ok(Self::Agent),
            "ollama" | "remote" => Ok(Self::Remote),
            other => Err(EngineError::InvalidConfig(format!("unknown engine: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedSection {
    pub model_path: PathBuf,
    pub context_size: u32,
    pub n_threads: u32,
    pub n_gpu_layers: u32,
}

impl Default for EmbeddedSection {
    fn default() -> Self {
        let defaults = EmbeddedConfig::default();
        Self {
            model_path: defaults.model_path,
            context_size: defaults.context_size,
            n_threads: defaults.n_threads,
            n_gpu_layers: defaults.n_gpu_layers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Preset id, or the name of a custom agent.
    pub agent: String,
    /// Executable override.
    pub command: Option<String>,
    /// Base argument override.
    pub args: Option<Vec<String>>,
    pub timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            agent: AgentPreset::ClaudeCode.id().to_string(),
            command: None,
            args: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSection {
    pub host: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for OllamaSection {
    fn default() -> Self {
        let defaults = RemoteConfig::default();
        Self {
            host: defaults.host,
            model: defaults.model,
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSection {
    pub template: String,
    /// Empty disables the system prompt.
    pub system_prompt: String,
}

impl Default for PromptSection {
    fn default() -> Self {
        Self {
            template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineKind,
    pub embedded: EmbeddedSection,
    pub agent: AgentSection,
    pub ollama: OllamaSection,
    pub sampling: SamplingConfig,
    pub prompt: PromptSection,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an env var, returning `current` on missing or invalid.
fn parse_env<T: FromStr>(key: &str, current: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(current),
        Err(_) => current,
    }
}

/// Load settings from `TONS_CONFIG` (if set) and the environment.
pub fn load() -> Result<Settings, ConfigError> {
    let settings = match std::env::var_os("TONS_CONFIG") {
        Some(path) => Settings::from_file(Path::new(&path))?,
        None => Settings::default(),
    };
    Ok(settings.with_env_overrides())
}

impl Settings {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Apply `TONS_*` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(engine) = env_string("TONS_ENGINE") {
            match engine.parse() {
                Ok(kind) => self.engine = kind,
                Err(e) => tracing::warn!(error = %e, "ignoring TONS_ENGINE"),
            }
        }

        if let Some(path) = env_string("TONS_MODEL_PATH") {
            self.embedded.model_path = PathBuf::from(path);
        }
        self.embedded.context_size = parse_env("TONS_CONTEXT_SIZE", self.embedded.context_size).max(128);
        self.embedded.n_threads = parse_env("TONS_N_THREADS", self.embedded.n_threads);

        if let Some(agent) = env_string("TONS_AGENT") {
            self.agent.agent = agent;
        }
        if let Some(command) = env_string("TONS_AGENT_COMMAND") {
            self.agent.command = Some(command);
        }
        if let Some(args) = env_string("TONS_AGENT_ARGS") {
            self.agent.args = Some(args.split_whitespace().map(String::from).collect());
        }
        self.agent.timeout_secs = parse_env("TONS_AGENT_TIMEOUT", self.agent.timeout_secs).max(1);

        if let Some(host) = env_string("TONS_OLLAMA_HOST") {
            self.ollama.host = host;
        }
        if let Some(model) = env_string("TONS_OLLAMA_MODEL") {
            self.ollama.model = model;
        }
        self.ollama.timeout_secs = parse_env("TONS_OLLAMA_TIMEOUT", self.ollama.timeout_secs).max(1);

        let sampling = SamplingConfig {
            temperature: parse_env("TONS_TEMPERATURE", self.sampling.temperature),
            top_p: parse_env("TONS_TOP_P", self.sampling.top_p),
            max_tokens: parse_env("TONS_MAX_TOKENS", self.sampling.max_tokens),
        };
        match sampling.validate() {
            Ok(()) => self.sampling = sampling,
            Err(e) => tracing::warn!(error = %e, "ignoring sampling overrides"),
        }

        if let Some(template) = env_string("TONS_PROMPT") {
            self.prompt.template = template;
        }
        if let Ok(system_prompt) = std::env::var("TONS_SYSTEM_PROMPT") {
            self.prompt.system_prompt = system_prompt;
        }
        self
    }

    pub fn embedded_config(&self) -> EmbeddedConfig {
        EmbeddedConfig {
            model_path: self.embedded.model_path.clone(),
            context_size: self.embedded.context_size,
            n_threads: self.embedded.n_threads,
            n_gpu_layers: self.embedded.n_gpu_layers,
            sampling: self.sampling,
            ..Default::default()
        }
    }

    /// Agent configuration: a preset with overrides, or a custom agent
    /// whose command defaults to its name and whose arguments default to `-p`.
    pub fn process_config(&self) -> ProcessConfig {
        let section = &self.agent;
        let mut config = match section.agent.parse::<AgentPreset>() {
            Ok(preset) => preset.config(),
            Err(_) => ProcessConfig::custom(&section.agent, &section.agent, vec!["-p".into()]),
        };
        if let Some(command) = &section.command {
            config.command = command.clone();
        }
        if let Some(args) = &section.args {
            config.args = args.clone();
        }
        config.with_timeout(Duration::from_secs(section.timeout_secs))
    }

    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            host: self.ollama.host.clone(),
            model: self.ollama.model.clone(),
            timeout: Duration::from_secs(self.ollama.timeout_secs),
            sampling: self.sampling,
        }
    }

    /// Build the selected engine.
    pub fn build_engine(&self) -> Result<Box<dyn Engine>, EngineError> {
        match self.engine {
            EngineKind::Embedded => build_embedded(self.embedded_config()),
            EngineKind::Agent => Ok(Box::new(ProcessEngine::new(self.process_config())?)),
            EngineKind::Remote => Ok(Box::new(RemoteEngine::new(self.remote_config())?)),
        }
    }

    /// Request using the configured template and system prompt.
    pub fn request(
        &self,
        text: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Request {
        Request::new(text, source_lang, target_lang)
            .with_template(self.prompt.template.clone())
            .with_system_prompt(self.prompt.system_prompt.clone())
    }

    /// Render as TOML, suitable for `TONS_CONFIG`.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(feature = "gguf")]
fn build_embedded(config: EmbeddedConfig) -> Result<Box<dyn Engine>, EngineError> {
    Ok(Box::new(crate::engine::EmbeddedEngine::new(config)?))
}

#[cfg(not(feature = "gguf"))]
fn build_embedded(config: EmbeddedConfig) -> Result<Box<dyn Engine>, EngineError> {
    config.validate()?;
    Err(EngineError::Initialization(
        "embedded engine requires the `gguf` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "TONS_CONFIG",
        "TONS_ENGINE",
        "TONS_MODEL_PATH",
        "TONS_CONTEXT_SIZE",
        "TONS_N_THREADS",
        "TONS_AGENT",
        "TONS_AGENT_COMMAND",
        "TONS_AGENT_ARGS",
        "TONS_AGENT_TIMEOUT",
        "TONS_OLLAMA_HOST",
        "TONS_OLLAMA_MODEL",
        "TONS_OLLAMA_TIMEOUT",
        "TONS_TEMPERATURE",
        "TONS_TOP_P",
        "TONS_MAX_TOKENS",
        "TONS_PROMPT",
        "TONS_SYSTEM_PROMPT",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load().unwrap();
        assert_eq!(cfg.engine, EngineKind::Embedded);
        assert_eq!(cfg.embedded.context_size, 2048);
        assert_eq!(cfg.agent.agent, "claude-code");
        assert_eq!(cfg.agent.timeout_secs, 60);
        assert_eq!(cfg.ollama.host, "http://localhost:11434");
        assert_eq!(cfg.ollama.model, "llama3.2");
        assert_eq!(cfg.ollama.timeout_secs, 120);
        assert_eq!(cfg.sampling, SamplingConfig::default());
        assert_eq!(cfg.prompt.template, DEFAULT_PROMPT_TEMPLATE);
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("TONS_ENGINE", "ollama");
        std::env::set_var("TONS_OLLAMA_MODEL", "qwen2.5:7b");
        std::env::set_var("TONS_AGENT_ARGS", "--quiet  -p");
        std::env::set_var("TONS_TEMPERATURE", "0.2");
        std::env::set_var("TONS_SYSTEM_PROMPT", "");
        let cfg = load().unwrap();
        assert_eq!(cfg.engine, EngineKind::Remote);
        assert_eq!(cfg.ollama.model, "qwen2.5:7b");
        assert_eq!(cfg.agent.args, Some(vec!["--quiet".to_string(), "-p".to_string()]));
        assert_eq!(cfg.sampling.temperature, 0.2);
        assert!(cfg.request("a", "en", "ko").system_prompt.is_none());
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("TONS_ENGINE", "quantum");
        std::env::set_var("TONS_CONTEXT_SIZE", "lots");
        std::env::set_var("TONS_TOP_P", "7");
        std::env::set_var("TONS_AGENT_TIMEOUT", "0");
        let cfg = load().unwrap();
        assert_eq!(cfg.engine, EngineKind::Embedded);
        assert_eq!(cfg.embedded.context_size, 2048);
        assert_eq!(cfg.sampling.top_p, 0.9);
        assert_eq!(cfg.agent.timeout_secs, 1);
        clear_env_vars();
    }

    #[test]
    fn test_file_then_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tons.toml");
        std::fs::write(
            &path,
            "engine = \"terminal-agent\"\n[agent]\nagent = \"gemini-cli\"\ntimeout_secs = 30\n[ollama]\nmodel = \"mistral\"\n",
        )
        .unwrap();
        std::env::set_var("TONS_CONFIG", &path);
        std::env::set_var("TONS_OLLAMA_MODEL", "gemma2");
        let cfg = load().unwrap();
        assert_eq!(cfg.engine, EngineKind::Agent);
        assert_eq!(cfg.agent.agent, "gemini-cli");
        assert_eq!(cfg.agent.timeout_secs, 30);
        assert_eq!(cfg.ollama.model, "gemma2");
        clear_env_vars();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("TONS_CONFIG", "/nonexistent/tons.toml");
        assert!(matches!(load(), Err(ConfigError::Read { .. })));
        clear_env_vars();
    }

    #[test]
    fn engine_kind_accepts_application_ids() {
        assert_eq!("internal".parse::<EngineKind>().unwrap(), EngineKind::Embedded);
        assert_eq!("terminal-agent".parse::<EngineKind>().unwrap(), EngineKind::Agent);
        assert_eq!("OLLAMA".parse::<EngineKind>().unwrap(), EngineKind::Remote);
        let parsed = Settings::from_toml_str("engine = \"remote\"").unwrap();
        assert_eq!(parsed.engine, EngineKind::Remote);
    }

    #[test]
    fn custom_agent_defaults_to_its_name() {
        let mut settings = Settings::default();
        settings.agent.agent = "aider".into();
        let config = settings.process_config();
        assert_eq!(config.command, "aider");
        assert_eq!(config.args, vec!["-p"]);
        assert_eq!(config.output, crate::engine::OutputFormat::Raw);
    }

    #[test]
    fn preset_overrides_apply() {
        let mut settings = Settings::default();
        settings.agent.command = Some("/opt/claude/bin/claude".into());
        settings.agent.timeout_secs = 5;
        let config = settings.process_config();
        assert_eq!(config.command, "/opt/claude/bin/claude");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.output, crate::engine::OutputFormat::EventStream);
    }

    #[test]
    fn settings_round_trip_through_toml() {
        let settings = Settings::default();
        let parsed = Settings::from_toml_str(&settings.to_toml()).unwrap();
        assert_eq!(parsed, settings);
    }

    #[cfg(not(feature = "gguf"))]
    #[test]
    fn embedded_needs_gguf_feature() {
        let mut settings = Settings::default();
        settings.embedded.model_path = "/m/model.gguf".into();
        let err = settings.build_engine().err().unwrap();
        assert!(matches!(err, EngineError::Initialization(_)));
    }
}
