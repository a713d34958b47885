//! Engine error types.
//!
//! Every failure an engine can hit maps onto one variant here. Streaming
//! calls never surface these directly: workers convert them into a terminal
//! [`Response`](super::Response) carrying the rendered message.

use thiserror::Error;

/// Errors that can occur while driving a translation backend.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Backend or model unavailable, failed to load, or engine already closed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Cancelled while waiting for the exclusive-use gate.
    #[error("failed to acquire model: {0}")]
    Acquisition(String),

    /// Decode or sampling failure.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Deadline exceeded or the caller cancelled the call.
    #[error("translation timed out")]
    Timeout,

    /// Spawn failure, broken pipe or non-zero exit of an agent process.
    #[error("terminal agent error: {0}")]
    Process(String),

    /// HTTP-level failure talking to the model server.
    #[error("ollama error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A failure that happened after some output was already produced.
    #[error("{source}")]
    Partial {
        text: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Wrap `self` with already-generated text. Empty text leaves it unchanged.
    pub fn with_partial(self, text: String) -> Self {
        if text.is_empty() {
            return self;
        }
        match self {
            Self::Partial { source, .. } => Self::Partial { text, source },
            other => Self::Partial {
                text,
                source: Box::new(other),
            },
        }
    }

    /// Text produced before the failure, if any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            Self::Partial { text, .. } => Some(text),
            _ => None,
        }
    }

    /// The underlying error, looking through `Partial`.
    pub fn root(&self) -> &EngineError {
        match self {
            Self::Partial { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true if the call hit its deadline or was cancelled.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout)
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Self::Initialization(_) => "initialization",
            Self::Acquisition(_) => "acquisition",
            Self::Generation(_) => "generation",
            Self::Timeout => "timeout",
            Self::Process(_) => "process",
            Self::Transport(_) => "transport",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Partial { .. } => "partial",
        }
    }
}
