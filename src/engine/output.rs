//! Translation response type.
//!
//! The same type serves blocking and streaming calls. A response with
//! `done == true` or a set `error` is terminal: nothing follows it.

use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// An incremental or complete translation payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub text: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Non-terminal streamed fragment.
    pub fn delta(text: impl Into<String>) -> Self {
        Self { text: text.into(), done: false, error: None }
    }

    /// Terminal response carrying the full result.
    pub fn complete(text: impl Into<String>) -> Self {
        Self { text: text.into(), done: true, error: None }
    }

    /// Terminal response with no text.
    pub fn finished() -> Self {
        Self::complete(String::new())
    }

    /// Terminal error response. Partial text, if any, is carried along.
    pub fn failed(err: &EngineError) -> Self {
        Self {
            text: err.partial_text().unwrap_or_default().to_string(),
            done: true,
            error: Some(err.to_string()),
        }
    }

    /// True if no further response will follow this one.
    pub fn is_terminal(&self) -> bool {
        self.done || self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

impl From<EngineError> for Response {
    fn from(err: EngineError) -> Self {
        Self::failed(&err)
    }
}

/// How streamed `text` relates to the final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Each response carries only new text; concatenate them.
    Delta,
    /// Each response carries all text so far; keep the last one.
    Cumulative,
}

/// Why a decode loop stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced its end-of-sequence token.
    EndOfSequence,
    /// The token budget was exhausted.
    MaxTokens,
    /// The consumer went away.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_not_terminal() {
        let r = Response::delta("abc");
        assert!(!r.is_terminal());
        assert!(!r.is_error());
    }

    #[test]
    fn error_is_terminal_regardless_of_done() {
        let r = Response { text: String::new(), done: false, error: Some("boom".into()) };
        assert!(r.is_terminal());
        assert!(r.is_error());
    }

    #[test]
    fn failed_keeps_partial_text() {
        let err = EngineError::Generation("decode".into()).with_partial("Hel".into());
        let r = Response::from(err);
        assert_eq!(r.text, "Hel");
        assert!(r.done);
        assert_eq!(r.error.as_deref(), Some("generation failed: decode"));
    }

    #[test]
    fn error_field_is_omitted_when_unset() {
        let json = serde_json::to_string(&Response::complete("ok")).unwrap();
        assert_eq!(json, r#"{"text":"ok","done":true}"#);
    }
}
