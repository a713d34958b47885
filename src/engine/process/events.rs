//! Line-delimited JSON events emitted by structured-output agents.
//!
//! Two content shapes are understood: a plain `{"type":"delta","text":..}`
//! record and the `stream_event` wrapper whose inner event is a
//! `content_block_delta` carrying a `text_delta`. A `result` record ends
//! the output. Anything else, including lines that are not JSON, is
//! ignored.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentEvent {
    Delta {
        #[serde(default)]
        text: String,
    },
    StreamEvent {
        #[serde(default)]
        event: Option<InnerEvent>,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct InnerEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<ContentDelta>,
}

#[derive(Debug, Deserialize)]
struct ContentDelta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl AgentEvent {
    fn delta_text(&self) -> Option<&str> {
        match self {
            Self::Delta { text } => Some(text),
            Self::StreamEvent { event: Some(inner) } if inner.kind == "content_block_delta" => {
                match &inner.delta {
                    Some(delta) if delta.kind == "text_delta" => Some(&delta.text),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// What a decoded line means for the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// New content arrived; carries all text so far.
    Text(String),
    /// The agent reported its final result.
    Finished,
}

/// Accumulates delta events into cumulative text.
#[derive(Debug, Default)]
pub struct EventAccumulator {
    text: String,
    result: Option<String>,
}

impl EventAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line. Returns `None` for lines that change nothing.
    pub fn push_line(&mut self, line: &str) -> Option<EventOutcome> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let event: AgentEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) => {
                tracing::trace!(line, "skipping non-event line");
                return None;
            }
        };

        if let AgentEvent::Result { result } = event {
            self.result = result;
            return Some(EventOutcome::Finished);
        }
        match event.delta_text() {
            Some(delta) if !delta.is_empty() => {
                self.text.push_str(delta);
                Some(EventOutcome::Text(self.text.clone()))
            }
            _ => None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Final text: the streamed content, or the result record's text when
    /// nothing was streamed.
    pub fn into_text(self) -> String {
        match self.result {
            Some(result) if self.text.is_empty() => result,
            _ => self.text,
        }
    }
}

/// Decode a complete captured output into its final text.
pub fn final_text(output: &[u8]) -> String {
    let mut acc = EventAccumulator::new();
    for line in String::from_utf8_lossy(output).lines() {
        if acc.push_line(line) == Some(EventOutcome::Finished) {
            break;
        }
    }
    acc.into_text()
}
