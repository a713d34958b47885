//! Translation request type.

use serde::{Deserialize, Serialize};

use super::prompt::{build_prompt, DEFAULT_PROMPT_TEMPLATE, DEFAULT_SYSTEM_PROMPT};

/// A single translation request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    /// Template with `{{text}}`, `{{source_lang}}` and `{{target_lang}}` placeholders.
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Request {
    /// Request using the default template and system prompt.
    pub fn new(
        text: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            prompt: DEFAULT_PROMPT_TEMPLATE.to_string(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.prompt = template.into();
        self
    }

    /// Set the system prompt. An empty string clears it.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        self.system_prompt = (!system_prompt.is_empty()).then_some(system_prompt);
        self
    }

    /// True when there is nothing to translate.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The literal prompt sent to a backend.
    pub fn build_prompt(&self) -> String {
        build_prompt(&self.prompt, &self.text, &self.source_lang, &self.target_lang)
    }

    /// System prompt, if one is set and non-empty.
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref().filter(|s| !s.is_empty())
    }
}
