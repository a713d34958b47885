//! Tests for prompt construction through the public request API.

use tons_core::config::Settings;
use tons_core::engine::{build_prompt, DEFAULT_PROMPT_TEMPLATE, DEFAULT_SYSTEM_PROMPT};
use tons_core::Request;

#[test]
fn test_default_template_mentions_languages_and_text() {
    let prompt = Request::new("Guten Morgen", "German", "English").build_prompt();
    assert!(prompt.starts_with("Translate the following text from German to English."));
    assert!(prompt.ends_with("Text to translate:\nGuten Morgen"));
    assert!(!prompt.contains("{{"));
}

#[test]
fn test_repeated_placeholders_all_replaced() {
    let prompt = build_prompt("{{text}} / {{text}} ({{target_lang}})", "hi", "en", "ko");
    assert_eq!(prompt, "hi / hi (ko)");
}

#[test]
fn test_unknown_placeholders_are_kept() {
    let prompt = build_prompt("{{tone}} {{text}} {{", "hi", "en", "ko");
    assert_eq!(prompt, "{{tone}} hi {{");
}

#[test]
fn test_user_text_is_not_expanded() {
    let prompt = build_prompt("[{{text}}] -> {{target_lang}}", "{{target_lang}}", "en", "ko");
    assert_eq!(prompt, "[{{target_lang}}] -> ko");
}

#[test]
fn test_multibyte_text_survives() {
    let prompt = build_prompt("{{source_lang}}: {{text}}", "안녕하세요 👋", "한국어", "en");
    assert_eq!(prompt, "한국어: 안녕하세요 👋");
}

#[test]
fn test_settings_request_carries_prompts() {
    let mut settings = Settings::default();
    let request = settings.request("hi", "en", "ko");
    assert_eq!(request.prompt, DEFAULT_PROMPT_TEMPLATE);
    assert_eq!(request.system_prompt(), Some(DEFAULT_SYSTEM_PROMPT));

    settings.prompt.template = "{{text}}=>{{target_lang}}".into();
    settings.prompt.system_prompt = String::new();
    let request = settings.request("hi", "en", "ko");
    assert_eq!(request.build_prompt(), "hi=>ko");
    assert!(request.system_prompt().is_none());
}

#[test]
fn test_request_json_round_trip() {
    let request = Request::new("hi", "en", "ko");
    let json = serde_json::to_string(&request).unwrap();
    assert!(json.contains("\"sourceLang\":\"en\""));
    let back: Request = serde_json::from_str(&json).unwrap();
    assert_eq!(back, request);
}
