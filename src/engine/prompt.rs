//! Prompt template substitution.

/// Default translation prompt template.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "Translate the following text from {{source_lang}} to {{target_lang}}.
Keep the original formatting and tone.
Only return the translated text without any explanations.

Text to translate:
{{text}}";

/// Default system prompt for agents and servers that accept one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a professional translator. Translate accurately while preserving the original tone, style, and formatting. Only output the translation without explanations.";

const TEXT: &str = "{{text}}";
const SOURCE_LANG: &str = "{{source_lang}}";
const TARGET_LANG: &str = "{{target_lang}}";

/// Replace `{{text}}`, `{{source_lang}}` and `{{target_lang}}` in one pass.
///
/// Substituted values are copied literally and never rescanned, so a value
/// that itself contains a placeholder is left untouched.
pub fn build_prompt(template: &str, text: &str, source_lang: &str, target_lang: &str) -> String {
    let replacements = [(TEXT, text), (SOURCE_LANG, source_lang), (TARGET_LANG, target_lang)];
    let mut out = String::with_capacity(template.len() + text.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match replacements.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
