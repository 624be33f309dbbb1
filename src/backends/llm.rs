//! LLM-backed collaborators: metadata extraction, translation and OCR.
//!
//! All three share one shape: build a short message list, call
//! `provider.chat`, and turn the provider error into a
//! [`CollaboratorError`] that says whether a retry can help. Retrying itself
//! is the caller's job ([`crate::retry::RetryPolicy`]), so each method here
//! performs exactly one request.

use super::encode::encode_page;
use super::{MetadataExtractor, OcrEngine, Translator};
use crate::book::MetadataRecord;
use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, ShelfError};
use crate::pipeline::metadata::parse_edition;
use crate::prompts::{
    metadata_user_prompt, translation_system_prompt, METADATA_SYSTEM_PROMPT, OCR_SYSTEM_PROMPT,
};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Sampling settings shared by every request.
#[derive(Debug, Clone, Copy)]
pub struct ChatSettings {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl ChatSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// Resolve a provider, from most to least specific:
///
/// 1. a pre-built provider;
/// 2. a provider name (+ model, default [`DEFAULT_MODEL`]);
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`;
/// 4. `ProviderFactory::from_env()` auto-detection from API-key variables.
pub fn resolve_provider(
    explicit: Option<&Arc<dyn LLMProvider>>,
    name: Option<&str>,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, ShelfError> {
    if let Some(p) = explicit {
        return Ok(Arc::clone(p));
    }
    if let Some(name) = name {
        return create_provider(name, model.unwrap_or(DEFAULT_MODEL));
    }
    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }
    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| ShelfError::ProviderNotConfigured {
        provider: "auto".to_string(),
        hint: format!(
            "No LLM provider could be auto-detected from environment.\n\
             Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or LLM_PROVIDER in the settings file.\n\
             Error: {e}"
        ),
    })?;
    Ok(llm)
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ShelfError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| ShelfError::ProviderNotConfigured {
        provider: name.to_string(),
        hint: format!("{e}"),
    })
}

/// Decide from an error message whether the failure is worth retrying.
///
/// Authentication and request-shape problems are permanent; rate limits,
/// timeouts, 5xx and connection errors are transient. Unknown errors are
/// treated as transient so a flaky backend gets its retries.
pub fn classify_error(service: &str, err: impl std::fmt::Display) -> CollaboratorError {
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();
    let permanent = [
        "401",
        "403",
        "unauthorized",
        "invalid api key",
        "invalid_api_key",
        "authentication",
        "permission",
        "content_filter",
        "model not found",
        "does not exist",
        "400 bad request",
    ];
    if permanent.iter().any(|p| lower.contains(p)) {
        CollaboratorError::permanent(service, msg)
    } else {
        CollaboratorError::transient(service, msg)
    }
}

async fn chat_once(
    provider: &Arc<dyn LLMProvider>,
    service: &str,
    messages: &[ChatMessage],
    settings: &ChatSettings,
) -> Result<String, CollaboratorError> {
    let response = provider
        .chat(messages, Some(&settings.options()))
        .await
        .map_err(|e| classify_error(service, e))?;
    debug!(
        "{}: {} input tokens, {} output tokens",
        service, response.prompt_tokens, response.completion_tokens
    );
    Ok(response.content)
}

// ── Metadata extraction ──────────────────────────────────────────────────

pub struct LlmMetadataExtractor {
    provider: Arc<dyn LLMProvider>,
    settings: ChatSettings,
}

impl LlmMetadataExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: ChatSettings) -> Self {
        Self { provider, settings }
    }
}

#[async_trait]
impl MetadataExtractor for LlmMetadataExtractor {
    async fn infer_metadata(&self, raw_text: &str) -> Result<MetadataRecord, CollaboratorError> {
        let messages = vec![
            ChatMessage::system(METADATA_SYSTEM_PROMPT),
            ChatMessage::user(metadata_user_prompt(raw_text)),
        ];
        let content = chat_once(&self.provider, "metadata-llm", &messages, &self.settings).await?;
        parse_metadata_json(&content).ok_or_else(|| {
            CollaboratorError::permanent(
                "metadata-llm",
                format!("response is not a JSON object: {}", preview(&content)),
            )
        })
    }
}

/// Pull the JSON object out of a model reply, tolerating fences and chatter.
pub fn parse_metadata_json(reply: &str) -> Option<MetadataRecord> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&reply[start..=end]).ok()?;
    let obj = value.as_object()?;

    let text = |key: &str| -> String {
        match obj.get(key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    };
    let list = |key: &str| -> Vec<String> {
        match obj.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => s
                .split([',', ';'])
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    };
    let edition = match obj.get("edition") {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as u32),
        Some(Value::String(s)) => parse_edition(s),
        _ => None,
    };

    Some(MetadataRecord {
        title: text("title"),
        subtitle: text("subtitle"),
        authors: list("authors"),
        publisher: text("publisher"),
        published_date: text("published_date"),
        edition,
        isbn: text("isbn"),
        categories: list("categories"),
        language: text("language"),
        ..Default::default()
    })
}

// ── Translation ──────────────────────────────────────────────────────────

pub struct LlmTranslator {
    provider: Arc<dyn LLMProvider>,
    settings: ChatSettings,
    name: String,
}

impl LlmTranslator {
    /// `label` names the backend in logs and errors, e.g. the provider name.
    pub fn new(provider: Arc<dyn LLMProvider>, settings: ChatSettings, label: &str) -> Self {
        let name = format!("llm:{label}");
        Self {
            provider,
            settings,
            name,
        }
    }
}

#[async_trait]
impl Translator for LlmTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn translate(&self, text: &str, domain_hint: &str) -> Result<String, CollaboratorError> {
        let messages = vec![
            ChatMessage::system(translation_system_prompt(domain_hint)),
            ChatMessage::user(text),
        ];
        let reply = chat_once(&self.provider, &self.name, &messages, &self.settings).await?;
        let cleaned = clean_translation(&reply);
        if cleaned.is_empty() {
            return Err(CollaboratorError::transient(&self.name, "empty translation"));
        }
        Ok(cleaned)
    }
}

static MODEL_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:翻译|译文|中文翻译|translation|translated text)\s*[:：]\s*").unwrap()
});

/// Strip the wrapping models like to add around a translation.
pub fn clean_translation(reply: &str) -> String {
    let mut s = reply.trim();
    if s.starts_with("```") {
        s = s.trim_start_matches('`');
        s = s.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        s = s.trim_end_matches('`').trim();
    }
    let s = MODEL_PREFIX.replace(s, "");
    let mut s = s.trim().to_string();

    let single_line = !s.contains('\n');
    if single_line {
        strip_full_stops(&mut s);
    }
    for (open, close) in [('"', '"'), ('“', '”'), ('「', '」'), ('\'', '\'')] {
        if s.chars().count() >= 2 && s.starts_with(open) && s.ends_with(close) {
            s = s[open.len_utf8()..s.len() - close.len_utf8()].trim().to_string();
        }
    }
    if single_line {
        strip_full_stops(&mut s);
    }
    s
}

fn strip_full_stops(s: &mut String) {
    while s.ends_with('。') {
        s.pop();
    }
}

// ── OCR ──────────────────────────────────────────────────────────────────

pub struct VisionOcr {
    provider: Arc<dyn LLMProvider>,
    settings: ChatSettings,
}

impl VisionOcr {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: ChatSettings) -> Self {
        Self { provider, settings }
    }
}

#[async_trait]
impl OcrEngine for VisionOcr {
    async fn recognize(&self, page: DynamicImage) -> Result<String, CollaboratorError> {
        let image = encode_page(&page).map_err(|e| CollaboratorError::permanent("ocr", e))?;
        let messages = vec![
            ChatMessage::system(OCR_SYSTEM_PROMPT),
            ChatMessage::user_with_images("", vec![image]),
        ];
        chat_once(&self.provider, "ocr", &messages, &self.settings).await
    }
}

fn preview(s: &str) -> String {
    let head: String = s.chars().take(120).collect();
    if head.len() < s.len() {
        format!("{head}…")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let reply = r#"Here you go:
```json
{"title": "Example", "subtitle": "", "authors": ["Ann Lee", "Bo Chen"],
 "publisher": "Acme", "published_date": "2020", "edition": "Second edition",
 "isbn": "978-93-5134-293-9", "categories": [], "language": "en"}
```"#;
        let m = parse_metadata_json(reply).unwrap();
        assert_eq!(m.title, "Example");
        assert_eq!(m.authors, vec!["Ann Lee", "Bo Chen"]);
        assert_eq!(m.edition, Some(2));
        assert_eq!(m.isbn, "978-93-5134-293-9");
    }

    #[test]
    fn tolerates_loose_types() {
        let m = parse_metadata_json(r#"{"title": "T", "edition": 3, "authors": "A; B", "published_date": 2019}"#)
            .unwrap();
        assert_eq!(m.edition, Some(3));
        assert_eq!(m.authors, vec!["A", "B"]);
        assert_eq!(m.published_date, "2019");
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_metadata_json("I could not find any metadata.").is_none());
        assert!(parse_metadata_json("} {").is_none());
    }

    #[test]
    fn cleans_translation_wrapping() {
        assert_eq!(clean_translation("翻译：“示例”。"), "示例");
        assert_eq!(clean_translation("Translation: 深入理解 Rust"), "深入理解 Rust");
        assert_eq!(clean_translation("```text\n数据库系统\n```"), "数据库系统");
        assert_eq!(clean_translation("1. 引言\n2. 安装。"), "1. 引言\n2. 安装。");
    }

    #[test]
    fn classifies_errors() {
        assert!(classify_error("llm", "HTTP 429 Too Many Requests").is_transient());
        assert!(classify_error("llm", "request timed out").is_transient());
        assert!(!classify_error("llm", "401 Unauthorized: invalid api key").is_transient());
    }
}
