//! Request classification: derives the routing features of one request from
//! its headers and buffered body.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::tokenizer::TokenCounter;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const MODEL_HEADER: &str = "x-gateway-model-name";

/// Bytes per token assumed when no tokenizer result is available.
const HEURISTIC_BYTES_PER_TOKEN: u64 = 4;

/// Split routing applies only when enabled and the prompt is strictly longer
/// than the threshold.
pub fn disaggregation_eligible(enabled: bool, threshold: u64, prompt_tokens: u64) -> bool {
    enabled && prompt_tokens > threshold
}

pub fn heuristic_token_count(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(HEURISTIC_BYTES_PER_TOKEN)
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub disaggregation_enabled: bool,
    pub prompt_len_threshold: u64,
    /// Multiplier applied to approximate estimates before the threshold check.
    pub approximate_safety_factor: f64,
    pub request_budget: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            disaggregation_enabled: false,
            prompt_len_threshold: 0,
            approximate_safety_factor: 1.25,
            request_budget: Duration::from_secs(5),
        }
    }
}

/// Features available once the request headers arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFeatures {
    pub request_id: String,
    pub model_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    /// Set when `prompt_tokens` came from the byte heuristic.
    pub approximate: bool,
    pub disaggregation_eligible: bool,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

enum PromptText {
    Text(String),
    /// Pre-tokenized prompt; the length is exact.
    TokenIds(usize),
}

pub struct RequestClassifier {
    config: ClassifierConfig,
    tokenizer: Option<Arc<dyn TokenCounter>>,
}

impl std::fmt::Debug for RequestClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClassifier")
            .field("config", &self.config)
            .field("tokenizer", &self.tokenizer.as_ref().map(|t| t.name()))
            .finish()
    }
}

impl RequestClassifier {
    pub fn new(config: ClassifierConfig, tokenizer: Option<Arc<dyn TokenCounter>>) -> Self {
        Self { config, tokenizer }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn inspect_headers(&self, headers: &[(String, String)]) -> HeaderFeatures {
        let request_id = header_value(headers, REQUEST_ID_HEADER)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let model_override = header_value(headers, MODEL_HEADER)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        HeaderFeatures {
            request_id,
            model_override,
        }
    }

    /// Complete classification once the body is fully buffered. `started` is
    /// when the session began; the budget is measured from there.
    pub fn classify(
        &self,
        features: HeaderFeatures,
        body: &[u8],
        started: Instant,
    ) -> RequestContext {
        let json = if body.is_empty() {
            None
        } else {
            serde_json::from_slice::<Value>(body).ok()
        };

        let body_model = json
            .as_ref()
            .and_then(|j| j.get("model"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let model = features.model_override.or(body_model).unwrap_or_default();

        let (prompt_tokens, approximate) = match json.as_ref().and_then(extract_prompt) {
            Some(PromptText::TokenIds(n)) => (n as u64, false),
            Some(PromptText::Text(text)) => self.count(&text),
            None if body.is_empty() => (0, false),
            None => (heuristic_token_count(body.len()), true),
        };

        let effective = if approximate {
            (prompt_tokens as f64 * self.config.approximate_safety_factor).ceil() as u64
        } else {
            prompt_tokens
        };
        let eligible = disaggregation_eligible(
            self.config.disaggregation_enabled,
            self.config.prompt_len_threshold,
            effective,
        );

        tracing::debug!(
            request_id = %features.request_id,
            model = %model,
            prompt_tokens,
            approximate,
            eligible,
            "request classified"
        );

        RequestContext {
            request_id: features.request_id,
            model,
            prompt_tokens,
            approximate,
            disaggregation_eligible: eligible,
            deadline: started + self.config.request_budget,
        }
    }

    fn count(&self, text: &str) -> (u64, bool) {
        let Some(tokenizer) = self.tokenizer.as_ref() else {
            return (heuristic_token_count(text.len()), true);
        };
        match tokenizer.count_tokens(text) {
            Ok(n) => (n as u64, false),
            Err(e) => {
                tracing::debug!(error = %e, tokenizer = tokenizer.name(), "token count failed, using byte heuristic");
                (heuristic_token_count(text.len()), true)
            }
        }
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Prompt of an OpenAI-style completions, chat, or responses request.
fn extract_prompt(json: &Value) -> Option<PromptText> {
    if let Some(prompt) = json.get("prompt") {
        return match prompt {
            Value::String(s) => Some(PromptText::Text(s.clone())),
            Value::Array(items) => batch_prompt(items),
            _ => None,
        };
    }

    if let Some(Value::Array(messages)) = json.get("messages") {
        let parts: Vec<String> = messages
            .iter()
            .filter_map(|m| m.get("content"))
            .map(content_text)
            .collect();
        return Some(PromptText::Text(parts.join("\n")));
    }

    match json.get("input") {
        Some(Value::String(s)) => Some(PromptText::Text(s.clone())),
        Some(Value::Array(items)) => batch_prompt(items),
        _ => None,
    }
}

/// A list prompt: token ids, strings, or a batch of token-id lists. Mixed or
/// unknown shapes yield `None` so the caller falls back to the byte count.
fn batch_prompt(items: &[Value]) -> Option<PromptText> {
    if items.iter().all(Value::is_number) {
        return Some(PromptText::TokenIds(items.len()));
    }
    if let Some(texts) = items.iter().map(Value::as_str).collect::<Option<Vec<_>>>() {
        return Some(PromptText::Text(texts.join("\n")));
    }
    items
        .iter()
        .map(|item| match item {
            Value::Array(ids) if ids.iter().all(Value::is_number) => Some(ids.len()),
            _ => None,
        })
        .sum::<Option<usize>>()
        .map(PromptText::TokenIds)
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
