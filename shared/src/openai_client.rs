//! OpenAI chat client used by the story generator. Speaks the
//! chat-completions wire format with `response_format: json_object` and
//! wraps every call in a bounded retry loop with exponential backoff.
//!
//! This layer only guarantees "well-formed structured output was
//! obtained"; whether the object is a usable story is the QA rubric's
//! concern.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum PromptError {
    #[error("no OpenAI credentials configured")]
    NoApiKey,
    #[error("network error: {0}")]
    Network(String),
    #[error("http error: {0}")]
    Http(u16),
    #[error("all attempts exhausted: {0}")]
    Exhausted(String),
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    response_format: ResponseFormat,
}

/// Assistant content arrives either as a plain string or as an array of
/// text parts. Resolved here, once, so the rest of the pipeline only ever
/// sees a flat string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

impl MessageContent {
    fn into_text(self) -> Option<String> {
        match self {
            MessageContent::Text(t) if !t.trim().is_empty() => Some(t),
            MessageContent::Text(_) => None,
            MessageContent::Parts(parts) => {
                let joined: String = parts.into_iter().filter_map(|p| p.text).collect();
                if joined.trim().is_empty() {
                    None
                } else {
                    Some(joined)
                }
            }
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            MessageContent::Text(_) => "text",
            MessageContent::Parts(_) => "parts",
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageCounters {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageCounters>,
}

/// Normalized token accounting for one successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    fn normalized(raw: &UsageCounters) -> Self {
        let prompt_tokens = raw.prompt_tokens.max(0);
        let completion_tokens = raw.completion_tokens.max(0);
        let total_tokens = if raw.total_tokens > 0 {
            raw.total_tokens
        } else {
            prompt_tokens + completion_tokens
        };
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

/// Parsed object plus its usage snapshot and the raw text it came from.
#[derive(Debug, Clone)]
pub struct StructuredAnswer {
    pub value: Value,
    pub usage: TokenUsage,
    pub raw: String,
}

#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub max_retries: usize,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout_ms: u64,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        InvokeOptions {
            max_retries: 2,
            temperature: 0.8,
            max_tokens: None,
            timeout_ms: 25_000,
        }
    }
}

/// Resolve the API key: explicit configuration wins, environment second.
pub fn resolve_api_key(configured: &str) -> Option<String> {
    if !configured.trim().is_empty() {
        return Some(configured.trim().to_string());
    }
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
}

fn api_base() -> String {
    std::env::var("OPENAI_API_BASE").unwrap_or_else(|_| "https://api.openai.com".into())
}

struct RawChatOutcome {
    text: Option<String>,
    content_shape: &'static str,
    content_len: usize,
    finish_reason: Option<String>,
    usage: UsageCounters,
}

async fn call_chat_json(
    client: &Client,
    key: &str,
    model: &str,
    system: &str,
    user: &str,
    temperature: f32,
    max_tokens: Option<u32>,
) -> Result<RawChatOutcome, PromptError> {
    let req = ChatRequest {
        model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ],
        temperature,
        max_tokens,
        response_format: ResponseFormat {
            format_type: "json_object",
        },
    };

    let url = format!("{}/v1/chat/completions", api_base());
    debug!(model, "→ OpenAI request");
    let res = client
        .post(url)
        .bearer_auth(key)
        .json(&req)
        .send()
        .await
        .map_err(|e| PromptError::Network(e.to_string()))?;

    let status = res.status();
    let bytes = res
        .bytes()
        .await
        .map_err(|e| PromptError::Network(e.to_string()))?;
    debug!(
        status = %status,
        "← body = {}",
        String::from_utf8_lossy(&bytes[..bytes.len().min(1024)])
    );

    if !status.is_success() {
        return Err(PromptError::Http(status.as_u16()));
    }

    let chat: ChatCompletion = serde_json::from_slice(&bytes)
        .map_err(|e| PromptError::Network(format!("undecodable completion body: {e}")))?;
    let usage = chat.usage.unwrap_or_default();
    let choice = chat.choices.into_iter().next();
    let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
    let content = choice.and_then(|c| c.message.content);
    let content_shape = content.as_ref().map(|c| c.shape()).unwrap_or("missing");
    let text = content.and_then(|c| c.into_text());
    let content_len = text.as_ref().map(|t| t.len()).unwrap_or(0);

    Ok(RawChatOutcome {
        text,
        content_shape,
        content_len,
        finish_reason,
        usage,
    })
}

/// Remove common Markdown code fences around JSON snippets.
fn strip_code_fences(s: &str) -> &str {
    let s = s.trim();
    let s = s.strip_prefix("```json").unwrap_or(s);
    let s = s.strip_prefix("```").unwrap_or(s);
    let s = s.strip_suffix("```").unwrap_or(s);
    s.trim()
}

/// Parse the model output into a JSON object, repairing sloppy output
/// where possible. Only objects count as structured results.
fn parse_structured(text: &str) -> Result<Value, String> {
    let t = strip_code_fences(text);
    if let Ok(v) = serde_json::from_str::<Value>(t) {
        if v.is_object() {
            return Ok(v);
        }
        return Err(format!("expected a JSON object, got {}", kind_of(&v)));
    }
    match json_repair::repair_json_string(t) {
        Ok(v) if v.is_object() => Ok(v),
        Ok(v) => Err(format!("repaired value is {}, not an object", kind_of(&v))),
        Err(e) => Err(format!("unrepairable JSON: {e}")),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Ask the model for one structured JSON object, retrying bounded times.
///
/// Missing credentials fail immediately — that state is not transient and
/// retrying would only mask a deployment problem. Every other failure mode
/// (transport, HTTP, empty content, unparsable content, timeout) consumes
/// one attempt; after `max_retries + 1` attempts the last error is
/// surfaced.
pub async fn invoke_structured(
    client: &Client,
    configured_key: &str,
    model: &str,
    system: &str,
    user: &str,
    opts: &InvokeOptions,
) -> Result<StructuredAnswer, PromptError> {
    let Some(key) = resolve_api_key(configured_key) else {
        return Err(PromptError::NoApiKey);
    };

    let mut last_err = String::from("no attempts made");

    for attempt in 0..=opts.max_retries {
        let res = time::timeout(
            Duration::from_millis(opts.timeout_ms),
            call_chat_json(
                client,
                &key,
                model,
                system,
                user,
                opts.temperature,
                opts.max_tokens,
            ),
        )
        .await;

        match res {
            Err(_) => {
                last_err = format!("timeout after {}ms", opts.timeout_ms);
                warn!(attempt = attempt + 1, "chat call timed out");
            }
            Ok(Err(e)) => {
                last_err = e.to_string();
                warn!(attempt = attempt + 1, "chat call failed: {last_err}");
            }
            Ok(Ok(outcome)) => match outcome.text {
                None => {
                    warn!(
                        attempt = attempt + 1,
                        finish_reason = outcome.finish_reason.as_deref().unwrap_or("-"),
                        content_shape = outcome.content_shape,
                        content_len = outcome.content_len,
                        prompt_tokens = outcome.usage.prompt_tokens,
                        completion_tokens = outcome.usage.completion_tokens,
                        "no extractable text in completion"
                    );
                    last_err = format!(
                        "no text content (finish_reason={})",
                        outcome.finish_reason.as_deref().unwrap_or("-")
                    );
                }
                Some(text) => match parse_structured(&text) {
                    Ok(value) => {
                        return Ok(StructuredAnswer {
                            value,
                            usage: TokenUsage::normalized(&outcome.usage),
                            raw: text,
                        });
                    }
                    Err(parse_msg) => {
                        let truncated = outcome.finish_reason.as_deref() == Some("length");
                        let preview: String = text.chars().take(200).collect();
                        warn!(
                            attempt = attempt + 1,
                            truncated,
                            preview = %preview,
                            "unparsable structured response: {parse_msg}"
                        );
                        last_err = if truncated {
                            format!("truncated response: {parse_msg}")
                        } else {
                            format!("invalid response: {parse_msg}")
                        };
                    }
                },
            },
        }

        let wait = 100 * (1u64 << attempt).min(8);
        time::sleep(Duration::from_millis(wait)).await;
    }

    Err(PromptError::Exhausted(last_err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_normalization_recomputes_missing_total() {
        let u = TokenUsage::normalized(&UsageCounters {
            prompt_tokens: 120,
            completion_tokens: 340,
            total_tokens: 0,
        });
        assert_eq!(u.total_tokens, 460);

        let u = TokenUsage::normalized(&UsageCounters {
            prompt_tokens: -5,
            completion_tokens: 10,
            total_tokens: 99,
        });
        assert_eq!(u.prompt_tokens, 0);
        assert_eq!(u.completion_tokens, 10);
        assert_eq!(u.total_tokens, 99);
    }

    #[test]
    fn parse_accepts_fenced_objects() {
        let v = parse_structured("```json\n{\"title\": \"x\"}\n```").unwrap();
        assert_eq!(v["title"], "x");
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert!(parse_structured("0.75").is_err());
        assert!(parse_structured("[1, 2]").is_err());
    }

    #[test]
    fn parts_content_is_joined() {
        let c = MessageContent::Parts(vec![
            ContentPart {
                text: Some("{\"a\":".into()),
            },
            ContentPart { text: Some("1}".into()) },
        ]);
        assert_eq!(c.into_text().unwrap(), "{\"a\":1}");
    }
}
