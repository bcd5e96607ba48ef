//! External reply generation. The assistant and the suggestion endpoint only
//! see [`ReplyProvider`]; the Gemini client is one implementation of it.

use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Posted when generation fails or times out.
pub const REPLY_FALLBACK: &str =
    "Sorry, I ran into a technical problem and can't answer right now.";
/// Posted when no provider key is configured.
pub const NOT_CONFIGURED_REPLY: &str = "The AI assistant is not configured.";
/// Returned by the suggestion endpoint when generation fails.
pub const SUGGESTION_FALLBACK: &str = "No suggestion is available right now.";

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One line of conversation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub speaker: String,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider is not configured")]
    NotConfigured,

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider returned no text")]
    Empty,
}

/// Object-safe reply generator.
pub trait ReplyProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Answer `latest` given the preceding `history`, oldest first.
    fn reply<'a>(
        &'a self,
        history: &'a [ChatLine],
        latest: &'a str,
    ) -> BoxFuture<'a, Result<String, ProviderError>>;

    /// Suggest what the reader could say next.
    fn suggest<'a>(&'a self, history: &'a [ChatLine]) -> BoxFuture<'a, Result<String, ProviderError>>;
}

/// Stand-in used when no API key is set.
pub struct UnconfiguredProvider;

impl ReplyProvider for UnconfiguredProvider {
    fn name(&self) -> &str {
        "unconfigured"
    }

    fn reply<'a>(&'a self, _: &'a [ChatLine], _: &'a str) -> BoxFuture<'a, Result<String, ProviderError>> {
        async { Err(ProviderError::NotConfigured) }.boxed()
    }

    fn suggest<'a>(&'a self, _: &'a [ChatLine]) -> BoxFuture<'a, Result<String, ProviderError>> {
        async { Err(ProviderError::NotConfigured) }.boxed()
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Google Gemini `generateContent` over HTTPS.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect();
        let text = text.trim();
        if text.is_empty() {
            return Err(ProviderError::Empty);
        }
        debug!("{} produced {} chars", self.model, text.len());
        Ok(text.to_string())
    }
}

fn transcript(history: &[ChatLine]) -> String {
    history
        .iter()
        .map(|line| format!("{}: {}", line.speaker, line.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn reply_prompt(history: &[ChatLine], latest: &str) -> String {
    format!(
        "You are a helpful AI assistant inside a chat application.\n\
         Answer the user naturally, helpfully and in a friendly tone.\n\n\
         Conversation so far:\n{}\n\n\
         Latest message from the user: \"{}\"\n\n\
         Reply directly to the user.",
        transcript(history),
        latest
    )
}

pub fn suggestion_prompt(history: &[ChatLine]) -> String {
    format!(
        "Below is a chat conversation.\n\
         Suggest one short, polite and relevant reply the reader could send next.\n\n\
         Conversation:\n{}\n\n\
         Return only the reply text, with no preamble.",
        transcript(history)
    )
}

impl ReplyProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn reply<'a>(
        &'a self,
        history: &'a [ChatLine],
        latest: &'a str,
    ) -> BoxFuture<'a, Result<String, ProviderError>> {
        async move { self.generate(&reply_prompt(history, latest)).await }.boxed()
    }

    fn suggest<'a>(&'a self, history: &'a [ChatLine]) -> BoxFuture<'a, Result<String, ProviderError>> {
        async move { self.generate(&suggestion_prompt(history)).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_history_in_order() {
        let history = vec![
            ChatLine { speaker: "Alice".into(), content: "hi".into() },
            ChatLine { speaker: "Bob".into(), content: "hello".into() },
        ];
        let prompt = reply_prompt(&history, "what's up?");
        let alice = prompt.find("Alice: hi").unwrap();
        let bob = prompt.find("Bob: hello").unwrap();
        assert!(alice < bob);
        assert!(prompt.contains("\"what's up?\""));
    }

    #[test]
    fn response_text_is_joined_from_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn unconfigured_provider_reports_it() {
        let provider = UnconfiguredProvider;
        assert!(matches!(provider.reply(&[], "hi").await, Err(ProviderError::NotConfigured)));
    }
}
