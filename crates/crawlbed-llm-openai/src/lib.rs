use crawlbed_llm::{CompletionRequest, LlmClient, LlmError};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for OpenAiCompatibleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, LlmError> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;
        Ok(Self {
            base_url: base_url.into(),
            api_key,
            timeout: Duration::from_secs(120),
            temperature: 0.7,
            max_tokens: Some(4000),
        })
    }

    pub fn from_env() -> Result<Self, LlmError> {
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(base_url, std::env::var("OPENAI_API_KEY").ok())
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient for OpenAiCompatibleClient {
    fn complete(&self, req: &CompletionRequest, model: &str) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: model.to_string(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: req.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: req.user_message(),
                },
            ],
        };

        let endpoint = self.endpoint();
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| LlmError::Transport {
                endpoint: endpoint.clone(),
                message: format!("failed to build HTTP client: {err}"),
            })?;

        debug!(%endpoint, model, "requesting chat completion");
        let response = client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|err| LlmError::Transport {
                endpoint: endpoint.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(status, response));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|err| LlmError::Decode(err.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

fn error_for_status(status: StatusCode, response: Response) -> LlmError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        return LlmError::RateLimited { retry_after };
    }

    let body = response
        .text()
        .unwrap_or_else(|_| "<unavailable>".to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth {
            status: status.as_u16(),
            body,
        },
        _ => LlmError::Api {
            status: status.as_u16(),
            body,
        },
    }
}

/// Only the delta-seconds form of `Retry-After` is honoured.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
