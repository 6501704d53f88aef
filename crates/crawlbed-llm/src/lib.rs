mod parse;

pub use parse::{
    GeneratedFile, GeneratedFileSet, ParseFailure, choose_entry_page, normalize_file_path,
    parse_files,
};

use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub requirements: Option<String>,
    pub site_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub extra_requirements: Option<String>,
}

impl CompletionRequest {
    pub fn for_generation(system_prompt: impl Into<String>, req: &GenerationRequest) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: build_user_prompt(req),
            extra_requirements: req.requirements.clone(),
        }
    }

    /// The user message as sent to the model, with extra requirements appended.
    pub fn user_message(&self) -> String {
        match self
            .extra_requirements
            .as_deref()
            .map(str::trim)
            .filter(|extra| !extra.is_empty())
        {
            Some(extra) => format!("{}\n\nAdditional Requirements: {extra}", self.user_prompt),
            None => self.user_prompt.clone(),
        }
    }
}

const OUTPUT_INSTRUCTIONS: &str = "Generate a complete, functional website for this request. Include:
1. HTML pages (at minimum index.html, plus any other pages that make sense)
2. a CSS file for styling
3. a JavaScript file for behaviour
4. data files (JSON) and robots.txt when they fit the site

Output every file in its own fenced code block and put the relative file path in the
fence info string, for example:

```html index.html
<!DOCTYPE html>
...
```

Use relative links only. Make the website realistic and functional for testing purposes.";

pub fn build_user_prompt(req: &GenerationRequest) -> String {
    let mut prompt = format!("User Request: {}", req.prompt.trim());
    if let Some(site_type) = req
        .site_type
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        prompt.push_str(&format!("\nWebsite Type: {site_type}"));
    }
    prompt.push_str("\n\n");
    prompt.push_str(OUTPUT_INSTRUCTIONS);
    prompt
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("OPENAI_API_KEY is required for the OpenAI-compatible endpoint")]
    MissingApiKey,
    #[error("failed calling OpenAI-compatible endpoint {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
    #[error("OpenAI-compatible endpoint rejected the credentials ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("OpenAI-compatible endpoint is rate limiting requests{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("OpenAI-compatible request failed ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode OpenAI-compatible response: {0}")]
    Decode(String),
    #[error("OpenAI-compatible response had no content")]
    EmptyResponse,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|wait| format!(" (retry after {}s)", wait.as_secs()))
        .unwrap_or_default()
}

pub trait LlmClient {
    fn complete(&self, req: &CompletionRequest, model: &str) -> Result<String, LlmError>;
}

impl<C: LlmClient + ?Sized> LlmClient for &C {
    fn complete(&self, req: &CompletionRequest, model: &str) -> Result<String, LlmError> {
        (**self).complete(req, model)
    }
}

/// Retries a rate-limited completion exactly once; every other error is returned as-is.
#[derive(Debug)]
pub struct RetryingClient<C> {
    pub inner: C,
    pub default_backoff: Duration,
    pub max_backoff: Duration,
}

impl<C> RetryingClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            default_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl<C: LlmClient> LlmClient for RetryingClient<C> {
    fn complete(&self, req: &CompletionRequest, model: &str) -> Result<String, LlmError> {
        match self.inner.complete(req, model) {
            Err(LlmError::RateLimited { retry_after }) => {
                let wait = retry_after
                    .unwrap_or(self.default_backoff)
                    .min(self.max_backoff);
                warn!("rate limited by provider, retrying once in {}ms", wait.as_millis());
                thread::sleep(wait);
                self.inner.complete(req, model)
            }
            other => other,
        }
    }
}
