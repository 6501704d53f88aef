use crawlbed_core::GenerateError;
use crawlbed_env::EnvError;
use crawlbed_llm::{LlmError, ParseFailure};
use crawlbed_prompts::PromptError;
use std::error::Error as StdError;

fn find<'a, T: StdError + 'static>(err: &'a anyhow::Error) -> Option<&'a T> {
    err.chain().find_map(|cause| cause.downcast_ref::<T>())
}

fn llm_hint(err: &LlmError) -> Option<&'static str> {
    match err {
        LlmError::MissingApiKey => Some(
            "set OPENAI_API_KEY in the environment or a .env file, or openai_api_key in crawlbed.json",
        ),
        LlmError::Auth { .. } => Some("check that OPENAI_API_KEY is valid for OPENAI_BASE_URL"),
        LlmError::RateLimited { .. } => {
            Some("the provider is throttling requests; wait a moment and try again")
        }
        LlmError::Transport { .. } => Some(
            "check network access to OPENAI_BASE_URL, or raise CRAWLBED_TIMEOUT_SECS for slow models",
        ),
        _ => None,
    }
}

fn env_hint(err: &EnvError) -> Option<&'static str> {
    match err {
        EnvError::NotFound { .. } => Some("run `crawlbed list` to see existing environments"),
        err if err.is_port_problem() => Some(
            "pick another starting port with --port, or free ports with `crawlbed stop`",
        ),
        _ => None,
    }
}

/// One line of guidance for errors a user can act on.
pub(crate) fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(generate) = find::<GenerateError>(err) {
        return match generate {
            GenerateError::Llm(llm) => llm_hint(llm),
            GenerateError::Env(env) => env_hint(env),
            GenerateError::Prompt(PromptError::NotFound { .. }) => {
                Some("run `crawlbed templates` to see available templates")
            }
            GenerateError::Parse(ParseFailure::NoFilesFound) => Some(
                "the model answered without code blocks; try again or use a stricter template",
            ),
            _ => None,
        };
    }
    if let Some(llm) = find::<LlmError>(err) {
        return llm_hint(llm);
    }
    if let Some(env) = find::<EnvError>(err) {
        return env_hint(env);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::hint_for;
    use anyhow::Context;
    use crawlbed_core::GenerateError;
    use crawlbed_env::EnvError;
    use crawlbed_llm::LlmError;

    #[test]
    fn hints_survive_context_layers() {
        let err = Err::<(), _>(LlmError::MissingApiKey)
            .context("generate failed")
            .expect_err("must fail");
        assert!(hint_for(&err).is_some_and(|hint| hint.contains("OPENAI_API_KEY")));
    }

    #[test]
    fn port_problems_get_port_hint() {
        let err = anyhow::Error::new(GenerateError::Env(EnvError::NoFreePort {
            first: 8000,
            last: 8999,
        }));
        assert!(hint_for(&err).is_some_and(|hint| hint.contains("--port")));
    }

    #[test]
    fn plain_errors_have_no_hint() {
        assert_eq!(hint_for(&anyhow::anyhow!("boom")), None);
    }
}
