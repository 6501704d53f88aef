use crawlbed_core::{GenerateError, GenerateOptions, generate_site, prepare_site};
use crawlbed_env::{EnvError, EnvironmentManager, ManagerConfig};
use crawlbed_llm::{CompletionRequest, GenerationRequest, LlmClient, LlmError, ParseFailure};
use crawlbed_prompts::{PromptError, PromptStore, builtin_system_prompt};
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const SITE_RESPONSE: &str = "Here you go.\n\n```html index.html\n<!DOCTYPE html>\n<title>Books</title>\n```\n\n```css style.css\nbody { margin: 0; }\n```\n";

struct StubClient {
    reply: Result<String, ()>,
    seen: RefCell<Vec<(CompletionRequest, String)>>,
}

impl StubClient {
    fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            seen: RefCell::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            reply: Err(()),
            seen: RefCell::new(Vec::new()),
        }
    }
}

impl LlmClient for StubClient {
    fn complete(&self, req: &CompletionRequest, model: &str) -> Result<String, LlmError> {
        self.seen
            .borrow_mut()
            .push((req.clone(), model.to_string()));
        match &self.reply {
            Ok(text) => Ok(text.clone()),
            Err(()) => Err(LlmError::Auth {
                status: 401,
                body: "invalid key".to_string(),
            }),
        }
    }
}

fn request() -> GenerationRequest {
    GenerationRequest {
        prompt: "simple bookstore landing page".to_string(),
        requirements: Some("include a search form".to_string()),
        site_type: Some("bookstore".to_string()),
    }
}

fn options(template: &str, fallback: bool) -> GenerateOptions {
    GenerateOptions {
        template: template.to_string(),
        fallback_to_builtin: fallback,
        model: "test-model".to_string(),
        name_hint: None,
        port: None,
    }
}

fn broken_manager(root: &Path) -> EnvironmentManager {
    EnvironmentManager::new(ManagerConfig::new(
        root.join("test_environments"),
        root.join("missing-server-binary"),
    ))
}

#[test]
fn missing_default_template_falls_back_to_builtin_prompt() {
    let dir = tempdir().expect("tempdir should work");
    let store = PromptStore::new(dir.path().join("prompts"));
    let llm = StubClient::replying(SITE_RESPONSE);

    let prepared = prepare_site(&store, &llm, &request(), &options("website_generator", true))
        .expect("prepare should work");

    assert_eq!(prepared.files.paths(), vec!["index.html", "style.css"]);
    assert_eq!(prepared.source.template.as_deref(), Some("website_generator"));
    assert_eq!(prepared.source.model.as_deref(), Some("test-model"));

    let seen = llm.seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.system_prompt, builtin_system_prompt());
    assert_eq!(seen[0].1, "test-model");
    assert!(
        seen[0]
            .0
            .user_message()
            .ends_with("Additional Requirements: include a search form")
    );
}

#[test]
fn store_template_is_rendered_with_site_type() {
    let dir = tempdir().expect("tempdir should work");
    fs::write(
        dir.path().join("shop.json"),
        r#"{"system_prompt":"Build a {site_type} site in a {tone} tone.","variables":{"tone":"friendly"}}"#,
    )
    .expect("write should work");
    let store = PromptStore::new(dir.path());
    let llm = StubClient::replying(SITE_RESPONSE);

    prepare_site(&store, &llm, &request(), &options("shop", false)).expect("prepare should work");

    assert_eq!(
        llm.seen.borrow()[0].0.system_prompt,
        "Build a bookstore site in a friendly tone."
    );
}

#[test]
fn explicit_missing_template_fails_before_calling_the_model() {
    let dir = tempdir().expect("tempdir should work");
    let store = PromptStore::new(dir.path());
    let llm = StubClient::replying(SITE_RESPONSE);

    let err = prepare_site(&store, &llm, &request(), &options("nope", false))
        .expect_err("must fail");
    assert!(matches!(
        err,
        GenerateError::Prompt(PromptError::NotFound { .. })
    ));
    assert!(llm.seen.borrow().is_empty());
}

#[test]
fn model_and_parse_failures_create_nothing() {
    let dir = tempdir().expect("tempdir should work");
    let store = PromptStore::new(dir.path().join("prompts"));
    let manager = broken_manager(dir.path());

    let err = generate_site(
        &store,
        &StubClient::failing(),
        &manager,
        &request(),
        &options("website_generator", true),
    )
    .expect_err("must fail");
    assert!(matches!(err, GenerateError::Llm(LlmError::Auth { .. })));

    let err = generate_site(
        &store,
        &StubClient::replying("Sorry, I can only describe the site in words."),
        &manager,
        &request(),
        &options("website_generator", true),
    )
    .expect_err("must fail");
    assert!(matches!(
        err,
        GenerateError::Parse(ParseFailure::NoFilesFound)
    ));

    assert!(manager.list().expect("list should work").is_empty());
}

#[test]
fn failed_server_start_removes_the_new_environment() {
    let dir = tempdir().expect("tempdir should work");
    let store = PromptStore::new(dir.path().join("prompts"));
    let manager = broken_manager(dir.path());

    let err = generate_site(
        &store,
        &StubClient::replying(SITE_RESPONSE),
        &manager,
        &request(),
        &options("website_generator", true),
    )
    .expect_err("must fail");

    assert!(matches!(err, GenerateError::Env(EnvError::Io { .. })), "{err}");
    assert!(manager.list().expect("list should work").is_empty());
    let leftovers = fs::read_dir(dir.path().join("test_environments"))
        .expect("root should exist")
        .count();
    assert_eq!(leftovers, 0);
}
