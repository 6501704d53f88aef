use crawlbed_env::{EnvError, EnvSource, Environment, EnvironmentManager};
use crawlbed_llm::{
    CompletionRequest, GeneratedFileSet, GenerationRequest, LlmClient, LlmError, ParseFailure,
    parse_files,
};
use crawlbed_prompts::{PromptError, PromptStore, PromptTemplate};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Parse(#[from] ParseFailure),
    #[error(transparent)]
    Env(#[from] EnvError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    pub template: String,
    /// Use the built-in prompt when `template` is absent from the store.
    pub fallback_to_builtin: bool,
    pub model: String,
    pub name_hint: Option<String>,
    pub port: Option<u16>,
}

/// Files produced by the model, before anything touches the environments root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSite {
    pub files: GeneratedFileSet,
    pub source: EnvSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSite {
    pub env: Environment,
    pub url: String,
    pub entry_page: String,
}

pub fn resolve_template(
    store: &PromptStore,
    options: &GenerateOptions,
) -> Result<PromptTemplate, PromptError> {
    match store.load(&options.template) {
        Err(PromptError::NotFound { .. }) if options.fallback_to_builtin => {
            debug!(
                template = %options.template,
                "template not found, using built-in prompt"
            );
            Ok(PromptTemplate::builtin(&options.template))
        }
        other => other,
    }
}

pub fn prepare_site<L>(
    store: &PromptStore,
    llm: &L,
    req: &GenerationRequest,
    options: &GenerateOptions,
) -> Result<PreparedSite, GenerateError>
where
    L: LlmClient + ?Sized,
{
    let template = resolve_template(store, options)?;

    let mut overrides = BTreeMap::new();
    if let Some(site_type) = req.site_type.as_deref() {
        overrides.insert("site_type".to_string(), site_type.to_string());
    }
    let system_prompt = template.render(&overrides);

    info!(template = %template.name, model = %options.model, "requesting site from model");
    let raw = llm.complete(
        &CompletionRequest::for_generation(system_prompt, req),
        &options.model,
    )?;
    debug!(bytes = raw.len(), "model response received");

    let files = parse_files(&raw)?;
    info!(files = files.len(), "parsed generated files");

    Ok(PreparedSite {
        files,
        source: EnvSource {
            prompt: req.prompt.clone(),
            requirements: req.requirements.clone(),
            site_type: req.site_type.clone(),
            template: Some(template.name),
            model: Some(options.model.clone()),
        },
    })
}

/// Template, model, parse, create, start. A failed start removes the new environment.
pub fn generate_site<L>(
    store: &PromptStore,
    llm: &L,
    manager: &EnvironmentManager,
    req: &GenerationRequest,
    options: &GenerateOptions,
) -> Result<GeneratedSite, GenerateError>
where
    L: LlmClient + ?Sized,
{
    let prepared = prepare_site(store, llm, req, options)?;
    let entry_page = prepared
        .files
        .entry_page()
        .unwrap_or("index.html")
        .to_string();

    let hint = options
        .name_hint
        .as_deref()
        .or(req.site_type.as_deref())
        .unwrap_or(&req.prompt);
    let env = manager.create(hint, &prepared.files, Some(prepared.source))?;

    let env = match manager.start_server(&env.name, options.port) {
        Ok(env) => env,
        Err(err) => {
            if let Err(cleanup) = manager.remove(&env.name) {
                warn!(env = %env.name, "failed removing environment after start failure: {cleanup}");
            }
            return Err(err.into());
        }
    };

    let url = site_url(&env, &entry_page).unwrap_or_default();
    Ok(GeneratedSite {
        env,
        url,
        entry_page,
    })
}

pub fn site_url(env: &Environment, entry_page: &str) -> Option<String> {
    let base = env.url()?;
    if entry_page == "index.html" {
        Some(base)
    } else {
        Some(format!("{base}{entry_page}"))
    }
}
