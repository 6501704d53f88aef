use anyhow::{Context, Result};
use crawlbed_config::{CliOverrides, EnvConfig, Settings, load_file_config, resolve_settings};
use crawlbed_env::{EnvironmentManager, ManagerConfig};
use crawlbed_llm::RetryingClient;
use crawlbed_llm_openai::OpenAiCompatibleClient;
use crawlbed_prompts::PromptStore;
use std::path::PathBuf;
use std::time::Duration;

pub(crate) const SERVER_HOST: &str = "127.0.0.1";
const SERVER_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type SiteClient = RetryingClient<OpenAiCompatibleClient>;

pub(crate) fn resolve_config(
    config: Option<PathBuf>,
    cli_overrides: &CliOverrides,
) -> Result<Settings> {
    let cwd = std::env::current_dir().context("failed getting current directory")?;
    let file_cfg = load_file_config(config.as_deref(), &cwd)?;
    let env_cfg = EnvConfig::from_current_env();
    Ok(resolve_settings(cli_overrides, &env_cfg, file_cfg.as_ref()))
}

pub(crate) fn build_manager(settings: &Settings) -> Result<EnvironmentManager> {
    let server_program =
        std::env::current_exe().context("failed locating the crawlbed executable")?;
    let root = std::path::absolute(&settings.root_dir).with_context(|| {
        format!("failed resolving environments root {}", settings.root_dir.display())
    })?;
    let mut config = ManagerConfig::new(root, server_program);
    config.base_port = settings.base_port;
    config.port_scan_limit = settings.port_scan_limit;
    config.host = SERVER_HOST.to_string();
    config.startup_timeout = SERVER_STARTUP_TIMEOUT;
    Ok(EnvironmentManager::new(config))
}

pub(crate) fn build_store(settings: &Settings) -> PromptStore {
    PromptStore::new(settings.prompts_dir.clone())
}

pub(crate) fn build_client(settings: &Settings) -> Result<SiteClient> {
    let mut client = OpenAiCompatibleClient::new(
        settings.openai_base_url.clone(),
        settings.openai_api_key.clone(),
    )?;
    client.timeout = Duration::from_secs(settings.timeout_secs);
    client.temperature = settings.temperature;
    client.max_tokens = settings.max_tokens;
    Ok(RetryingClient::new(client))
}

#[cfg(test)]
mod tests {
    use super::build_client;
    use crawlbed_config::Settings;
    use crawlbed_llm::LlmError;
    use std::time::Duration;

    #[test]
    fn client_requires_api_key() {
        let err = build_client(&Settings::default()).expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<LlmError>(),
            Some(LlmError::MissingApiKey)
        ));
    }

    #[test]
    fn client_carries_settings() {
        let settings = Settings {
            openai_api_key: Some("k".to_string()),
            openai_base_url: "http://localhost:1234/v1".to_string(),
            timeout_secs: 9,
            max_tokens: None,
            ..Settings::default()
        };
        let client = build_client(&settings).expect("client should build");
        assert_eq!(client.inner.base_url, "http://localhost:1234/v1");
        assert_eq!(client.inner.timeout, Duration::from_secs(9));
        assert_eq!(client.inner.max_tokens, None);
    }
}
