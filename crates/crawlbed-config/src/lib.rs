use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "crawlbed.json";
pub const DEFAULT_TEMPLATE: &str = "website_generator";

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub root_dir: Option<PathBuf>,
    pub prompts_dir: Option<PathBuf>,
    pub template: Option<String>,
    pub base_port: Option<u16>,
    pub port_scan_limit: Option<u16>,
    pub openai_base_url: Option<String>,
    pub openai_model: Option<String>,
    pub openai_api_key: Option<String>,
    pub timeout_secs: Option<u64>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvConfig {
    pub root_dir: Option<PathBuf>,
    pub prompts_dir: Option<PathBuf>,
    pub template: Option<String>,
    pub base_port: Option<u16>,
    pub openai_base_url: Option<String>,
    pub openai_model: Option<String>,
    pub openai_api_key: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    pub root_dir: Option<PathBuf>,
    pub template: Option<String>,
    pub model: Option<String>,
    pub verbose: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub root_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub template: String,
    pub base_port: u16,
    pub port_scan_limit: u16,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("test_environments"),
            prompts_dir: PathBuf::from("prompts"),
            template: DEFAULT_TEMPLATE.to_string(),
            base_port: 8000,
            port_scan_limit: 1000,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4.1-mini".to_string(),
            openai_api_key: None,
            timeout_secs: 120,
            temperature: 0.7,
            max_tokens: Some(4000),
            verbose: false,
        }
    }
}

impl Settings {
    pub fn uses_default_template(&self) -> bool {
        self.template == DEFAULT_TEMPLATE
    }
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("crawlbed").join("config.json"))
}

pub fn load_file_config(explicit_path: Option<&Path>, cwd: &Path) -> Result<Option<FileConfig>> {
    let path = match explicit_path {
        Some(p) => p.to_path_buf(),
        None => {
            let local = cwd.join(CONFIG_FILE_NAME);
            if local.exists() {
                local
            } else {
                match user_config_path().filter(|p| p.exists()) {
                    Some(user) => user,
                    None => return Ok(None),
                }
            }
        }
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed reading config file {}", path.display()))?;
    let parsed: FileConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing config file {}", path.display()))?;
    Ok(Some(parsed))
}

impl EnvConfig {
    pub fn from_current_env() -> Self {
        Self {
            root_dir: non_empty_var("CRAWLBED_ROOT").map(PathBuf::from),
            prompts_dir: non_empty_var("CRAWLBED_PROMPTS_DIR").map(PathBuf::from),
            template: non_empty_var("CRAWLBED_TEMPLATE"),
            base_port: non_empty_var("CRAWLBED_BASE_PORT").and_then(|v| v.trim().parse().ok()),
            openai_base_url: non_empty_var("OPENAI_BASE_URL"),
            openai_model: non_empty_var("CRAWLBED_MODEL"),
            openai_api_key: non_empty_var("OPENAI_API_KEY"),
            timeout_secs: non_empty_var("CRAWLBED_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok()),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn resolve_settings(
    cli: &CliOverrides,
    env_cfg: &EnvConfig,
    file_cfg: Option<&FileConfig>,
) -> Settings {
    let base = Settings::default();

    let root_dir = cli
        .root_dir
        .clone()
        .or_else(|| env_cfg.root_dir.clone())
        .or_else(|| file_cfg.and_then(|c| c.root_dir.clone()))
        .unwrap_or(base.root_dir);

    let prompts_dir = env_cfg
        .prompts_dir
        .clone()
        .or_else(|| file_cfg.and_then(|c| c.prompts_dir.clone()))
        .unwrap_or(base.prompts_dir);

    let template = cli
        .template
        .clone()
        .or_else(|| env_cfg.template.clone())
        .or_else(|| file_cfg.and_then(|c| c.template.clone()))
        .unwrap_or(base.template);

    let base_port = env_cfg
        .base_port
        .or(file_cfg.and_then(|c| c.base_port))
        .unwrap_or(base.base_port);

    let port_scan_limit = file_cfg
        .and_then(|c| c.port_scan_limit)
        .filter(|limit| *limit > 0)
        .unwrap_or(base.port_scan_limit);

    let openai_base_url = env_cfg
        .openai_base_url
        .clone()
        .or_else(|| file_cfg.and_then(|c| c.openai_base_url.clone()))
        .unwrap_or(base.openai_base_url);

    let openai_model = cli
        .model
        .clone()
        .or_else(|| env_cfg.openai_model.clone())
        .or_else(|| file_cfg.and_then(|c| c.openai_model.clone()))
        .unwrap_or(base.openai_model);

    let openai_api_key = env_cfg
        .openai_api_key
        .clone()
        .or_else(|| file_cfg.and_then(|c| c.openai_api_key.clone()));

    let timeout_secs = env_cfg
        .timeout_secs
        .or(file_cfg.and_then(|c| c.timeout_secs))
        .unwrap_or(base.timeout_secs);

    let temperature = file_cfg
        .and_then(|c| c.temperature)
        .unwrap_or(base.temperature);

    let max_tokens = file_cfg.and_then(|c| c.max_tokens).or(base.max_tokens);

    let verbose = cli.verbose.unwrap_or(base.verbose);

    Settings {
        root_dir,
        prompts_dir,
        template,
        base_port,
        port_scan_limit,
        openai_base_url,
        openai_model,
        openai_api_key,
        timeout_secs,
        temperature,
        max_tokens,
        verbose,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CliOverrides, EnvConfig, FileConfig, Settings, load_file_config, resolve_settings,
    };
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn valid_config_parses() {
        let dir = tempdir().expect("tempdir should work");
        let path = dir.path().join("crawlbed.json");
        fs::write(&path, r#"{"base_port":9100,"openai_model":"local-model"}"#)
            .expect("write should work");

        let parsed = load_file_config(None, dir.path())
            .expect("parse should work")
            .expect("file should exist");
        assert_eq!(parsed.base_port, Some(9100));
        assert_eq!(parsed.openai_model.as_deref(), Some("local-model"));
    }

    #[test]
    fn explicit_path_wins_over_working_directory() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(dir.path().join("crawlbed.json"), r#"{"base_port":1}"#)
            .expect("write should work");
        let explicit = dir.path().join("other.json");
        fs::write(&explicit, r#"{"base_port":2}"#).expect("write should work");

        let parsed = load_file_config(Some(&explicit), dir.path())
            .expect("parse should work")
            .expect("file should exist");
        assert_eq!(parsed.base_port, Some(2));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempdir().expect("tempdir should work");
        let path = dir.path().join("crawlbed.json");
        fs::write(&path, r#"{"unknown":1}"#).expect("write should work");

        let err = load_file_config(None, dir.path()).expect_err("parse should fail");
        assert!(format!("{err:#}").contains("unknown field"));
    }

    #[test]
    fn malformed_json_has_location() {
        let dir = tempdir().expect("tempdir should work");
        let path = dir.path().join("crawlbed.json");
        fs::write(&path, "{\n  \"base_port\":\n").expect("write should work");

        let err = load_file_config(None, dir.path()).expect_err("parse should fail");
        assert!(
            format!("{err:#}").contains("line") || format!("{err:#}").contains("column"),
            "expected location details, got: {err}"
        );
    }

    #[test]
    fn defaults_apply_without_any_source() {
        let resolved = resolve_settings(&CliOverrides::default(), &EnvConfig::default(), None);
        assert_eq!(resolved, Settings::default());
        assert_eq!(resolved.base_port, 8000);
        assert_eq!(resolved.root_dir, PathBuf::from("test_environments"));
        assert!(resolved.uses_default_template());
    }

    #[test]
    fn precedence_cli_env_file_defaults() {
        let file = FileConfig {
            root_dir: Some(PathBuf::from("from-file")),
            openai_model: Some("file-model".to_string()),
            base_port: Some(9000),
            openai_api_key: Some("file-key".to_string()),
            ..FileConfig::default()
        };

        let env_cfg = EnvConfig {
            root_dir: Some(PathBuf::from("from-env")),
            openai_model: Some("env-model".to_string()),
            openai_api_key: Some("env-key".to_string()),
            ..EnvConfig::default()
        };

        let cli = CliOverrides {
            model: Some("cli-model".to_string()),
            verbose: Some(true),
            ..CliOverrides::default()
        };

        let resolved = resolve_settings(&cli, &env_cfg, Some(&file));
        assert_eq!(resolved.root_dir, PathBuf::from("from-env"));
        assert_eq!(resolved.openai_model, "cli-model");
        assert_eq!(resolved.base_port, 9000);
        assert_eq!(resolved.openai_api_key.as_deref(), Some("env-key"));
        assert!(resolved.verbose);
    }

    #[test]
    fn zero_scan_limit_falls_back_to_default() {
        let file = FileConfig {
            port_scan_limit: Some(0),
            ..FileConfig::default()
        };
        let resolved =
            resolve_settings(&CliOverrides::default(), &EnvConfig::default(), Some(&file));
        assert_eq!(resolved.port_scan_limit, 1000);
    }
}
