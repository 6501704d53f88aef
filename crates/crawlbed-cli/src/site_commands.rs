use super::runtime_context::{build_client, build_manager, build_store};
use anyhow::{Context, Result, anyhow};
use crawlbed_config::Settings;
use crawlbed_core::{GenerateOptions, generate_site};
use crawlbed_llm::GenerationRequest;
use crawlbed_serve::{StaticServerConfig, start_static_server};
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Debug, Default)]
pub(crate) struct GenerateArgs {
    pub prompt: Option<String>,
    pub site_type: Option<String>,
    pub requirements: Option<String>,
    pub name: Option<String>,
    pub port: Option<u16>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn generation_request(args: &GenerateArgs) -> Result<GenerationRequest> {
    let site_type = non_empty(args.site_type.clone());
    let prompt = match (non_empty(args.prompt.clone()), site_type.as_deref()) {
        (Some(prompt), _) => prompt,
        (None, Some(kind)) => format!("a realistic {kind} website"),
        (None, None) => return Err(anyhow!("a PROMPT or --type is required")),
    };
    Ok(GenerationRequest {
        prompt,
        requirements: non_empty(args.requirements.clone()),
        site_type,
    })
}

pub(crate) fn generate_command(settings: &Settings, args: GenerateArgs) -> Result<()> {
    let req = generation_request(&args)?;
    let client = build_client(settings)?;
    let store = build_store(settings);
    let manager = build_manager(settings)?;

    let options = GenerateOptions {
        template: settings.template.clone(),
        fallback_to_builtin: settings.uses_default_template(),
        model: settings.openai_model.clone(),
        name_hint: args.name,
        port: args.port,
    };

    eprintln!("generating website with {} ...", options.model);
    let site = generate_site(&store, &client, &manager, &req, &options)?;

    println!("created environment {}", site.env.name);
    println!("  directory: {}", site.env.dir.display());
    println!(
        "  files: {} ({})",
        site.env.files.len(),
        site.env.files.join(", ")
    );
    println!("  url: {}", site.url);
    Ok(())
}

pub(crate) fn templates_command(settings: &Settings) -> Result<()> {
    let store = build_store(settings);
    let names = store.list()?;
    if names.is_empty() {
        println!(
            "no templates in {} (the built-in {} prompt is used)",
            store.dir().display(),
            crawlbed_config::DEFAULT_TEMPLATE
        );
        return Ok(());
    }

    for name in &names {
        let description = store
            .load(name)
            .ok()
            .and_then(|template| template.description)
            .unwrap_or_default();
        let marker = if *name == settings.template { "*" } else { " " };
        if description.is_empty() {
            println!("{marker} {name}");
        } else {
            println!("{marker} {name}  {description}");
        }
    }
    Ok(())
}

/// Foreground static server run by the lifecycle manager as a detached child.
pub(crate) fn serve_dir_command(dir: PathBuf, port: u16, host: String) -> Result<()> {
    let handle = start_static_server(&StaticServerConfig {
        host,
        port,
        root_dir: dir,
    })?;

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", handle.ready_line()).context("failed reporting readiness")?;
    stdout.flush().context("failed reporting readiness")?;
    drop(stdout);

    tracing::info!(url = %handle.url, "serving");
    handle.wait();
    Ok(())
}
