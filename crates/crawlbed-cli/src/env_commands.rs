use super::runtime_context::build_manager;
use anyhow::{Result, anyhow};
use crawlbed_config::Settings;
use crawlbed_core::site_url;
use crawlbed_env::{BulkReport, Environment};

fn format_table(envs: &[Environment]) -> String {
    let headers = ["NAME", "STATUS", "PORT", "CREATED"];
    let rows: Vec<[String; 4]> = envs
        .iter()
        .map(|env| {
            [
                env.name.clone(),
                env.status.to_string(),
                env.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                env.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let render = |cells: [&str; 4]| {
        let mut line = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i + 1 == cells.len() {
                line.push_str(cell);
            } else {
                line.push_str(&format!("{cell:<width$}  ", width = widths[i]));
            }
        }
        line
    };

    let mut out = render(headers);
    for row in &rows {
        out.push('\n');
        out.push_str(&render([&row[0], &row[1], &row[2], &row[3]]));
    }
    out
}

pub(crate) fn list_command(settings: &Settings) -> Result<()> {
    let manager = build_manager(settings)?;
    let envs = manager.list()?;
    if envs.is_empty() {
        println!("no environments in {}", manager.root().display());
        return Ok(());
    }
    println!("{}", format_table(&envs));
    Ok(())
}

pub(crate) fn info_command(settings: &Settings, name: &str) -> Result<()> {
    let env = build_manager(settings)?.get(name)?;

    println!("name:      {}", env.name);
    println!("status:    {}", env.status);
    println!("directory: {}", env.dir.display());
    println!(
        "created:   {}",
        env.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(url) = site_url(&env, env.entry_page()) {
        println!("url:       {url}");
    }
    if let Some(pid) = env.pid {
        println!("pid:       {pid}");
    }
    if let Some(source) = &env.source {
        println!("prompt:    {}", source.prompt);
        if let Some(site_type) = &source.site_type {
            println!("type:      {site_type}");
        }
        if let Some(requirements) = &source.requirements {
            println!("requirements: {requirements}");
        }
        if let Some(template) = &source.template {
            println!("template:  {template}");
        }
        if let Some(model) = &source.model {
            println!("model:     {model}");
        }
    }
    println!("files:");
    for file in &env.files {
        println!("  {file}");
    }
    Ok(())
}

pub(crate) fn start_command(settings: &Settings, name: &str, port: Option<u16>) -> Result<()> {
    let manager = build_manager(settings)?;
    let already_running = manager.get(name)?.is_running();
    let env = manager.start_server(name, port)?;
    let url = site_url(&env, env.entry_page()).unwrap_or_default();
    if already_running {
        println!("{} is already running at {url}", env.name);
    } else {
        println!("started {} at {url}", env.name);
    }
    Ok(())
}

/// Prints per-item failures and turns a partial bulk result into an error naming them.
fn finish_bulk(report: BulkReport, verb: &str) -> Result<()> {
    if report.is_success() {
        return Ok(());
    }
    for (name, err) in &report.failed {
        eprintln!("  {name}: {err}");
    }
    Err(anyhow!(
        "failed to {verb} {} environment(s): {}",
        report.failed.len(),
        report.failed_names().join(", ")
    ))
}

pub(crate) fn stop_command(settings: &Settings, name: Option<&str>) -> Result<()> {
    let manager = build_manager(settings)?;
    if let Some(name) = name {
        let env = manager.stop_server(name)?;
        println!("stopped {}", env.name);
        return Ok(());
    }

    let report = manager.stop_all()?;
    for stopped in &report.succeeded {
        println!("stopped {stopped}");
    }
    if report.succeeded.is_empty() && report.is_success() {
        println!("no running servers");
    }
    finish_bulk(report, "stop")
}

pub(crate) fn remove_command(settings: &Settings, name: Option<&str>, all: bool) -> Result<()> {
    let manager = build_manager(settings)?;
    if !all {
        let name = name.ok_or_else(|| anyhow!("an environment name or --all is required"))?;
        manager.remove(name)?;
        println!("removed {name}");
        return Ok(());
    }

    let report = manager.remove_all()?;
    for removed in &report.succeeded {
        println!("removed {removed}");
    }
    println!(
        "removed {} environment(s), {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    finish_bulk(report, "remove")
}
