use super::{Cli, Commands};
use super::env_commands::{info_command, list_command, remove_command, start_command, stop_command};
use super::runtime_context::resolve_config;
use super::site_commands::{GenerateArgs, generate_command, serve_dir_command, templates_command};
use anyhow::Result;
use crawlbed_config::CliOverrides;

pub(crate) fn execute(cli: Cli) -> Result<()> {
    let mut overrides = CliOverrides {
        root_dir: cli.root,
        verbose: Some(cli.verbose),
        ..CliOverrides::default()
    };

    match cli.command {
        Commands::Generate {
            prompt,
            site_type,
            requirements,
            template,
            name,
            port,
            model,
        } => {
            overrides.template = template;
            overrides.model = model;
            let settings = resolve_config(cli.config, &overrides)?;
            generate_command(
                &settings,
                GenerateArgs {
                    prompt,
                    site_type,
                    requirements,
                    name,
                    port,
                },
            )
        }
        Commands::List => list_command(&resolve_config(cli.config, &overrides)?),
        Commands::Info { name } => info_command(&resolve_config(cli.config, &overrides)?, &name),
        Commands::Start { name, port } => {
            start_command(&resolve_config(cli.config, &overrides)?, &name, port)
        }
        Commands::Stop { name } => {
            stop_command(&resolve_config(cli.config, &overrides)?, name.as_deref())
        }
        Commands::Cleanup { name } => {
            remove_command(&resolve_config(cli.config, &overrides)?, Some(&name), false)
        }
        Commands::Remove { name, all } => remove_command(
            &resolve_config(cli.config, &overrides)?,
            name.as_deref(),
            all,
        ),
        Commands::Templates => templates_command(&resolve_config(cli.config, &overrides)?),
        Commands::ServeDir { dir, port, host } => serve_dir_command(dir, port, host),
    }
}
