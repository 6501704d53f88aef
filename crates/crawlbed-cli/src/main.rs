mod dispatch;
mod env_commands;
mod error_hints;
mod runtime_context;
mod site_commands;

use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(
    name = "crawlbed",
    version,
    about = "Generate disposable local websites for crawler testing"
)]
struct Cli {
    /// Config file (defaults to ./crawlbed.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the environments.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate a website from a prompt and serve it locally.
    Generate {
        prompt: Option<String>,
        /// Website type tag, e.g. ecommerce or blog.
        #[arg(long = "type", value_name = "TYPE")]
        site_type: Option<String>,
        #[arg(long)]
        requirements: Option<String>,
        #[arg(long)]
        template: Option<String>,
        /// Directory name hint.
        #[arg(long)]
        name: Option<String>,
        /// First port to try.
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        model: Option<String>,
    },
    /// List environments and their servers.
    List,
    /// Show details for one environment.
    Info { name: String },
    /// Start the server of a stopped environment.
    Start {
        name: String,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stop one server, or all servers when no name is given.
    Stop { name: Option<String> },
    /// Remove an environment (alias of remove).
    Cleanup { name: String },
    /// Remove an environment, or all of them with --all.
    Remove {
        #[arg(required_unless_present = "all")]
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },
    /// List prompt templates.
    Templates,
    #[command(hide = true)]
    ServeDir {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = runtime_context::SERVER_HOST)]
        host: String,
    },
}

fn init_logging(verbose: bool, serving: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,crawlbed=debug")
    } else {
        EnvFilter::try_from_env("CRAWLBED_LOG").unwrap_or_else(|_| {
            if serving {
                EnvFilter::new("info,crawlbed=debug")
            } else {
                EnvFilter::new("warn")
            }
        })
    };

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_ansi(std::io::stderr().is_terminal())
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    init_logging(cli.verbose, matches!(cli.command, Commands::ServeDir { .. }));

    match dispatch::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(hint) = error_hints::hint_for(&err) {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}
