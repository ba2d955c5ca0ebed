mod builder;
mod config;
mod run_cmd;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use config::{CliOverrides, RelayConfig};

#[derive(Parser)]
#[command(name = "relay", about = "Rebuild-on-change development harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ProjectArgs {
    /// Project directory (defaults to the current directory)
    project: Option<PathBuf>,
    /// Config file (defaults to <project>/relay.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the app, rebuilding it whenever its sources change
    Run {
        #[command(flatten)]
        project: ProjectArgs,
        /// Run mode passed to the app (overrides RELAY_RUN_MODE)
        #[arg(long)]
        mode: Option<String>,
        /// Port the harness listens on (overrides RELAY_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Build the app once and print the executable path
    Build {
        #[command(flatten)]
        project: ProjectArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            project,
            mode,
            port,
        } => {
            let config = RelayConfig::resolve(&CliOverrides {
                project: project.project,
                mode,
                port,
                config: project.config,
            })?;
            let code = run_cmd::run(config).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Build { project } => {
            let config = RelayConfig::resolve(&CliOverrides {
                project: project.project,
                config: project.config,
                ..CliOverrides::default()
            })?;
            run_cmd::build(&config).await?;
        }
    }

    Ok(())
}
