use clap::{Parser, Subcommand};
use keel::{Request, TracingSink, init_tracing};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

mod bootstrap;
mod config;

use bootstrap::{CliError, Runtime};
use config::KeelConfig;

#[derive(Parser, Debug)]
#[command(name = "keel", version)]
#[command(about = "Keel - run tool plans against in-process tools and capability servers")]
struct Cli {
    /// Configuration file (default: $KEEL_CONFIG, then ./keel.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a request and print the JSON response
    Run {
        /// JSON file holding the request
        #[arg(long)]
        plan: PathBuf,
        /// Print the response on a single line
        #[arg(long)]
        compact: bool,
    },
    /// List registered tools
    Tools,
    /// Validate configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match KeelConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let outcome = match cli.command {
        Commands::Run { plan, compact } => run(&config, &plan, compact).await,
        Commands::Tools => list_tools(&config),
        Commands::CheckConfig => {
            check_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    };
    outcome.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    })
}

async fn run(config: &KeelConfig, plan: &Path, compact: bool) -> Result<ExitCode, CliError> {
    let text = std::fs::read_to_string(plan).map_err(|source| CliError::PlanFile {
        path: plan.to_path_buf(),
        source,
    })?;
    let request: Request = serde_json::from_str(&text).map_err(|source| CliError::PlanFormat {
        path: plan.to_path_buf(),
        source,
    })?;

    let runtime = Runtime::build(config, Arc::new(TracingSink))?;
    let started = runtime.start_servers();
    tracing::debug!(servers = started, "Capability servers starting");

    let response = tokio::select! {
        response = runtime.engine.execute(request) => Some(response),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(response) = response else {
        tracing::warn!("Interrupted, shutting down");
        runtime.shutdown()?;
        return Ok(ExitCode::from(130));
    };
    let outcome = match response {
        Ok(response) => {
            let rendered = if compact {
                serde_json::to_string(&response)?
            } else {
                serde_json::to_string_pretty(&response)?
            };
            println!("{rendered}");
            Ok(if response.is_completed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Err(e) => Err(CliError::from(e)),
    };
    runtime.shutdown()?;
    outcome
}

fn list_tools(config: &KeelConfig) -> Result<ExitCode, CliError> {
    let runtime = Runtime::build(config, Arc::new(TracingSink))?;
    let tools = runtime.engine.registry().list();
    let width = tools.iter().map(|t| t.name.as_str().len()).max().unwrap_or(0);
    for tool in &tools {
        println!(
            "{:<width$}  {:<16}  {}",
            tool.name.as_str(),
            tool.handle_ref.as_str(),
            tool.description
        );
    }
    runtime.shutdown()?;
    Ok(ExitCode::SUCCESS)
}

fn check_config(config: &KeelConfig) {
    let tools: usize = config.servers.iter().map(|s| s.tools.len()).sum();
    println!("Configuration OK");
    println!("  call timeout:     {}s", config.tools.timeout_seconds);
    println!("  max retries:      {}", config.tools.max_retries);
    println!(
        "  memory:           {}",
        config
            .memory
            .path
            .as_ref()
            .map_or_else(|| "in-memory only".to_string(), |p| p.display().to_string())
    );
    println!("  servers:          {} ({tools} tools)", config.servers.len());
}
