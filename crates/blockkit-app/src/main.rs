//! Local host for the template app: export the registration manifest, inspect the resolved
//! config, or dispatch one event and print what the block emitted.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use blockkit_core::{
    App, InvocationReport, Runtime, RuntimeOptions, init_observability, resolve_config,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::warn;

#[derive(Parser)]
#[command(name = "blockkit-app")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run the blockkit template app the way a host would", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the app definition the host loads
    Manifest {
        #[arg(long)]
        pretty: bool,
    },

    /// Resolve installer config from env and file, printed with secrets masked
    Config {
        /// JSON object of config values, applied over BLOCKKIT_CONFIG_* variables
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Dispatch one event and print emitted events as JSON lines
    Run {
        #[arg(short, long, default_value = blockkit_blocks::EXAMPLE_BLOCK)]
        block: String,

        #[arg(short, long, default_value = blockkit_blocks::DEFAULT_INPUT)]
        input: String,

        /// Event parameters as a JSON value
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// JSON object of config values, applied over BLOCKKIT_CONFIG_* variables
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Cancel the invocation after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    config::init_env();
    init_observability();
    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> anyhow::Result<ExitCode> {
    let app = blockkit_blocks::app().context("loading app definition")?;
    match command {
        Commands::Manifest { pretty } => {
            let json = if pretty {
                serde_json::to_string_pretty(app.definition())?
            } else {
                serde_json::to_string(app.definition())?
            };
            println!("{json}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { config } => {
            let raw = load_config(&app, config)?;
            let resolved = resolve_config(app.definition(), &raw)?;
            println!("{}", serde_json::to_string_pretty(&resolved.masked())?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            block,
            input,
            params,
            config,
            timeout_ms,
        } => {
            let params: Value = serde_json::from_str(&params).context("--params must be JSON")?;
            let raw = load_config(&app, config)?;
            let runtime = Runtime::start(app, &raw, RuntimeOptions::default())?;
            let report = dispatch_one(&runtime, &block, &input, params, timeout_ms).await?;
            runtime.shutdown().await;

            for event in report.events() {
                println!("{}", serde_json::to_string(event)?);
            }
            if report.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{}", serde_json::to_string_pretty(&report)?);
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn load_config(
    app: &App,
    file: Option<PathBuf>,
) -> anyhow::Result<serde_json::Map<String, Value>> {
    config::load(
        app.definition(),
        |key| std::env::var(key).ok(),
        file.as_deref(),
    )
}

async fn dispatch_one(
    runtime: &Runtime,
    block: &str,
    input: &str,
    params: Value,
    timeout_ms: Option<u64>,
) -> anyhow::Result<InvocationReport> {
    let handle = runtime.dispatch(block, input, params)?;
    let Some(ms) = timeout_ms else {
        return Ok(handle.wait().await);
    };
    let abort = handle.abort_handle();
    let mut wait = Box::pin(handle.wait());
    match tokio::time::timeout(Duration::from_millis(ms), &mut wait).await {
        Ok(report) => Ok(report),
        Err(_) => {
            warn!(timeout_ms = ms, "invocation timed out, cancelling");
            abort.abort();
            Ok(wait.await)
        }
    }
}
