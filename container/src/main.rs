//! container-server entry point.
//!
//! Configuration comes from `RULE_CONTAINER_*` environment variables; see
//! `ServerConfig::from_env`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use container::ephemeral::EphemeralContainerBuilder;
use container::refresh::SyncScheduler;
use container::types::RuleFactConfig;
use container::{
    FactTypeRegistry, RuleContainer, ServerConfig, SqliteRuleRepository, TestExecutionEngine,
    TestResult, TestRuleRequest,
};

/// Production rule container with isolated rule testing
#[derive(Parser, Debug)]
#[command(name = "container-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load enabled rules and keep them in sync with the store (default)
    Serve,

    /// Run a test request (camelCase JSON) against stored rules
    Test {
        /// Path to the request file
        request: PathBuf,
    },

    /// Run facts against the rules currently in production
    Run {
        /// JSON array of fact configurations
        facts: PathBuf,

        /// Deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Compile a rule file without touching production
    Validate {
        /// Path to the rule source
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "container=debug,rule_engine=debug"
    } else {
        "container=info,rule_engine=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

struct Services {
    container: Arc<RuleContainer>,
    engine: TestExecutionEngine,
    config: ServerConfig,
}

fn open_services() -> Result<Services, String> {
    let config = ServerConfig::from_env()?;

    let repository = Arc::new(
        SqliteRuleRepository::open(&config.database_path).map_err(|e| {
            format!(
                "Failed to open rule store {}: {}",
                config.database_path.display(),
                e
            )
        })?,
    );
    let registry = match &config.fact_types_path {
        Some(path) => FactTypeRegistry::load(path)?,
        None => FactTypeRegistry::new(),
    };
    info!(
        "Opened rule store {} with {} fact type(s)",
        config.database_path.display(),
        registry.len()
    );

    let container = Arc::new(RuleContainer::new(
        repository.clone(),
        config.container.clone(),
    ));
    let engine = TestExecutionEngine::new(
        repository,
        Arc::new(registry),
        EphemeralContainerBuilder::new(config.container.clone()),
        config.test.clone(),
    );
    Ok(Services {
        container,
        engine,
        config,
    })
}

async fn run(cli: Cli) -> Result<ExitCode, String> {
    let services = open_services()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(services).await,
        Command::Test { request } => {
            let request: TestRuleRequest = read_json(&request)?;
            let result = services.engine.execute_test(request).await;
            print_result(&result)
        }
        Command::Run { facts, timeout_ms } => {
            let configs: Vec<RuleFactConfig> = read_json(&facts)?;
            services
                .container
                .initialize()
                .map_err(|e| e.to_string())?;
            let result = services
                .engine
                .execute_on_production(
                    &services.container,
                    configs,
                    cli.verbose,
                    timeout_ms.map(Duration::from_millis),
                )
                .await;
            services.container.shutdown();
            print_result(&result)
        }
        Command::Validate { file } => {
            let content = std::fs::read_to_string(&file)
                .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
            let result = services.container.validate_rule_content(&content);
            let json = serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?;
            println!("{}", json);
            Ok(if result.valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn serve(services: Services) -> Result<ExitCode, String> {
    let Services {
        container, config, ..
    } = services;

    container.initialize().map_err(|e| e.to_string())?;
    let health = container.health_status();
    info!(
        "Rule container ready: {} rule(s) loaded, release {}",
        health.loaded_rules_count,
        health.release_id.as_deref().unwrap_or("-")
    );

    let scheduler = Arc::new(SyncScheduler::new(
        Arc::clone(&container),
        config.scheduler.clone(),
    ));
    let task = tokio::spawn(scheduler.start());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for shutdown signal: {}", e))?;

    info!("Shutting down rule container");
    task.abort();
    container.shutdown();
    Ok(ExitCode::SUCCESS)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in {}: {}", path.display(), e))
}

fn print_result(result: &TestResult) -> Result<ExitCode, String> {
    let json = serde_json::to_string_pretty(result).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
