//! Keel CLI entrypoint.
//!
//! This is the main entrypoint for the keel command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use keel::cli::{Cli, Commands, OutputFormat, OutputFormatter, ProviderKind, StateCommands};
use keel::config::{ConfigParser, ConfigValidator, DeployConfig, StateBackend, find_config_file};
use keel::engine::Engine;
use keel::error::{ConfigError, KeelError, Result};
use keel::graph::GraphBuilder;
use keel::planner::DiffEngine;
use keel::provider::{HttpProvider, InMemoryProvider, Provider};
use keel::registry::SchemaRegistry;
use keel::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for an apply that left failed or skipped steps behind.
const EXIT_INCOMPLETE: u8 = 2;

/// File the memory provider persists its resources to, inside the state dir.
const MEMORY_PROVIDER_FILE: &str = "memory-provider.json";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence.
fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => {
            cmd_validate(config_path, warnings).map(|()| ExitCode::SUCCESS)
        }
        Commands::Plan { detailed } => {
            let context = Context::load(config_path, cli.provider).await?;
            let outcome = context.engine().plan().await?;
            emit(&formatter.format_plan(&outcome, detailed))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Apply {
            yes,
            concurrency,
            no_refresh,
        } => {
            let context = Context::load(config_path, cli.provider).await?;
            let mut engine = context.engine().with_refresh(!no_refresh);
            if let Some(concurrency) = concurrency {
                engine = engine.with_concurrency(concurrency);
            }
            cmd_apply(&engine, yes, cli.output, &formatter).await
        }
        Commands::Destroy { yes } => {
            let context = Context::load(config_path, cli.provider).await?;
            cmd_destroy(&context, yes, &formatter).await
        }
        Commands::Drift => {
            let context = Context::load(config_path, cli.provider).await?;
            let report = context.engine().check_drift().await?;
            emit(&formatter.format_drift(&report))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::State { command } => {
            let context = Context::load(config_path, cli.provider).await?;
            cmd_state(&context, command, &formatter)
                .await
                .map(|()| ExitCode::SUCCESS)
        }
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Keel project in: {}", path.display());

    let config_path = path.join("keel.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/keel.deploy.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Keel")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set the provider token");
    eprintln!("  2. Edit keel.deploy.yaml with your schemas and resources");
    eprintln!("  3. Run 'keel validate' to check your configuration");
    eprintln!("  4. Run 'keel plan' to see what will change");
    eprintln!("  5. Run 'keel apply' to provision");

    Ok(())
}

/// Validate configuration, schemas and the reference graph.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    if !result.is_valid() {
        eprintln!("Configuration is invalid:");
        for error in &result.errors {
            eprintln!("  - {}: {}", error.field, error.message);
        }
        return Err(KeelError::Config(ConfigError::validation_general(format!(
            "{} error(s) found",
            result.error_count()
        ))));
    }

    let registry = SchemaRegistry::from_config(&config.schemas);
    let graph = GraphBuilder::from_declarations(&config.resources)?.build()?;
    DiffEngine::new(&registry).validate(&graph)?;

    eprintln!("Configuration is valid!");
    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    eprintln!("\nConfiguration summary:");
    eprintln!("  Project: {}", config.project.name);
    eprintln!("  Environment: {}", config.project.environment);
    eprintln!("  Resource types: {}", registry.len());
    eprintln!("  Resources: {}", graph.len());
    eprintln!("  References: {}", graph.edges().len());

    Ok(())
}

/// Apply the configuration.
async fn cmd_apply(
    engine: &Engine,
    auto_approve: bool,
    format: OutputFormat,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    if !auto_approve {
        let preview = engine.plan().await?;
        if !preview.plan.has_changes() && preview.refresh.is_clean() {
            eprintln!("No changes to apply.");
            return Ok(ExitCode::SUCCESS);
        }
        emit(&formatter.format_plan(&preview, false))?;
        if !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let outcome = engine.apply(cancel_on_ctrl_c()).await?;
    if matches!(format, OutputFormat::Text) && !outcome.refresh.is_clean() {
        eprintln!("Refreshed state: {}", outcome.refresh);
    }
    emit(&formatter.format_apply(&outcome))?;
    Ok(exit_code(outcome.report.is_success()))
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    context: &Context,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let Some(state) = context.store.load().await? else {
        eprintln!("No state found, nothing to destroy.");
        return Ok(ExitCode::SUCCESS);
    };
    if state.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("The following resources will be destroyed:");
    for record in state.records() {
        eprintln!("  - {} ({})", record.id(), record.provider_id);
    }

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = context.engine().destroy(cancel_on_ctrl_c()).await?;
    emit(&formatter.format_apply(&outcome))?;
    Ok(exit_code(outcome.report.is_success()))
}

/// State management commands.
async fn cmd_state(
    context: &Context,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let store = &context.store;

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => emit(&formatter.format_state(&state))?,
            None => eprintln!("No state found."),
        },
        StateCommands::List => match store.load().await? {
            Some(state) => emit(&formatter.format_resources(&state))?,
            None => eprintln!("No state found."),
        },
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            eprintln!("State locked: {lock}");
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                match store.get_lock_info().await? {
                    Some(lock) => eprintln!("State is locked: {lock}\nPass --lock-id or --force."),
                    None => eprintln!("State is not locked."),
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a command that touches state needs.
struct Context {
    config: DeployConfig,
    store: Arc<dyn StateStore>,
    provider: Arc<dyn Provider>,
}

impl Context {
    /// Loads configuration and creates the state store and provider.
    async fn load(config_path: Option<&PathBuf>, provider: ProviderKind) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading configuration from: {}", config_file.display());

        let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
        parser.load_dotenv()?;
        let config = parser.load_with_env(&config_file)?;

        let validation = ConfigValidator::new().validate(&config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let state_dir = config.state.path.as_ref().map_or_else(
            || config_dir(&config_file).join(STATE_DIR),
            PathBuf::from,
        );

        let store: Arc<dyn StateStore> = match config.state.backend {
            StateBackend::Local => Arc::new(LocalStateStore::with_base_dir(&state_dir)),
            StateBackend::S3 => {
                let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                    ConfigError::validation("S3 bucket not configured", "state.bucket")
                })?;
                Arc::new(
                    S3StateStore::new(
                        bucket,
                        config.state.prefix.as_deref(),
                        config.state.region.as_deref(),
                    )
                    .await?,
                )
            }
        };

        let provider: Arc<dyn Provider> = match provider {
            ProviderKind::Http => {
                let endpoint = config.provider.endpoint.as_deref().ok_or_else(|| {
                    ConfigError::validation(
                        "provider.endpoint is required for the http provider",
                        "provider.endpoint",
                    )
                })?;
                let token = ConfigParser::get_provider_token(&config.provider.token_env).ok();
                if token.is_none() {
                    debug!(
                        "{} not set, calling provider without a token",
                        config.provider.token_env
                    );
                }
                Arc::new(HttpProvider::with_timeout(
                    endpoint,
                    token,
                    config.provider.timeout_secs,
                )?)
            }
            ProviderKind::Memory => Arc::new(
                InMemoryProvider::new()
                    .with_registry(SchemaRegistry::from_config(&config.schemas))
                    .persistent(state_dir.join(MEMORY_PROVIDER_FILE))?,
            ),
        };

        Ok(Self {
            config,
            store,
            provider,
        })
    }

    fn engine(&self) -> Engine {
        Engine::new(
            self.config.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
        )
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

/// Asks on stderr and compares the answer with `expected`, ignoring case.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// A token cancelled on the first Ctrl-C. Steps already running finish.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, waiting for in-flight steps to finish");
            trigger.cancel();
        }
    });
    token
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCOMPLETE)
    }
}
