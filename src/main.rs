//! Tabular - paginated table views over SQLite resources
//!
//! This is the main entry point for the Tabular service host and CLI.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tabular::config::{CacheBackendKind, Config, LogFormat};
use tabular::maintenance::{start_sweeper, SweepConfig};
use tabular::{CallerId, QueryRequest, QueryService};
use tracing::{error, info, warn};

/// Tabular - paginated table views over SQLite resources
///
/// Serves filtered, sorted, paginated table queries with a shared result
/// cache and a local materialization cache.
#[derive(Parser, Debug)]
#[command(name = "tabular")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        env = "TABULAR_LOG_LEVEL",
        global = true
    )]
    loglevel: Option<String>,

    /// Result cache backend: redis, memory, disabled (overrides config file)
    #[arg(
        long = "cache-backend",
        value_name = "BACKEND",
        env = "TABULAR_CACHE_BACKEND",
        global = true
    )]
    cache_backend: Option<String>,

    /// Redis URL for the result cache (overrides config file)
    #[arg(
        long = "redis-url",
        value_name = "URL",
        env = "TABULAR_REDIS_URL",
        global = true
    )]
    redis_url: Option<String>,

    /// Materialization root directory (overrides config file)
    #[arg(
        long = "materialization-root",
        value_name = "PATH",
        env = "TABULAR_MATERIALIZATION_ROOT",
        global = true
    )]
    materialization_root: Option<PathBuf>,

    /// Caller identity for CLI requests
    #[arg(long = "user", value_name = "ID", env = "TABULAR_USER", global = true)]
    user: Option<String>,

    /// Test configuration and exit
    #[arg(long = "test-config", action = ArgAction::SetTrue, global = true)]
    test_config: bool,

    /// Dump effective configuration to stdout and exit
    #[arg(long = "dump-config", action = ArgAction::SetTrue, global = true)]
    dump_config: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host the service: startup sweep, then periodic sweeps until Ctrl-C (default)
    Run,

    /// List resources in the inventory
    Resources,

    /// List tables of a resource
    Tables {
        /// Resource id; empty selects the bundled fallback source
        #[arg(default_value = "")]
        resource: String,
    },

    /// Query one table of a resource
    Query {
        /// Resource id; empty selects the bundled fallback source
        resource: String,

        /// Table name
        table: String,

        /// Maximum rows to return
        #[arg(long)]
        limit: Option<String>,

        /// Rows to skip
        #[arg(long)]
        offset: Option<String>,

        /// Column to order by
        #[arg(long = "sort-column")]
        sort_column: Option<String>,

        /// asc or desc
        #[arg(long = "sort-order")]
        sort_order: Option<String>,

        /// Substring matched against every column
        #[arg(long)]
        search: Option<String>,

        /// Per-column substring filter, COLUMN=VALUE (repeatable)
        #[arg(long = "filter", value_name = "COLUMN=VALUE", action = ArgAction::Append)]
        filters: Vec<String>,
    },

    /// Row counts for every table of a resource
    Summary {
        /// Resource id; empty selects the bundled fallback source
        #[arg(default_value = "")]
        resource: String,
    },

    /// Evict stale materializations once
    Sweep {
        /// Retention window in seconds (overrides config file)
        #[arg(long = "retention-secs")]
        retention_secs: Option<u64>,
    },

    /// Print service status
    Status,
}

impl Cli {
    /// Apply CLI argument overrides to the configuration
    fn apply_to_config(&self, config: &mut Config) -> Result<(), String> {
        if let Some(ref level) = self.loglevel {
            config.logging.level = level.clone();
        }
        if let Some(ref backend) = self.cache_backend {
            config.cache.backend = match backend.to_lowercase().as_str() {
                "redis" => CacheBackendKind::Redis,
                "memory" => CacheBackendKind::Memory,
                "disabled" | "none" => CacheBackendKind::Disabled,
                other => {
                    return Err(format!(
                        "Invalid cache backend: {}. Expected: redis, memory, disabled",
                        other
                    ))
                }
            };
        }
        if let Some(ref url) = self.redis_url {
            config.cache.redis_url = url.clone();
        }
        if let Some(ref root) = self.materialization_root {
            config.materialization.root = root.clone();
        }
        Ok(())
    }

    fn caller(&self) -> CallerId {
        CallerId::resolve(self.user.as_deref())
    }
}

#[derive(Debug, Clone)]
enum ConfigSource {
    Explicit(PathBuf),
    DefaultFile(PathBuf),
    Defaults,
}

impl ConfigSource {
    fn label(&self) -> String {
        match self {
            ConfigSource::Explicit(path) | ConfigSource::DefaultFile(path) => {
                path.display().to_string()
            }
            ConfigSource::Defaults => "built-in defaults".to_string(),
        }
    }
}

fn load_config(cli: &Cli) -> Result<(Config, ConfigSource), String> {
    if let Some(path) = &cli.config {
        if !path.exists() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        let config = Config::from_file(path).map_err(|e| e.to_string())?;
        return Ok((config, ConfigSource::Explicit(path.clone())));
    }

    let default_path = PathBuf::from("tabular.toml");
    if default_path.exists() {
        let config = Config::from_file(&default_path).map_err(|e| e.to_string())?;
        return Ok((config, ConfigSource::DefaultFile(default_path)));
    }

    Ok((Config::default(), ConfigSource::Defaults))
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Logs go to stderr so command output on stdout stays machine-readable.
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Split `COLUMN=VALUE` filter arguments.
fn parse_filters(raw: &[String]) -> Result<BTreeMap<String, String>, String> {
    raw.iter()
        .map(|item| match item.split_once('=') {
            Some((column, value)) if !column.is_empty() => {
                Ok((column.to_string(), value.to_string()))
            }
            _ => Err(format!(
                "Invalid filter '{}': expected COLUMN=VALUE format",
                item
            )),
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(out) => {
            println!("{}", out);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to encode output: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn report<T: Serialize>(result: tabular::Result<T>) -> ExitCode {
    match result {
        Ok(value) => print_json(&value),
        Err(e) => {
            error!(code = e.code(), retryable = e.is_retryable(), "{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_run(service: Arc<QueryService>, config: &Config) -> ExitCode {
    let retention = config.materialization.retention();

    if config.materialization.sweep_on_startup {
        let report = service.maintenance_sweep(retention).await;
        info!(
            "Startup sweep: removed {} of {} materializations",
            report.removed, report.scanned
        );
    }

    let sweeper = config.materialization.sweep_interval().map(|interval| {
        info!(
            "Sweeping every {:?} with retention {:?}",
            interval, retention
        );
        start_sweeper(service.clone(), SweepConfig { interval, retention })
    });
    if sweeper.is_none() {
        warn!("Periodic sweeps disabled (materialization.sweep_interval_secs = 0)");
    }

    info!("Tabular {} running; press Ctrl-C to stop", tabular::service::VERSION);
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    if let Some(sweeper) = sweeper {
        sweeper.stop().await;
    }
    info!("Tabular shut down gracefully");
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (mut config, source) = match load_config(&cli) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("Error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = cli.apply_to_config(&mut config) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    if cli.dump_config {
        return match config.to_toml() {
            Ok(output) => {
                print!("{output}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if cli.test_config {
        println!("Configuration OK ({})", source.label());
        println!("  Cache backend: {:?}", config.cache.backend);
        println!("  Cache TTL: {}s", config.cache.ttl_secs);
        println!("  Materialization root: {}", config.materialization.root.display());
        println!("  Retention: {}s", config.materialization.retention_secs);
        println!("  Transfer: {:?}", config.materialization.transfer);
        println!("  Resources: {}", config.resources.len());
        println!("  Log level: {}", config.logging.level);
        return ExitCode::SUCCESS;
    }

    init_logging(&config);
    info!("Loaded configuration from {}", source.label());

    let service = match QueryService::from_config(&config) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let caller = cli.caller();

    match cli.command {
        Some(Commands::Run) | None => cmd_run(service, &config).await,

        Some(Commands::Resources) => print_json(&service.list_resources()),

        Some(Commands::Tables { ref resource }) => {
            report(service.list_tables(&caller, resource).await)
        }

        Some(Commands::Query {
            ref resource,
            ref table,
            ref limit,
            ref offset,
            ref sort_column,
            ref sort_order,
            ref search,
            ref filters,
        }) => {
            let column_filters = match parse_filters(filters) {
                Ok(filters) => filters,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            let request = QueryRequest {
                table_name: table.clone(),
                limit: limit.clone().map(serde_json::Value::String),
                offset: offset.clone().map(serde_json::Value::String),
                sort_column: sort_column.clone(),
                sort_order: sort_order.clone(),
                search_value: search.clone(),
                column_filters: Some(
                    column_filters
                        .into_iter()
                        .map(|(column, value)| (column, serde_json::Value::String(value)))
                        .collect(),
                ),
            };
            let outcome = service.query_request(&caller, resource, request).await;
            service.wait_idle().await;
            report(outcome)
        }

        Some(Commands::Summary { ref resource }) => {
            report(service.table_summary(&caller, resource).await)
        }

        Some(Commands::Sweep { retention_secs }) => {
            let retention = retention_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.materialization.retention());
            print_json(&service.maintenance_sweep(retention).await)
        }

        Some(Commands::Status) => print_json(&service.status()),
    }
}
