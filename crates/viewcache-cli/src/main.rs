//! viewcache - load, watch and clear cached API resources from a terminal.
//!
//! Every command goes through the same disk-backed cache a UI would use, so
//! `show` is instant when the entry is fresh and `watch` only prints when
//! the payload actually changes.

use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use viewcache_core::{
    ApiClient, CacheEntry, CacheKey, CacheRegistry, EngineConfig, ResourceConfig, SharedStorage,
    Staleness,
};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable holding the bearer token for API requests
const TOKEN_ENV: &str = "VIEWCACHE_TOKEN";

/// Environment variable overriding the configured API base URL
const API_URL_ENV: &str = "VIEWCACHE_API_URL";

/// Default poll interval for `watch` in seconds.
/// 30s is frequent enough to notice changes without hammering the server.
const DEFAULT_WATCH_SECS: u64 = 30;

/// Log directory inside the cache directory, and the rolling file prefix
const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "viewcache.log";

const USAGE: &str = "\
Usage: viewcache <command>

Commands:
  show <path>                  Print the cached payload, refreshing if needed
  watch <path> [--every SECS]  Poll the endpoint and print every change
  clear                        Drop all cached entries for the current scope

<path> is relative to the configured API base URL and may contain {scope}.";

/// Initialize the tracing subscriber for logging.
/// Logs go to stderr and to a daily-rolling file next to the cache.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(filter)
        .init();
    guard
}

enum Command {
    Show(String),
    Watch { path: String, every: Duration },
    Clear,
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args.first().map(String::as_str) {
        Some("show") => match args.get(1) {
            Some(path) => Ok(Command::Show(path.clone())),
            None => bail!("show needs a path\n\n{}", USAGE),
        },
        Some("watch") => {
            let path = args
                .get(1)
                .with_context(|| format!("watch needs a path\n\n{}", USAGE))?
                .clone();
            let secs = match (args.get(2).map(String::as_str), args.get(3)) {
                (Some("--every"), Some(secs)) => secs
                    .parse::<u64>()
                    .with_context(|| format!("Invalid interval: {}", secs))?,
                (None, _) => DEFAULT_WATCH_SECS,
                _ => bail!("Unexpected arguments\n\n{}", USAGE),
            };
            if secs == 0 {
                bail!("Interval must be at least one second");
            }
            Ok(Command::Watch {
                path,
                every: Duration::from_secs(secs),
            })
        }
        Some("clear") => Ok(Command::Clear),
        _ => bail!("{}", USAGE),
    }
}

/// Registry connected to the on-disk cache, with `path` registered as a resource.
fn open_registry(config: &EngineConfig, path: Option<&str>) -> Result<CacheRegistry> {
    let storage = SharedStorage::on_disk(config.cache_dir()?)?;
    let registry = CacheRegistry::new(&storage);

    if let Some(path) = path {
        let base_url = std::env::var(API_URL_ENV)
            .ok()
            .or_else(|| config.api_base_url.clone())
            .with_context(|| format!("No API base URL configured (set {} or api_base_url)", API_URL_ENV))?;
        let mut api = ApiClient::new(base_url)?;
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            api.set_token(token);
        }
        let resource = config.apply_policy(ResourceConfig::new(path, api.loader(path)));
        registry.register(resource)?;
    }
    Ok(registry)
}

fn print_entry(key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    println!(
        "# {} ({}, {})",
        key,
        entry.age_display(Utc::now()),
        entry.hash().get(..12).unwrap_or(entry.hash())
    );
    println!("{}", serde_json::to_string_pretty(entry.payload())?);
    Ok(())
}

async fn show(config: &EngineConfig, path: &str) -> Result<()> {
    let registry = open_registry(config, Some(path))?;
    let key = CacheKey::new(path, config.scope());

    let snapshot = registry.snapshot(&key)?;
    if snapshot.staleness == Staleness::Stale {
        info!(key = %key, "Showing stale entry while refreshing");
    }
    let entry = match snapshot.displayable() {
        Some(entry) => entry.clone(),
        None => registry.load(&key).await?,
    };
    print_entry(&key, &entry)?;

    // A stale entry was printed while its refresh runs: let that land
    if snapshot.staleness == Staleness::Stale {
        if let Some(Ok(fresh)) = registry.wait_for_refresh(&key).await {
            if fresh.hash() != entry.hash() {
                print_entry(&key, &fresh)?;
            }
        }
    }
    registry.shutdown();
    Ok(())
}

async fn watch(config: &EngineConfig, path: &str, every: Duration) -> Result<()> {
    let registry = open_registry(config, Some(path))?;
    // Polls that return the same payload stay quiet
    let resource = registry.resource(path)?;
    registry.register((*resource).clone().skip_unchanged())?;
    let key = CacheKey::new(path, config.scope());

    if let Some(entry) = registry.snapshot(&key)?.displayable() {
        print_entry(&key, entry)?;
    }
    let printed_key = key.clone();
    let _subscription = registry.subscribe(&key, move |entry| {
        if let Err(e) = print_entry(&printed_key, entry) {
            eprintln!("Error: {}", e);
        }
    });

    registry.start_polling_every(&key, every)?;
    info!(key = %key, every_secs = every.as_secs(), "Watching");
    tokio::signal::ctrl_c().await?;

    registry.shutdown();
    Ok(())
}

async fn clear(config: &EngineConfig) -> Result<()> {
    let registry = open_registry(config, None)?;
    let removed = registry.clear_scope(config.scope());
    println!("Cleared {} cached entries for scope {}", removed.len(), config.scope());
    registry.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let config = EngineConfig::load()?;
    let log_dir = config.cache_dir()?.join(LOG_DIR);
    std::fs::create_dir_all(&log_dir)?;
    let _guard = init_tracing(&log_dir);
    info!(scope = config.scope(), "viewcache starting");

    match command {
        Command::Show(path) => show(&config, &path).await,
        Command::Watch { path, every } => watch(&config, &path, every).await,
        Command::Clear => clear(&config).await,
    }
}
