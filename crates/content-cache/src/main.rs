use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use content_cache::config::loader::{DEFAULT_CONFIG_FILE, load_config};
use content_cache::{create_content_cache, metrics, observability, warmup};

#[derive(Parser, Debug)]
#[command(name = "content-cache-warmer")]
#[command(about = "Load static reference content into the content cache")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "CONTENT_CACHE_CONFIG")]
    config: Option<String>,

    /// Directory of `{type}.{scope}.{lang}.json` files (overrides `warmup.dir`)
    #[arg(short, long)]
    dir: Option<String>,
}

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From CONTENT_CACHE_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (content-cache.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (CONTENT_CACHE_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    observability::init_tracing();

    let (config_path, source) = resolve_config_path(&cli, &matches);
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(path = %config_path, source = %source, "Configuration loaded");
    observability::apply_logging_level(&cfg.logging.level);
    metrics::init_metrics();

    let dir = cli.dir.clone().or_else(|| cfg.warmup.dir.clone());
    let Some(dir) = dir else {
        eprintln!("No warm-up directory: pass --dir <path> or set warmup.dir");
        std::process::exit(2);
    };

    let cache = create_content_cache(&cfg).await;
    if cache.is_degraded() {
        tracing::warn!("distributed tier unavailable, warm-up only fills this process");
    }

    let exit_code = match warmup::warm_static_reference(&cache, &dir, &cfg.warmup.languages).await {
        Ok(report) => {
            tracing::info!(
                loaded = report.loaded.len(),
                skipped = report.skipped,
                "Warm-up complete"
            );
            0
        }
        Err(e) => {
            tracing::error!(error = %e, dir = %dir, "Warm-up failed");
            1
        }
    };

    let stats = cache.stats();
    tracing::info!(
        memory_entries = stats.memory_entries,
        degraded = stats.degraded,
        "Cache stats"
    );
    if let Some(text) = metrics::render_metrics() {
        tracing::debug!(metrics = %text, "Final metrics");
    }

    cache.close().await;
    std::process::exit(exit_code);
}

fn resolve_config_path(cli: &Cli, matches: &ArgMatches) -> (String, ConfigSource) {
    match (&cli.config, matches.value_source("config")) {
        (Some(path), Some(ValueSource::EnvVariable)) => {
            (path.clone(), ConfigSource::EnvironmentVariable)
        }
        (Some(path), _) => (path.clone(), ConfigSource::CliArgument),
        (None, _) => (DEFAULT_CONFIG_FILE.to_string(), ConfigSource::Default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (Cli, ArgMatches) {
        let matches = Cli::command().try_get_matches_from(args).unwrap();
        let cli = Cli::from_arg_matches(&matches).unwrap();
        (cli, matches)
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_flag_wins() {
        let (cli, matches) = parse(&["content-cache-warmer", "--config", "prod.toml", "--dir", "seed"]);
        let (path, source) = resolve_config_path(&cli, &matches);
        assert_eq!(path, "prod.toml");
        assert!(matches!(source, ConfigSource::CliArgument));
        assert_eq!(cli.dir.as_deref(), Some("seed"));
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let err = Cli::command()
            .try_get_matches_from(["content-cache-warmer", "--dri", "seed"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }
}
