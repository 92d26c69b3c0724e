use adrelay_config::RuntimeConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Relay for chunked ad-analysis payloads with WebSocket and polling delivery
#[derive(Parser)]
#[command(name = "adrelay")]
#[command(version)]
#[command(about = "Reassembles chunked payloads and broadcasts them to dashboard clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// HTTP listen port (overrides config file)
    #[arg(short, long, value_name = "PORT", global = true)]
    port: Option<u16>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Number of delivered payloads kept for polling clients
    #[arg(long, value_name = "ENTRIES", global = true)]
    history_capacity: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default if no subcommand given)
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve) | None => run_server(cli),
    }
}

fn run_server(cli: Cli) -> Result<()> {
    // Build tokio runtime and run async server
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Step 1: Load base configuration
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        // Try default locations, fall back to defaults
        RuntimeConfig::load_or_default().context("Failed to load configuration")?
    };

    // Step 2: Apply CLI overrides (highest priority)
    apply_cli_overrides(&mut config, &cli);

    // Step 3: Initialize tracing early so validation logs show up
    adrelay_server::init_tracing(&config);

    // Step 4: Re-validate after overrides
    config
        .validate()
        .context("Invalid configuration after applying command line flags")?;

    // Step 5: Display startup info
    display_startup_info(&config);

    // Step 6: Run server with resolved config
    adrelay_server::run_with_config(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    use adrelay_config::ServerConfig;

    if let Some(port) = cli.port {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.listen_addr = format!("0.0.0.0:{}", port);
    }

    if let Some(level) = &cli.log_level {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.log_level = level.clone();
    }

    if let Some(capacity) = cli.history_capacity {
        config.history.capacity = capacity;
    }
}

fn display_startup_info(config: &RuntimeConfig) {
    use tracing::info;

    let Some(server) = config.server.as_ref() else {
        return;
    };

    info!("╭─────────────────────────────────────────────────");
    info!("│ adrelay v{}", env!("CARGO_PKG_VERSION"));
    info!("├─────────────────────────────────────────────────");
    info!("│ Listen address: http://{}", server.listen_addr);
    info!("│ Log level: {} ({})", server.log_level, server.log_format);
    info!("│ History capacity: {}", config.history.capacity);
    info!("│ Batches:");
    info!("│   - Timeout: {}s", config.batch.timeout_secs);
    info!("│   - Stale after: {}s", config.batch.stale_after_secs);
    info!("│   - Max in flight: {}", config.batch.max_active_batches);
    info!("│   - Max chunks per batch: {}", config.batch.max_total);
    info!(
        "│ Max payload: {} KB",
        config.request.max_payload_bytes / 1024
    );
    info!("╰─────────────────────────────────────────────────");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_on_top_of_config() {
        let cli = Cli::parse_from([
            "adrelay",
            "serve",
            "--port",
            "4000",
            "--log-level",
            "debug",
            "--history-capacity",
            "25",
        ]);
        let mut config = RuntimeConfig::defaults();
        apply_cli_overrides(&mut config, &cli);

        let server = config.server.as_ref().unwrap();
        assert_eq!(server.listen_addr, "0.0.0.0:4000");
        assert_eq!(server.log_level, "debug");
        assert_eq!(config.history.capacity, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_history_capacity_fails_validation() {
        let cli = Cli::parse_from(["adrelay", "--history-capacity", "0"]);
        let mut config = RuntimeConfig::defaults();
        apply_cli_overrides(&mut config, &cli);
        assert!(config.validate().is_err());
    }
}
