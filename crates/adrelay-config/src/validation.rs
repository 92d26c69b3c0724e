// Configuration validation
//
// Validates that required fields are present and values are sensible

use crate::*;
use anyhow::{bail, Result};
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_batch_config(&config.batch)?;
    validate_history_config(&config.history)?;
    validate_request_config(&config.request)?;

    if let Some(ref server) = config.server {
        validate_server_config(server)?;
    }

    Ok(())
}

fn validate_batch_config(config: &BatchConfig) -> Result<()> {
    if config.timeout_secs == 0 {
        bail!("batch.timeout_secs must be greater than 0");
    }

    if config.sweep_interval_secs == 0 {
        bail!("batch.sweep_interval_secs must be greater than 0");
    }

    if config.max_active_batches == 0 {
        bail!("batch.max_active_batches must be greater than 0");
    }

    if config.max_total == 0 {
        bail!("batch.max_total must be greater than 0");
    }

    // The sweep is a backstop for lost timers; it must not pre-empt them.
    if config.stale_after_secs < config.timeout_secs {
        bail!(
            "batch.stale_after_secs ({}) must not be shorter than batch.timeout_secs ({})",
            config.stale_after_secs,
            config.timeout_secs
        );
    }

    if config.max_active_batches > 100_000 {
        warn!(
            max_active_batches = config.max_active_batches,
            "batch.max_active_batches is very large; abandoned batches may hold a lot of memory"
        );
    }

    if config.max_total > 1_000_000 {
        warn!(
            max_total = config.max_total,
            "batch.max_total is very large; a single batch may hold a lot of memory"
        );
    }

    Ok(())
}

fn validate_history_config(config: &HistoryConfig) -> Result<()> {
    if config.capacity == 0 {
        bail!("history.capacity must be greater than 0");
    }

    if config.capacity > 100_000 {
        warn!(
            capacity = config.capacity,
            "history.capacity is very large; GET /data responses may be huge"
        );
    }

    Ok(())
}

fn validate_request_config(config: &RequestConfig) -> Result<()> {
    if config.max_payload_bytes == 0 {
        bail!("request.max_payload_bytes must be greater than 0");
    }

    if config.max_payload_bytes > 100 * 1024 * 1024 {
        // 100 MB
        warn!(
            max_payload_bytes = config.max_payload_bytes,
            "request.max_payload_bytes is very large; may cause issues"
        );
    }

    Ok(())
}

fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.listen_addr.is_empty() {
        bail!("server.listen_addr must not be empty");
    }

    // Basic validation that it looks like an address
    if !config.listen_addr.contains(':') {
        bail!("server.listen_addr must be in format 'host:port'");
    }

    Ok(())
}
