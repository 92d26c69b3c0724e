use super::{LogFormat, RuntimeConfig, ServerConfig};
use anyhow::{anyhow, Context, Result};

pub const ENV_PREFIX: &str = "ADRELAY_";

/// Abstraction over environment-variable lookups so tests and embedders can
/// supply their own source of overrides. Keys are given without the prefix.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Server configuration (listen addr, log level/format)
    if let Some(addr) = env.get("LISTEN_ADDR") {
        ensure_server(config).listen_addr = addr;
    }
    if let Some(port) = get_env_parsed::<u16, _>(env, "PORT")? {
        ensure_server(config).listen_addr = format!("0.0.0.0:{}", port);
    }
    if let Some(level) = env.get("LOG_LEVEL") {
        ensure_server(config).log_level = level;
    }
    if let Some(format) = env.get("LOG_FORMAT") {
        ensure_server(config).log_format = format
            .parse::<LogFormat>()
            .context("Invalid ADRELAY_LOG_FORMAT value")?;
    }

    // Batch configuration
    if let Some(val) = get_env_parsed(env, "BATCH_TIMEOUT_SECS")? {
        config.batch.timeout_secs = val;
    }
    if let Some(val) = get_env_parsed(env, "BATCH_STALE_AFTER_SECS")? {
        config.batch.stale_after_secs = val;
    }
    if let Some(val) = get_env_parsed(env, "BATCH_SWEEP_INTERVAL_SECS")? {
        config.batch.sweep_interval_secs = val;
    }
    if let Some(val) = get_env_parsed(env, "BATCH_MAX_ACTIVE")? {
        config.batch.max_active_batches = val;
    }
    if let Some(val) = get_env_parsed(env, "BATCH_MAX_TOTAL")? {
        config.batch.max_total = val;
    }

    // History and request limits
    if let Some(val) = get_env_parsed(env, "HISTORY_CAPACITY")? {
        config.history.capacity = val;
    }
    if let Some(val) = get_env_parsed(env, "MAX_PAYLOAD_BYTES")? {
        config.request.max_payload_bytes = val;
    }

    Ok(())
}

fn ensure_server(config: &mut RuntimeConfig) -> &mut ServerConfig {
    config.server.get_or_insert_with(ServerConfig::default)
}

fn get_env_parsed<T, E>(env: &E, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    E: EnvSource,
{
    match env.get(key) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}
