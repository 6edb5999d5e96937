//! Configuration management for the RDAP enrichment pipeline.
//!
//! This module handles loading the application configuration from an
//! optional TOML file layered under environment variables, so sharded
//! runs can be driven entirely from the environment.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default().try_parsing(true))
        .set_default("part_dir", "data/enriched_monthly")?
        .set_default("out_dir", "data/enriched_monthly_rdap")?
        .set_default("cache_path", "data/rdap_cache.jsonl")?
        .set_default("workers", 48)?
        .set_default("qps", 12.0)?
        .set_default("burst", 36)?
        .set_default("max_attempts", 6)?
        .set_default("timeout_secs", 12)?
        .set_default("lookup_budget", 0)?
        .set_default("retry_failed_cache", true)?
        .set_default("retry_empty_country", true)?
        .set_default("shard_total", 1)?
        .set_default("shard_index", 0)?
        .set_default("skip_if_exists", true)?
        .set_default("cdn_filter_enabled", true)?
        .build()?;

    config.try_deserialize()
}
