//! RDAP Enrichment Pipeline
//!
//! This is the main entry point for the enrichment pipeline. It loads
//! and validates the configuration, wires up the cache, rate limiter
//! and lookup client, and runs the sharded orchestrator over the
//! monthly input partitions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use log::{debug, info};
use metrics_exporter_prometheus::PrometheusBuilder;

use rdap_enrichment::config;
use rdap_enrichment::core::{
    HttpRdapTransport, LookupClient, Orchestrator, RateLimiter, RdapCache, ReusePolicy,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting RDAP enrichment pipeline...");

    // Load and validate configuration
    let config = config::load_config().context("failed to load configuration")?;
    config
        .validate()
        .context("invalid configuration, aborting before any lookup")?;

    // Install the metrics recorder
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    // Wire up the lookup stack
    let cache = Arc::new(RdapCache::open(&config.cache_path).context("failed to open cache")?);
    let limiter = RateLimiter::new(config.qps, config.burst);
    let transport = HttpRdapTransport::new(Duration::from_secs(config.timeout_secs))
        .context("failed to build HTTP transport")?;
    let policy = ReusePolicy {
        retry_failed: config.retry_failed_cache,
        retry_empty_country: config.retry_empty_country,
    };
    let client = Arc::new(LookupClient::new(
        Box::new(transport),
        limiter,
        cache,
        policy,
        config.max_attempts,
    ));

    // Run this shard's share of the work
    let orchestrator = Orchestrator::new(config, client);
    let summary = orchestrator.run().await?;

    info!(
        "all assigned files processed: {} ok, {} skipped, {} failed, {} rows",
        summary.files_processed, summary.files_skipped, summary.files_failed, summary.rows_written
    );
    debug!("metrics snapshot:\n{}", metrics_handle.render());
    Ok(())
}
