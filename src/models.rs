use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified reason for a failed registry lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupErrorKind {
    /// The query exceeded the per-attempt timeout
    Timeout,
    /// The registry has no record for this address
    NotFound,
    /// The registry throttled the query (HTTP 429/503)
    RateLimited,
    /// The response could not be parsed as an RDAP document
    Malformed,
    /// Any other transport-level failure
    Unknown,
}

impl LookupErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupErrorKind::Timeout => "timeout",
            LookupErrorKind::NotFound => "not_found",
            LookupErrorKind::RateLimited => "rate_limited",
            LookupErrorKind::Malformed => "malformed",
            LookupErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for LookupErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized outcome of one registry lookup, keyed by IP address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdapResult {
    /// Whether the registry answered with a usable record
    pub ok: bool,
    /// Registry-asserted country code for the covering network
    #[serde(default)]
    pub net_cc: Option<String>,
    /// Network or organization name from the registry record
    #[serde(default)]
    pub org: Option<String>,
    /// Covering address block
    #[serde(default)]
    pub cidr: Option<String>,
    /// Which regional registry answered
    #[serde(default)]
    pub rir: Option<String>,
    /// Classified error descriptor when `ok` is false
    #[serde(default)]
    pub error: Option<String>,
}

impl RdapResult {
    /// Build a negative result from a classified failure
    pub fn failure(kind: LookupErrorKind, message: &str) -> Self {
        let error = if message.is_empty() {
            kind.as_str().to_string()
        } else {
            format!("{}: {}", kind, message)
        };
        Self {
            ok: false,
            net_cc: None,
            org: None,
            cidr: None,
            rir: None,
            error: Some(error),
        }
    }

    /// Country code of a successful lookup, empty when absent
    pub fn country(&self) -> &str {
        if !self.ok {
            return "";
        }
        self.net_cc.as_deref().unwrap_or("")
    }
}

/// Persisted form of a lookup result, one JSON object per cache log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub ip: String,
    pub at: DateTime<Utc>,
    pub data: RdapResult,
}

impl CacheEntry {
    pub fn new(ip: &str, data: RdapResult) -> Self {
        Self {
            ip: ip.to_string(),
            at: Utc::now(),
            data,
        }
    }
}

/// Errors raised by `Config::validate` before any lookup begins
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("shard index {index} out of range for shard total {total}")]
    ShardOutOfRange { index: u32, total: u32 },
    #[error("shard total must be at least 1")]
    ZeroShards,
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("queries-per-second must be positive, got {0}")]
    NonPositiveQps(f64),
    #[error("burst capacity must be at least 1")]
    ZeroBurst,
    #[error("retry attempt ceiling must be at least 1")]
    ZeroAttempts,
}

fn default_cdn_asns() -> Vec<u32> {
    vec![
        13335, 20940, 32787, 54113, 199524, 12989, 16509, 14618, 15169, 8075, 31898, 45102, 20473,
        14061, 63949, 16276, 24940, 9009, 60781, 32934, 174, 262254, 57724, 209242, 132203,
    ]
}

fn default_cdn_domain_keys() -> Vec<String> {
    [
        "cloudflare",
        "akamai",
        "amazonaws",
        "cloudfront",
        "fastly",
        "cdn",
        "googleusercontent",
        "azure",
        "aliyuncs",
        "oraclecloud",
        "linodeusercontent",
        "digitaloceanspaces",
        "edgesuite",
        "edgekey",
        "cdn77",
        "gcore",
        "stackpath",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_cdn_org_keys() -> Vec<String> {
    [
        "cloudflare",
        "akamai",
        "fastly",
        "amazon",
        "aws",
        "google",
        "microsoft",
        "azure",
        "oracle",
        "alibaba",
        "tencent",
        "linode",
        "digitalocean",
        "ovh",
        "hetzner",
        "meta",
        "facebook",
        "leaseweb",
        "g-core",
        "gcore",
        "stackpath",
        "ddos-guard",
        "ddos guard",
        "qrator",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Application configuration, validated once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input partition root (`part_dir/YYYY/YYYY-MM.csv` or `part_dir/*.csv`)
    pub part_dir: PathBuf,
    /// Output root, mirroring the input subfolder structure
    pub out_dir: PathBuf,
    /// Append-only JSONL cache log, shared across shards
    pub cache_path: PathBuf,

    /// Concurrent lookup tasks
    pub workers: usize,
    /// Steady-state queries per second for this shard
    pub qps: f64,
    /// Token bucket capacity
    pub burst: u32,
    /// Per-IP attempt ceiling before a failure becomes terminal
    pub max_attempts: u32,
    /// Per-attempt HTTP timeout in seconds
    pub timeout_secs: u64,
    /// Cap on fresh lookups per input file, 0 for unlimited
    pub lookup_budget: usize,

    /// Treat cached failures as lookup candidates again
    pub retry_failed_cache: bool,
    /// Re-query cached successes whose country field is empty
    pub retry_empty_country: bool,

    /// Number of independent shards; aggregate query rate is
    /// `qps * shard_total`, budgeted by the operator
    pub shard_total: u32,
    /// This process's shard index, `0 <= shard_index < shard_total`
    pub shard_index: u32,
    /// Skip input files whose output already exists
    pub skip_if_exists: bool,

    /// When non-empty, only rows whose existing country code is listed
    /// contribute lookup candidates
    #[serde(default)]
    pub country_allowlist: Vec<String>,

    /// Drop infrastructure IPs from lookup candidacy
    pub cdn_filter_enabled: bool,
    /// Known CDN/cloud ASNs
    #[serde(default = "default_cdn_asns")]
    pub cdn_asns: Vec<u32>,
    /// Organization name substrings marking infrastructure
    #[serde(default = "default_cdn_org_keys")]
    pub cdn_org_keys: Vec<String>,
    /// Domain substrings marking infrastructure
    #[serde(default = "default_cdn_domain_keys")]
    pub cdn_domain_keys: Vec<String>,
}

impl Config {
    /// Reject misconfigurations that would silently produce an
    /// incomplete or duplicated dataset
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.shard_total == 0 {
            return Err(ConfigValidationError::ZeroShards);
        }
        if self.shard_index >= self.shard_total {
            return Err(ConfigValidationError::ShardOutOfRange {
                index: self.shard_index,
                total: self.shard_total,
            });
        }
        if self.workers == 0 {
            return Err(ConfigValidationError::ZeroWorkers);
        }
        if self.qps <= 0.0 {
            return Err(ConfigValidationError::NonPositiveQps(self.qps));
        }
        if self.burst == 0 {
            return Err(ConfigValidationError::ZeroBurst);
        }
        if self.max_attempts == 0 {
            return Err(ConfigValidationError::ZeroAttempts);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            part_dir: PathBuf::from("data/enriched_monthly"),
            out_dir: PathBuf::from("data/enriched_monthly_rdap"),
            cache_path: PathBuf::from("data/rdap_cache.jsonl"),
            workers: 48,
            qps: 12.0,
            burst: 36,
            max_attempts: 6,
            timeout_secs: 12,
            lookup_budget: 0,
            retry_failed_cache: true,
            retry_empty_country: true,
            shard_total: 1,
            shard_index: 0,
            skip_if_exists: true,
            country_allowlist: Vec::new(),
            cdn_filter_enabled: true,
            cdn_asns: default_cdn_asns(),
            cdn_org_keys: default_cdn_org_keys(),
            cdn_domain_keys: default_cdn_domain_keys(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_shard_index_out_of_range_is_fatal() {
        let config = Config {
            shard_total: 4,
            shard_index: 4,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::ShardOutOfRange { index: 4, total: 4 })
        ));
    }

    #[test]
    fn test_zero_workers_is_fatal() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::ZeroWorkers)
        ));
    }

    #[test]
    fn test_failure_result_carries_classified_error() {
        let result = RdapResult::failure(LookupErrorKind::Timeout, "deadline exceeded");
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("timeout: deadline exceeded"));
        assert_eq!(result.country(), "");
    }
}
