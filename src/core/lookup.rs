//! RDAP lookup client for the enrichment pipeline.
//!
//! This module resolves IP addresses against the regional internet
//! registries through the RDAP bootstrap service, which redirects each
//! query to the responsible registry. Lookups are cache-first and
//! rate-limited; transient failures are retried with exponential
//! backoff and jitter, and every terminal outcome is written to the
//! cache exactly once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use metrics::{counter, histogram};
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::sleep;

use crate::core::cache::RdapCache;
use crate::core::rate_limiter::RateLimiter;
use crate::models::{LookupErrorKind, RdapResult};

/// Aggregated bootstrap endpoint; redirects to the responsible RIR
const RDAP_BOOTSTRAP_URL: &str = "https://rdap.org/ip";

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 16_000;
const JITTER_FRACTION: f64 = 0.2;

/// A classified transport-level failure
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportFailure {
    pub kind: LookupErrorKind,
    pub message: String,
}

impl TransportFailure {
    fn new(kind: LookupErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// RDAP IP network object, reduced to the fields the pipeline keeps
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct RdapNetwork {
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default, rename = "startAddress")]
    pub start_address: Option<String>,
    #[serde(default, rename = "endAddress")]
    pub end_address: Option<String>,
    #[serde(default, rename = "cidr0_cidrs")]
    pub cidrs: Vec<RdapCidr>,
}

/// One prefix from the RDAP `cidr0_cidrs` extension
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RdapCidr {
    #[serde(default)]
    pub v4prefix: Option<String>,
    #[serde(default)]
    pub v6prefix: Option<String>,
    #[serde(default)]
    pub length: Option<u8>,
}

/// A raw registry answer: the network object plus which RIR served it
#[derive(Debug, Clone)]
pub struct RdapAnswer {
    pub network: RdapNetwork,
    pub registry: Option<String>,
}

impl RdapAnswer {
    /// Normalize the registry answer into the persisted result shape
    pub fn into_result(self) -> RdapResult {
        let net = self.network;
        let net_cc = net
            .country
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty());
        let org = net.name.filter(|s| !s.trim().is_empty());
        let prefixes: Vec<String> = net
            .cidrs
            .iter()
            .filter_map(|c| {
                let prefix = c.v4prefix.as_deref().or(c.v6prefix.as_deref())?;
                Some(format!("{}/{}", prefix, c.length?))
            })
            .collect();
        let cidr = if !prefixes.is_empty() {
            Some(prefixes.join(","))
        } else {
            match (net.start_address, net.end_address) {
                (Some(start), Some(end)) => Some(format!("{} - {}", start, end)),
                _ => None,
            }
        };
        RdapResult {
            ok: true,
            net_cc,
            org,
            cidr,
            rir: self.registry,
            error: None,
        }
    }
}

/// One network query against the registry system.
///
/// The seam between the lookup policy (retries, caching, rate limiting)
/// and the wire protocol, so tests can drive the client with a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RdapTransport: Send + Sync {
    async fn fetch(&self, ip: &str) -> Result<RdapAnswer, TransportFailure>;
}

/// Production transport querying the RDAP bootstrap service over HTTPS
pub struct HttpRdapTransport {
    http: reqwest::Client,
}

impl HttpRdapTransport {
    /// Create a transport with the given per-attempt timeout
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rdap-enrichment/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

/// Identify the regional registry from the final (post-redirect) host
fn registry_from_host(host: Option<&str>) -> Option<String> {
    let host = host?;
    for (needle, rir) in [
        ("ripe", "ripe"),
        ("arin", "arin"),
        ("apnic", "apnic"),
        ("lacnic", "lacnic"),
        ("afrinic", "afrinic"),
    ] {
        if host.contains(needle) {
            return Some(rir.to_string());
        }
    }
    None
}

fn classify_send_error(err: &reqwest::Error) -> LookupErrorKind {
    if err.is_timeout() {
        LookupErrorKind::Timeout
    } else {
        LookupErrorKind::Unknown
    }
}

#[async_trait]
impl RdapTransport for HttpRdapTransport {
    async fn fetch(&self, ip: &str) -> Result<RdapAnswer, TransportFailure> {
        let url = format!("{}/{}", RDAP_BOOTSTRAP_URL, ip);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/rdap+json")
            .send()
            .await
            .map_err(|e| TransportFailure::new(classify_send_error(&e), e.to_string()))?;

        let registry = registry_from_host(response.url().host_str());
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransportFailure::new(
                LookupErrorKind::NotFound,
                format!("HTTP {}", status),
            ));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(TransportFailure::new(
                LookupErrorKind::RateLimited,
                format!("HTTP {}", status),
            ));
        }
        if !status.is_success() {
            return Err(TransportFailure::new(
                LookupErrorKind::Unknown,
                format!("HTTP {}", status),
            ));
        }

        let network = response.json::<RdapNetwork>().await.map_err(|e| {
            let kind = if e.is_timeout() {
                LookupErrorKind::Timeout
            } else {
                LookupErrorKind::Malformed
            };
            TransportFailure::new(kind, e.to_string())
        })?;

        Ok(RdapAnswer { network, registry })
    }
}

/// Governs whether a cached entry is final or a re-query candidate
#[derive(Debug, Clone, Copy)]
pub struct ReusePolicy {
    /// Treat cached failures as lookup candidates again
    pub retry_failed: bool,
    /// Re-query cached successes whose country field is empty
    pub retry_empty_country: bool,
}

impl ReusePolicy {
    pub fn is_final(&self, result: &RdapResult) -> bool {
        if result.ok {
            !(self.retry_empty_country && result.country().is_empty())
        } else {
            !self.retry_failed
        }
    }
}

/// Per-lookup retry progression
#[derive(Debug)]
enum LookupState {
    Pending,
    Retrying { attempt: u32 },
    Succeeded(RdapResult),
    FailedTerminal(RdapResult),
}

/// Cache-first, rate-limited RDAP lookup client
pub struct LookupClient {
    transport: Box<dyn RdapTransport>,
    limiter: RateLimiter,
    cache: Arc<RdapCache>,
    policy: ReusePolicy,
    max_attempts: u32,
}

impl LookupClient {
    pub fn new(
        transport: Box<dyn RdapTransport>,
        limiter: RateLimiter,
        cache: Arc<RdapCache>,
        policy: ReusePolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            transport,
            limiter,
            cache,
            policy,
            max_attempts,
        }
    }

    /// Whatever the cache holds for this IP, final or not
    pub fn cached(&self, ip: &str) -> Option<RdapResult> {
        self.cache.get(ip)
    }

    /// The cached result if the reuse policy considers it final
    pub fn cached_final(&self, ip: &str) -> Option<RdapResult> {
        self.cache.get(ip).filter(|r| self.policy.is_final(r))
    }

    /// Resolve one IP: served from cache when a final entry exists,
    /// otherwise queried over the network with retries. Each terminal
    /// outcome triggers exactly one cache write; per-IP failures are
    /// returned as negative results, never as errors.
    pub async fn lookup(&self, ip: &str) -> RdapResult {
        if let Some(hit) = self.cached_final(ip) {
            counter!("rdap_cache_hits_total", 1);
            return hit;
        }

        let result = self.query_with_retries(ip).await;
        if let Err(e) = self.cache.put(ip, result.clone()) {
            warn!("failed to persist cache entry for {}: {}", ip, e);
        }
        result
    }

    /// Drive the retry state machine to a terminal state
    async fn query_with_retries(&self, ip: &str) -> RdapResult {
        let mut state = LookupState::Pending;
        loop {
            state = match state {
                LookupState::Pending => self.attempt(ip, 1).await,
                LookupState::Retrying { attempt } => {
                    sleep(backoff_delay(attempt - 1)).await;
                    self.attempt(ip, attempt).await
                }
                LookupState::Succeeded(result) => break result,
                LookupState::FailedTerminal(result) => break result,
            };
        }
    }

    /// Issue one rate-limited query and classify the outcome
    async fn attempt(&self, ip: &str, attempt: u32) -> LookupState {
        self.limiter.acquire().await;
        counter!("rdap_queries_total", 1);
        let started = std::time::Instant::now();

        match self.transport.fetch(ip).await {
            Ok(answer) => {
                histogram!("rdap_query_duration_seconds", started.elapsed().as_secs_f64());
                LookupState::Succeeded(answer.into_result())
            }
            Err(failure) => {
                counter!("rdap_query_failures_total", 1, "kind" => failure.kind.as_str());
                if failure.kind == LookupErrorKind::NotFound {
                    LookupState::FailedTerminal(RdapResult::failure(failure.kind, &failure.message))
                } else if attempt >= self.max_attempts {
                    warn!("lookup for {} exhausted {} attempts: {}", ip, attempt, failure);
                    LookupState::FailedTerminal(RdapResult::failure(failure.kind, &failure.message))
                } else {
                    debug!("retrying {} after attempt {}: {}", ip, attempt, failure);
                    LookupState::Retrying {
                        attempt: attempt + 1,
                    }
                }
            }
        }
    }
}

/// Exponential backoff with jitter, so concurrent workers retrying at
/// the same time do not synchronize into a retry storm
fn backoff_delay(failed_attempts: u32) -> Duration {
    let shift = failed_attempts.saturating_sub(1).min(6);
    let base = (BACKOFF_BASE_MS << shift).min(BACKOFF_CAP_MS);
    let jitter = (base as f64 * rand::thread_rng().gen_range(0.0..JITTER_FRACTION)) as u64;
    Duration::from_millis(base + jitter)
}
