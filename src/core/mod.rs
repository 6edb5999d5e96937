//! Core functionality for the RDAP enrichment pipeline.
//!
//! This module contains the core components of the pipeline,
//! including rate limiting, the registry cache, the lookup client,
//! infrastructure filtering, consensus resolution, and the sharded
//! orchestrator.

pub mod cache;
pub mod consensus;
pub mod filter;
pub mod lookup;
pub mod orchestrator;
pub mod rate_limiter;

pub use cache::RdapCache;
pub use consensus::{resolve, ConsensusRule};
pub use filter::InfrastructureFilter;
pub use lookup::{HttpRdapTransport, LookupClient, RdapTransport, ReusePolicy};
pub use orchestrator::{Orchestrator, RunSummary};
pub use rate_limiter::RateLimiter;
