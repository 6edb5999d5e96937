//! RDAP Enrichment Pipeline
//!
//! This crate enriches honeypot-observed session datasets with RDAP
//! registry metadata. Monthly CSV partitions are resolved against the
//! regional internet registries through a rate-limited, cached lookup
//! client, and each row gains a consensus country label reconciling the
//! pre-existing GeoIP attribution with the registry's answer.

pub mod config;
pub mod core;
pub mod models;
pub mod utils;
