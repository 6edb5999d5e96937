//! CDN and cloud infrastructure classification.
//!
//! This module decides whether an IP belongs to known CDN/cloud
//! infrastructure, based on its ASN, organization name, and domain.
//! Infrastructure IPs can be excluded from registry lookups, since their
//! registration country says nothing about the traffic's origin.

use std::collections::HashSet;

/// Classifies IPs as CDN/cloud infrastructure from signature sets.
///
/// Matching is deterministic and side-effect free: an ASN allow-list
/// plus case-insensitive substring matches on organization and domain.
pub struct InfrastructureFilter {
    asns: HashSet<u32>,
    org_keys: Vec<String>,
    domain_keys: Vec<String>,
}

impl InfrastructureFilter {
    /// Build a filter from configured signature sets. Key lists are
    /// lowercased once here so classification is a pure lookup.
    pub fn new(asns: &[u32], org_keys: &[String], domain_keys: &[String]) -> Self {
        Self {
            asns: asns.iter().copied().collect(),
            org_keys: org_keys.iter().map(|k| k.to_lowercase()).collect(),
            domain_keys: domain_keys.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    /// Whether the record looks like CDN/cloud infrastructure
    pub fn is_infrastructure(&self, asn: Option<u32>, org: &str, domain: &str) -> bool {
        if let Some(asn) = asn {
            if self.asns.contains(&asn) {
                return true;
            }
        }
        if !org.is_empty() {
            let org = org.to_lowercase();
            if self.org_keys.iter().any(|k| org.contains(k)) {
                return true;
            }
        }
        if !domain.is_empty() {
            let domain = domain.to_lowercase();
            if self.domain_keys.iter().any(|k| domain.contains(k)) {
                return true;
            }
        }
        false
    }
}
