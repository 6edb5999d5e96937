//! Country consensus resolution.
//!
//! This module reconciles the two independent country attributions for
//! an IP (the commercial GeoIP database and the authoritative registry
//! record) into a single consensus label plus the rule that produced it.

use serde::{Deserialize, Serialize};

use crate::models::RdapResult;
use crate::utils::normalize_country_code;

/// Which branch of the reconciliation produced the consensus label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusRule {
    /// Both sources present and equal
    #[serde(rename = "agree")]
    Agree,
    /// Only the GeoIP attribution is available (covers the
    /// no-data-at-all case, where the consensus is empty)
    #[serde(rename = "geoip-only")]
    GeoipOnly,
    /// Only the registry attribution is available
    #[serde(rename = "rdap-only")]
    RdapOnly,
    /// Both present but different; registry data wins
    #[serde(rename = "disagree-prefer-rdap")]
    DisagreePreferRdap,
}

impl ConsensusRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusRule::Agree => "agree",
            ConsensusRule::GeoipOnly => "geoip-only",
            ConsensusRule::RdapOnly => "rdap-only",
            ConsensusRule::DisagreePreferRdap => "disagree-prefer-rdap",
        }
    }

    /// Downstream consumers that only trust corroborated labels keep
    /// rows where both sources agree.
    pub fn is_strict(&self) -> bool {
        matches!(self, ConsensusRule::Agree)
    }
}

impl std::fmt::Display for ConsensusRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the consensus country for one row.
///
/// A total function of the GeoIP country and the lookup result: a
/// failed or absent lookup degrades to the GeoIP label, a successful
/// lookup with an empty country field counts as "registry country
/// absent", and when both sources disagree the registry wins.
pub fn resolve(geoip_cc: &str, rdap: Option<&RdapResult>) -> (String, ConsensusRule) {
    let mm = normalize_country_code(geoip_cc);
    let rd = rdap
        .map(|r| normalize_country_code(r.country()))
        .unwrap_or_default();

    match (mm.is_empty(), rd.is_empty()) {
        (_, true) => (mm, ConsensusRule::GeoipOnly),
        (true, false) => (rd, ConsensusRule::RdapOnly),
        (false, false) if mm == rd => (mm, ConsensusRule::Agree),
        (false, false) => (rd, ConsensusRule::DisagreePreferRdap),
    }
}
