/// Placeholder strings that mean "no country code" in the source data.
const CC_PLACEHOLDERS: &[&str] = &["", "NA", "N/A", "NONE", "NULL", "NAN"];

/// Normalize a raw country code field to an uppercase ISO-like code,
/// mapping known placeholder values to the empty string.
pub fn normalize_country_code(raw: &str) -> String {
    let cc = raw.trim().to_ascii_uppercase();
    if CC_PLACEHOLDERS.contains(&cc.as_str()) {
        String::new()
    } else {
        cc
    }
}

/// Parse an ASN column value, tolerating whitespace and an `AS` prefix.
pub fn parse_asn(raw: &str) -> Option<u32> {
    let s = raw.trim();
    let s = s.strip_prefix("AS").or_else(|| s.strip_prefix("as")).unwrap_or(s);
    s.parse().ok()
}
