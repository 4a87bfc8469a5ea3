use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Current time as an ISO-8601 string (the wire format for all timestamps)
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an ISO-8601 timestamp, tolerating both offset and naive forms
pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive timestamps (no offset) are produced by some external writers
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    None
}

/// Age of a timestamp in whole days, or None if it cannot be parsed
pub fn days_old(timestamp: &str) -> Option<i64> {
    parse_iso(timestamp).map(|dt| (Utc::now() - dt).num_days())
}

/// Random 8-hex identifier with a prefix, e.g. `mission_3fa9c1d2`
pub fn short_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..8])
}

/// SHA-256 hex digest of raw bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic 16-hex id derived from source coordinates.
///
/// The same coordinates always yield the same id, which is what makes
/// re-ingestion of a mission report idempotent.
pub fn stable_id(coordinates: &str) -> String {
    sha256_hex(coordinates.as_bytes())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_id_is_deterministic() {
        let a = stable_id("m1_cycle_2_summary");
        let b = stable_id("m1_cycle_2_summary");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, stable_id("m1_cycle_3_summary"));
    }

    #[test]
    fn test_short_id_shape() {
        let id = short_id("mission");
        assert!(id.starts_with("mission_"));
        assert_eq!(id.len(), "mission_".len() + 8);
    }

    #[test]
    fn test_parse_iso_roundtrip() {
        let now = now_iso();
        assert!(parse_iso(&now).is_some());
    }

    #[test]
    fn test_parse_iso_naive() {
        assert!(parse_iso("2026-07-14T09:30:00.123456").is_some());
        assert!(parse_iso("not a timestamp").is_none());
    }
}
