//! Suricata EVE alert normalization.
//!
//! Only `event_type == "alert"` records survive. The signature's ET category
//! (second whitespace token of an `ET `-prefixed signature) is matched against
//! the configured deny/allow category lists before the record becomes an
//! [`Event`].

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::config::SocConfig;
use crate::types::Event;

/// Category-filtering normalizer for the intrusion sensor schema.
#[derive(Debug, Clone)]
pub struct SuricataNormalizer {
    /// Empty set = allow everything (deny list still applies)
    allowed: HashSet<String>,
    denied: HashSet<String>,
}

impl SuricataNormalizer {
    pub fn new(soc: &SocConfig) -> Self {
        Self {
            allowed: soc.allowed_categories.iter().map(|c| normalize_category(c)).collect(),
            denied: soc.denied_categories.iter().map(|c| normalize_category(c)).collect(),
        }
    }

    /// Parse one raw log line into an event, or drop it.
    pub fn parse_line(&self, line: &str) -> Option<Event> {
        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!("Skipping malformed EVE line: {e}");
                return None;
            }
        };

        if record.get("event_type").and_then(Value::as_str) != Some("alert") {
            return None;
        }

        let alert = record.get("alert")?;
        let signature = alert.get("signature").and_then(Value::as_str).unwrap_or("").to_string();

        if let Some(category) = et_category(&signature) {
            // Deny wins over allow
            if self.denied.contains(&category) {
                return None;
            }
            if !self.allowed.is_empty() && !self.allowed.contains(&category) {
                return None;
            }
        }

        let severity = alert
            .get("severity")
            .and_then(Value::as_u64)
            .map(|s| s.min(5) as u8)
            .unwrap_or(3);

        // Carry the printable payload and HTTP metadata alongside the alert
        // object so the payload and hostname features survive into scoring.
        let mut details = alert.clone();
        if let Some(obj) = details.as_object_mut() {
            for key in ["payload_printable", "http"] {
                if let Some(value) = record.get(key) {
                    obj.insert(key.to_string(), value.clone());
                }
            }
        }

        Some(Event {
            name: "alert".to_string(),
            severity,
            signature,
            src_ip: record.get("src_ip").and_then(Value::as_str).map(str::to_string),
            dest_ip: record.get("dest_ip").and_then(Value::as_str).map(str::to_string),
            dest_port: record
                .get("dest_port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok()),
            proto: record
                .get("proto")
                .and_then(Value::as_str)
                .map(|p| p.to_ascii_lowercase()),
            timestamp: record.get("timestamp").and_then(Value::as_str).map(str::to_string),
            details,
        })
    }
}

/// ET category of a signature: the second whitespace token of an
/// `ET `-prefixed signature, normalized; anything else is uncategorized.
pub fn et_category(signature: &str) -> Option<String> {
    if !signature.starts_with("ET ") {
        return None;
    }
    signature.split_whitespace().nth(1).map(normalize_category)
}

/// Lower-cased, underscores treated as spaces.
fn normalize_category(category: &str) -> String {
    category.replace('_', " ").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eve_line(signature: &str, severity: u8) -> String {
        serde_json::json!({
            "timestamp": "2025-06-01T12:00:00.000000+0000",
            "event_type": "alert",
            "src_ip": "203.0.113.9",
            "dest_ip": "10.0.0.5",
            "proto": "TCP",
            "dest_port": 443,
            "alert": {
                "signature": signature,
                "severity": severity,
                "metadata": { "confidence": ["High"] }
            }
        })
        .to_string()
    }

    fn default_normalizer() -> SuricataNormalizer {
        SuricataNormalizer::new(&SocConfig::default())
    }

    #[test]
    fn test_alert_record_survives() {
        let n = default_normalizer();
        let event = n.parse_line(&eve_line("ET MALWARE Trojan.Gen C2 Communication", 1)).unwrap();
        assert_eq!(event.name, "alert");
        assert_eq!(event.severity, 1);
        assert_eq!(event.src_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(event.dest_port, Some(443));
        assert_eq!(event.proto.as_deref(), Some("tcp"));
        assert!(event.details.get("signature").is_some());
    }

    #[test]
    fn test_non_alert_records_dropped() {
        let n = default_normalizer();
        let line = r#"{"event_type":"flow","src_ip":"1.2.3.4"}"#;
        assert!(n.parse_line(line).is_none());
    }

    #[test]
    fn test_malformed_json_dropped() {
        let n = default_normalizer();
        assert!(n.parse_line("{nope").is_none());
        assert!(n.parse_line("").is_none());
    }

    #[test]
    fn test_et_category_extraction() {
        assert_eq!(et_category("ET MALWARE Trojan.Gen"), Some("malware".to_string()));
        assert_eq!(et_category("ET Web_Server possible sqli"), Some("web server".to_string()));
        assert_eq!(et_category("GPL ICMP ping"), None);
        assert_eq!(et_category(""), None);
    }

    #[test]
    fn test_denied_category_dropped() {
        let soc = SocConfig {
            denied_categories: vec!["INFO".to_string()],
            ..SocConfig::default()
        };
        let n = SuricataNormalizer::new(&soc);
        assert!(n.parse_line(&eve_line("ET INFO HTTPS request to CDN", 4)).is_none());
        assert!(n.parse_line(&eve_line("ET MALWARE Trojan.Gen", 1)).is_some());
    }

    #[test]
    fn test_allow_list_requires_membership() {
        let soc = SocConfig {
            allowed_categories: vec!["MALWARE".to_string(), "SCAN".to_string()],
            ..SocConfig::default()
        };
        let n = SuricataNormalizer::new(&soc);
        assert!(n.parse_line(&eve_line("ET MALWARE Trojan.Gen", 1)).is_some());
        assert!(n.parse_line(&eve_line("ET DOS amplification attempt", 2)).is_none());
        // Uncategorized signatures always pass the category filter
        assert!(n.parse_line(&eve_line("GPL ICMP ping", 3)).is_some());
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let soc = SocConfig {
            allowed_categories: vec!["MALWARE".to_string()],
            denied_categories: vec!["MALWARE".to_string()],
            ..SocConfig::default()
        };
        let n = SuricataNormalizer::new(&soc);
        assert!(n.parse_line(&eve_line("ET MALWARE Trojan.Gen", 1)).is_none());
    }
}
